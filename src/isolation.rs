use nix::errno::Errno;
use nix::sched::{self, CloneFlags};
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::fmt;
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::handshake::{HandshakeError, SetupResultChannel};
use crate::namespaces::NamespaceSet;
use crate::results::ResultKind;
use crate::signals;

/// Stack handed to a cloned child.
const CLONE_STACK_SIZE: usize = 256 * 1024;

/// How the child process is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IsolationStrategy {
    /// Plain `fork()`; the namespace set is ignored.
    Plain,
    /// `clone()` with the namespace flags, terminating with `SIGCHLD` like a fork.
    Clone,
    /// `fork()`, then `unshare()` inside the child.
    Unshare,
}

impl IsolationStrategy {
    pub const ALL: [IsolationStrategy; 3] = [Self::Plain, Self::Clone, Self::Unshare];

    pub fn name(self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::Clone => "clone",
            Self::Unshare => "unshare",
        }
    }
}

impl fmt::Display for IsolationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for IsolationStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "plain" | "fork" => Ok(Self::Plain),
            "clone" => Ok(Self::Clone),
            "unshare" => Ok(Self::Unshare),
            other => Err(format!(
                "unknown isolation strategy '{other}' (expected plain, clone or unshare)"
            )),
        }
    }
}

#[derive(Debug, Error)]
pub enum IsolationError {
    #[error("{strategy} isolation setup failed{}", describe_errno(.errno))]
    Setup {
        strategy: IsolationStrategy,
        errno: Option<Errno>,
    },
    #[error("fork failed: {0}")]
    Fork(#[source] Errno),
    #[error("setup result channel failed: {0}")]
    Channel(#[from] HandshakeError),
    #[error("waiting for child failed: {0}")]
    Wait(#[source] Errno),
}

fn describe_errno(errno: &Option<Errno>) -> String {
    match errno {
        Some(e) => format!(": {} ({})", e, e.desc()),
        None => String::new(),
    }
}

impl IsolationError {
    /// The isolation mechanism itself was refused, as opposed to a failure
    /// of the fork/pipe/wait plumbing around it.
    pub fn is_setup_failure(&self) -> bool {
        matches!(self, Self::Setup { .. })
    }

    /// Setup was refused in a way that means the kernel or the caller's
    /// privileges do not support the requested namespaces.
    pub fn is_unsupported(&self) -> bool {
        matches!(
            self,
            Self::Setup {
                errno: Some(Errno::EINVAL | Errno::ENOSYS | Errno::EPERM),
                ..
            }
        )
    }

    pub fn errno(&self) -> Option<Errno> {
        match self {
            Self::Setup { errno, .. } => *errno,
            Self::Fork(e) | Self::Wait(e) => Some(*e),
            Self::Channel(_) => None,
        }
    }
}

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    Exited(i32),
    Signaled(Signal),
}

impl ChildExit {
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Exited(code) => Some(*code),
            Self::Signaled(_) => None,
        }
    }

    pub fn success(&self) -> bool {
        *self == Self::Exited(0)
    }
}

impl fmt::Display for ChildExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with status {code}"),
            Self::Signaled(sig) => write!(f, "killed by {sig}"),
        }
    }
}

/// Handle on a running child, given to the continuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildProcess {
    pid: Pid,
}

impl ChildProcess {
    /// Handle on a child this process forked by other means.
    pub fn from_pid(pid: Pid) -> Self {
        Self { pid }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Blocks until the child terminates and reaps it.
    pub fn wait(&self) -> Result<ChildExit, Errno> {
        loop {
            match waitpid(self.pid, None) {
                Ok(WaitStatus::Exited(_, code)) => return Ok(ChildExit::Exited(code)),
                Ok(WaitStatus::Signaled(_, sig, _)) => return Ok(ChildExit::Signaled(sig)),
                Ok(_) => continue,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

/// Result of a run whose isolation setup succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The continuation returned this value, or the child exited 0 when
    /// there was no continuation.
    Completed(i32),
    /// No continuation was given and the child's own logic failed.
    ChildFailed { pid: Pid, exit: ChildExit },
}

/// The kernel calls that put a process into new namespaces.
pub trait NamespaceBackend {
    /// Moves the calling process into new namespaces.
    fn unshare(&self, namespaces: NamespaceSet) -> nix::Result<()>;

    /// Starts a child in new namespaces running `child`, whose return value
    /// becomes the child's exit status.
    fn clone_child(&self, namespaces: NamespaceSet, child: &mut dyn FnMut() -> isize)
        -> nix::Result<Pid>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct KernelBackend;

impl NamespaceBackend for KernelBackend {
    fn unshare(&self, namespaces: NamespaceSet) -> nix::Result<()> {
        sched::unshare(namespaces.clone_flags())
    }

    fn clone_child(
        &self,
        namespaces: NamespaceSet,
        child: &mut dyn FnMut() -> isize,
    ) -> nix::Result<Pid> {
        let mut stack = vec![0u8; CLONE_STACK_SIZE];
        let flags: CloneFlags = namespaces.clone_flags();
        // SAFETY: the child gets a private copy of the address space (no
        // CLONE_VM), so it behaves like a forked child running `child` on
        // its own copy of `stack`.
        unsafe {
            sched::clone(
                Box::new(move || child()),
                &mut stack,
                flags,
                Some(libc::SIGCHLD),
            )
        }
    }
}

/// Runs a child function under one of the isolation strategies.
///
/// Setup failures (the clone or unshare call was refused) come back as
/// [`IsolationError::Setup`]; failures of the child's own logic come back
/// as [`RunOutcome::ChildFailed`] or through the continuation's result.
#[derive(Debug, Clone, Default)]
pub struct IsolationRunner<B = KernelBackend> {
    backend: B,
}

impl IsolationRunner {
    pub fn new() -> Self {
        Self {
            backend: KernelBackend,
        }
    }
}

impl<B: NamespaceBackend> IsolationRunner<B> {
    pub fn with_backend(backend: B) -> Self {
        Self { backend }
    }

    /// Starts `child` in a new process and then runs `continuation`.
    ///
    /// # Arguments
    /// * `strategy` - How the child process is created
    /// * `namespaces` - Namespaces to isolate (ignored for `Plain`)
    /// * `child` - Body of the child; its return value is the exit status
    /// * `continuation` - Runs in the parent once the child has started. It
    ///   owns the child and is responsible for waiting on it.
    ///
    /// # Returns
    /// * `Result<RunOutcome, IsolationError>` - The continuation's result, or
    ///   the child's exit when there is no continuation
    pub fn run<C, K>(
        &self,
        strategy: IsolationStrategy,
        namespaces: NamespaceSet,
        child: C,
        continuation: Option<K>,
    ) -> Result<RunOutcome, IsolationError>
    where
        C: FnOnce() -> i32,
        K: FnOnce(ChildProcess) -> i32,
    {
        debug!("starting {} child (namespaces: {})", strategy, namespaces);
        let pid = match strategy {
            IsolationStrategy::Plain => self.spawn_plain(child)?,
            IsolationStrategy::Clone => self.spawn_clone(namespaces, child)?,
            IsolationStrategy::Unshare => self.spawn_unshare(namespaces, child)?,
        };
        let handle = ChildProcess { pid };
        info!("{} child started with PID {}", strategy, pid);

        match continuation {
            Some(continuation) => Ok(RunOutcome::Completed(continuation(handle))),
            None => {
                let exit = handle.wait().map_err(IsolationError::Wait)?;
                debug!("child {} {}", pid, exit);
                if exit.success() {
                    Ok(RunOutcome::Completed(0))
                } else {
                    Ok(RunOutcome::ChildFailed { pid, exit })
                }
            }
        }
    }

    /// [`run`](Self::run) without a continuation.
    pub fn run_and_wait<C>(
        &self,
        strategy: IsolationStrategy,
        namespaces: NamespaceSet,
        child: C,
    ) -> Result<RunOutcome, IsolationError>
    where
        C: FnOnce() -> i32,
    {
        self.run(strategy, namespaces, child, None::<fn(ChildProcess) -> i32>)
    }

    fn spawn_plain<C: FnOnce() -> i32>(&self, child: C) -> Result<Pid, IsolationError> {
        // SAFETY: the child only runs the caller's body and then `_exit`s.
        match unsafe { fork() }.map_err(IsolationError::Fork)? {
            ForkResult::Parent { child } => Ok(child),
            ForkResult::Child => finish_child(child),
        }
    }

    fn spawn_clone<C: FnOnce() -> i32>(
        &self,
        namespaces: NamespaceSet,
        child: C,
    ) -> Result<Pid, IsolationError> {
        let mut body = Some(child);
        let mut trampoline = || match body.take() {
            Some(body) => finish_child(body),
            None => ResultKind::Brok.exit_code() as isize,
        };
        self.backend
            .clone_child(namespaces, &mut trampoline)
            .map_err(|errno| {
                warn!("clone({}) failed: {}", namespaces, errno);
                IsolationError::Setup {
                    strategy: IsolationStrategy::Clone,
                    errno: Some(errno),
                }
            })
    }

    fn spawn_unshare<C: FnOnce() -> i32>(
        &self,
        namespaces: NamespaceSet,
        child: C,
    ) -> Result<Pid, IsolationError> {
        let mut setup = SetupResultChannel::create()?;

        // SAFETY: the child only unshares, reports, runs the body and `_exit`s.
        let pid = match unsafe { fork() }.map_err(IsolationError::Fork)? {
            ForkResult::Parent { child } => child,
            ForkResult::Child => match self.backend.unshare(namespaces) {
                Ok(()) => {
                    if setup.report(true).is_err() {
                        exit_now(ResultKind::Brok.exit_code());
                    }
                    finish_child(child)
                }
                Err(errno) => {
                    let _ = setup.report(false);
                    exit_now(errno as i32)
                }
            },
        };

        // Nothing about the child matters until we know it isolated itself.
        let reported = setup.receive();
        let handle = ChildProcess { pid };
        match reported {
            Ok(true) => Ok(pid),
            Ok(false) | Err(HandshakeError::Closed) => {
                let exit = handle.wait().map_err(IsolationError::Wait)?;
                let errno = exit.code().filter(|c| *c > 0).map(Errno::from_raw);
                warn!("unshare({}) failed in child {}: {}", namespaces, pid, exit);
                Err(IsolationError::Setup {
                    strategy: IsolationStrategy::Unshare,
                    errno,
                })
            }
            Err(e) => {
                let _ = handle.wait();
                Err(e.into())
            }
        }
    }
}

/// Runs the child body and terminates the child with its result. A panic
/// in the body is a broken test.
fn finish_child<C: FnOnce() -> i32>(child: C) -> ! {
    signals::after_fork_in_child();
    let code = panic::catch_unwind(AssertUnwindSafe(child))
        .unwrap_or_else(|_| ResultKind::Brok.exit_code());
    exit_now(code)
}

fn exit_now(code: i32) -> ! {
    let _ = std::io::stdout().flush();
    // SAFETY: `_exit` skips atexit handlers and destructors that belong to
    // the parent's copy of the process state.
    unsafe { libc::_exit(code) }
}
