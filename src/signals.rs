//! Fault handling, the pre-test pause, and what forked children inherit.
//!
//! The dispositions live in a [`SignalTable`] owned by the test context.
//! Installing the table hands the handler the few values it needs through
//! atomics, since a signal handler cannot reach the context itself.

use nix::errno::Errno;
use nix::sys::signal::{pthread_sigmask, sigaction, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};
use nix::unistd::getpid;
use std::collections::BTreeMap;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicPtr, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use thiserror::Error;
use tracing::{debug, info};

use crate::results::ResultKind;

/// Signal an operator sends to release [`pause_until_released`].
pub const RELEASE_SIGNAL: Signal = Signal::SIGUSR1;

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("failed to install handler for {signal}: {source}")]
    Install { signal: Signal, source: Errno },
    #[error("failed to change the signal mask: {0}")]
    Mask(#[source] Errno),
    #[error("waiting for {signal} failed: {source}")]
    Wait { signal: Signal, source: Errno },
}

/// Whether the test body forks children of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkMode {
    /// Handlers stay with this process; children get default dispositions.
    NoFork,
    /// Children inherit the handlers but never run the owner's cleanup.
    Fork,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Run the owner's cleanup, then exit with the BROK status.
    Fatal,
    Default,
}

const MODE_UNSET: u8 = 0;
const MODE_NOFORK: u8 = 1;
const MODE_FORK: u8 = 2;

static OWNER_PID: AtomicI32 = AtomicI32::new(0);
static INSTALLED_MODE: AtomicU8 = AtomicU8::new(MODE_UNSET);
static CLEANUP_HOOK: AtomicUsize = AtomicUsize::new(0);
static FAULT_WORKSPACE: AtomicPtr<CString> = AtomicPtr::new(ptr::null_mut());
/// Bit `n` set when signal `n` has the fatal handler installed.
static FATAL_SIGNALS: AtomicU64 = AtomicU64::new(0);
static FAULT_TCID: AtomicPtr<u8> = AtomicPtr::new(ptr::null_mut());
static FAULT_TCID_LEN: AtomicUsize = AtomicUsize::new(0);
static LAST_CASE_NUMBER: AtomicU32 = AtomicU32::new(0);

const DEFAULT_TCID: &str = "kharness";

/// Per-signal dispositions for one test process.
#[derive(Debug, Clone)]
pub struct SignalTable {
    tcid: &'static str,
    mode: ForkMode,
    entries: BTreeMap<Signal, Disposition>,
}

impl SignalTable {
    /// Faults and termination requests are fatal; everything else default.
    pub fn standard(mode: ForkMode) -> Self {
        let entries = [
            Signal::SIGSEGV,
            Signal::SIGBUS,
            Signal::SIGILL,
            Signal::SIGFPE,
            Signal::SIGSYS,
            Signal::SIGHUP,
            Signal::SIGINT,
            Signal::SIGQUIT,
            Signal::SIGTERM,
        ]
        .into_iter()
        .map(|s| (s, Disposition::Fatal))
        .collect();
        Self {
            tcid: DEFAULT_TCID,
            mode,
            entries,
        }
    }

    /// Names the test in the line the fatal handler prints.
    pub fn named(mut self, tcid: &'static str) -> Self {
        self.tcid = tcid;
        self
    }

    pub fn set(&mut self, signal: Signal, disposition: Disposition) {
        self.entries.insert(signal, disposition);
    }

    pub fn disposition(&self, signal: Signal) -> Disposition {
        self.entries
            .get(&signal)
            .copied()
            .unwrap_or(Disposition::Default)
    }

    /// Installs every entry and makes the calling process the owner of
    /// `cleanup`. Must happen before any fork whose child should inherit it.
    pub fn install(&self, cleanup: Option<fn()>) -> Result<(), SignalError> {
        OWNER_PID.store(getpid().as_raw(), Ordering::SeqCst);
        CLEANUP_HOOK.store(cleanup.map_or(0, |f| f as usize), Ordering::SeqCst);
        INSTALLED_MODE.store(
            match self.mode {
                ForkMode::NoFork => MODE_NOFORK,
                ForkMode::Fork => MODE_FORK,
            },
            Ordering::SeqCst,
        );

        FAULT_TCID_LEN.store(self.tcid.len(), Ordering::SeqCst);
        FAULT_TCID.store(self.tcid.as_ptr().cast_mut(), Ordering::SeqCst);

        let mut fatal = 0u64;
        for (&signal, &disposition) in &self.entries {
            let handler = match disposition {
                Disposition::Fatal => {
                    fatal |= signal_bit(signal);
                    SigHandler::Handler(on_fatal_signal)
                }
                Disposition::Default => SigHandler::SigDfl,
            };
            set_handler(signal, handler)?;
        }
        FATAL_SIGNALS.store(fatal, Ordering::SeqCst);
        info!("installed signal table ({:?} mode, {} entries)", self.mode, self.entries.len());
        Ok(())
    }

    /// Puts every signal this table touched back to its default action.
    pub fn restore(&self) -> Result<(), SignalError> {
        for &signal in self.entries.keys() {
            set_handler(signal, SigHandler::SigDfl)?;
        }
        FATAL_SIGNALS.store(0, Ordering::SeqCst);
        Ok(())
    }
}

fn signal_bit(signal: Signal) -> u64 {
    1u64 << (signal as i32 as u32 % 64)
}

fn set_handler(signal: Signal, handler: SigHandler) -> Result<(), SignalError> {
    let action = SigAction::new(handler, SaFlags::SA_RESTART, SigSet::empty());
    // SAFETY: the only handler installed is `on_fatal_signal`, which never
    // returns and touches nothing but atomics before exiting.
    unsafe { sigaction(signal, &action) }
        .map(drop)
        .map_err(|source| SignalError::Install { signal, source })
}

/// Makes the calling process the owner of the installed cleanup, as the
/// concurrently running copies do right after they are forked.
pub fn adopt_current_process() {
    OWNER_PID.store(getpid().as_raw(), Ordering::SeqCst);
}

/// Whether the calling process is the one that installed the table.
pub fn is_owner() -> bool {
    OWNER_PID.load(Ordering::SeqCst) == getpid().as_raw()
}

/// Applies the installed table's inheritance rule inside a fresh child.
///
/// In [`ForkMode::Fork`] the handlers stay (they already refuse to run the
/// owner's cleanup in a non-owner). In [`ForkMode::NoFork`] every signal the
/// table made fatal reverts to the default action.
pub fn after_fork_in_child() {
    if INSTALLED_MODE.load(Ordering::SeqCst) != MODE_NOFORK {
        return;
    }
    let fatal = FATAL_SIGNALS.swap(0, Ordering::SeqCst);
    for signal in Signal::iterator().filter(|s| fatal & signal_bit(*s) != 0) {
        let _ = set_handler(signal, SigHandler::SigDfl);
    }
}

/// Remembers the number of the last reported case, so a fault line
/// continues the numbering.
pub fn note_case_number(number: u32) {
    LAST_CASE_NUMBER.store(number, Ordering::SeqCst);
}

/// Stops the fatal handler from running the cleanup callback, once the
/// regular cleanup path has started.
pub fn disarm_cleanup() {
    CLEANUP_HOOK.store(0, Ordering::SeqCst);
}

/// Tells the fatal handler which directory to remove, or none.
pub fn register_fault_workspace(path: Option<&Path>) {
    let new = path
        .and_then(|p| CString::new(p.as_os_str().as_bytes()).ok())
        .map_or(ptr::null_mut(), |c| Box::into_raw(Box::new(c)));
    let old = FAULT_WORKSPACE.swap(new, Ordering::SeqCst);
    if !old.is_null() {
        // SAFETY: every non-null value stored came from Box::into_raw above
        // and was swapped out exactly once.
        drop(unsafe { Box::from_raw(old) });
    }
}

extern "C" fn on_fatal_signal(signum: libc::c_int) {
    if is_owner() {
        let hook = CLEANUP_HOOK.swap(0, Ordering::SeqCst);
        if hook != 0 {
            // SAFETY: the value was stored from a `fn()` in install().
            let cleanup: fn() = unsafe { std::mem::transmute::<usize, fn()>(hook) };
            cleanup();
        }
        let workspace = FAULT_WORKSPACE.swap(ptr::null_mut(), Ordering::SeqCst);
        if !workspace.is_null() {
            // SAFETY: set by register_fault_workspace; the process is about
            // to exit so the box is deliberately leaked.
            let path = unsafe { &*workspace };
            let _ = std::fs::remove_dir_all(Path::new(std::ffi::OsStr::from_bytes(path.as_bytes())));
        }
    }

    let tcid_ptr = FAULT_TCID.load(Ordering::SeqCst);
    let tcid: &[u8] = if tcid_ptr.is_null() {
        DEFAULT_TCID.as_bytes()
    } else {
        // SAFETY: stored from a `&'static str` in install().
        unsafe { std::slice::from_raw_parts(tcid_ptr, FAULT_TCID_LEN.load(Ordering::SeqCst)) }
    };
    let number = LAST_CASE_NUMBER.load(Ordering::SeqCst).saturating_add(1);
    let line = FaultLine::format(tcid, number, signum);
    // SAFETY: write and _exit are async-signal-safe.
    unsafe {
        libc::write(libc::STDOUT_FILENO, line.as_bytes().as_ptr().cast(), line.len);
        libc::_exit(ResultKind::Brok.exit_code());
    }
}

/// The BROK result line for a fatal signal, built without allocating.
struct FaultLine {
    buf: [u8; 128],
    len: usize,
}

impl FaultLine {
    /// Same layout as [`Outcome::render`](crate::results::Outcome::render):
    /// `<tcid> <number>  BROK  :  unexpected signal <n>`.
    fn format(tcid: &[u8], number: u32, signum: libc::c_int) -> Self {
        let mut line = Self {
            buf: [0; 128],
            len: 0,
        };
        let tcid = &tcid[..tcid.len().min(64)];
        line.push(tcid);
        for _ in tcid.len()..8 {
            line.push(b" ");
        }
        line.push(b" ");
        line.push_number(u64::from(number), 4);
        line.push(b"  BROK  :  unexpected signal ");
        line.push_number(u64::from(signum.unsigned_abs()), 0);
        line.push(b"\n");
        line
    }

    fn push(&mut self, bytes: &[u8]) {
        let n = bytes.len().min(self.buf.len() - self.len);
        self.buf[self.len..self.len + n].copy_from_slice(&bytes[..n]);
        self.len += n;
    }

    /// Decimal digits, right-aligned in `width` columns.
    fn push_number(&mut self, mut n: u64, width: usize) {
        let mut digits = [0u8; 20];
        let mut count = 0;
        loop {
            digits[count] = b'0' + (n % 10) as u8;
            count += 1;
            n /= 10;
            if n == 0 {
                break;
            }
        }
        for _ in count..width {
            self.push(b" ");
        }
        for i in (0..count).rev() {
            self.push(&[digits[i]]);
        }
    }

    fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

/// Blocks until [`RELEASE_SIGNAL`] arrives. There is no timeout.
///
/// The signal is blocked first and collected with `sigwait`, so one sent
/// before the wait starts is not lost.
pub fn pause_until_released() -> Result<(), SignalError> {
    let mut wanted = SigSet::empty();
    wanted.add(RELEASE_SIGNAL);

    let mut previous = SigSet::empty();
    pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&wanted), Some(&mut previous))
        .map_err(SignalError::Mask)?;

    info!("pausing until {} is received (pid {})", RELEASE_SIGNAL, getpid());
    let waited = wanted.wait();

    pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&previous), None).map_err(SignalError::Mask)?;

    let got = waited.map_err(|source| SignalError::Wait {
        signal: RELEASE_SIGNAL,
        source,
    })?;
    debug!("released by {}", got);
    Ok(())
}
