type Result<T> = color_eyre::eyre::Result<T>;

use eyre::eyre;
use kharness::{
    ChildProcess, ForkMode, HandshakeChannel, IsolationRunner, IsolationStrategy, Namespace,
    NamespaceSet, OptionSpec, Outcome, ResultKind, RunOutcome, TestContext,
};
use nix::errno::Errno;
use nix::sys::signal::{raise, Signal};
use std::cell::{Cell, RefCell};
use std::ffi::CString;
use tracing::{debug, info};

const TCID: &str = "kprobe";

const OPTIONS: &[OptionSpec] = &[
    OptionSpec::new("s:", "Run an isolated child with STRATEGY (plain, clone, unshare)")
        .validator(check_strategy),
    OptionSpec::new("n:", "Namespaces for the child, comma separated (uts,ipc,net,...)")
        .validator(check_namespaces),
    OptionSpec::new("F", "Raise SIGSEGV during the first iteration"),
    OptionSpec::new("S", "Report the run as not applicable"),
];

fn check_strategy(value: &str) -> std::result::Result<(), String> {
    value.parse::<IsolationStrategy>().map(drop)
}

fn check_namespaces(value: &str) -> std::result::Result<(), String> {
    value.parse::<NamespaceSet>().map(drop)
}

fn cleanup() {
    debug!("probe cleanup");
}

/// Child run requested by `-s`/`-n`.
struct IsolationPlan {
    strategy: IsolationStrategy,
    namespaces: NamespaceSet,
}

impl IsolationPlan {
    fn from_context(ctx: &TestContext) -> Result<Option<Self>> {
        let namespaces = match ctx.config().arg('n') {
            Some(list) => list.parse::<NamespaceSet>().map_err(|e| eyre!(e))?,
            None => NamespaceSet::empty(),
        };
        let strategy = match ctx.config().arg('s') {
            Some(name) => name.parse::<IsolationStrategy>().map_err(|e| eyre!(e))?,
            None if namespaces.is_empty() => return Ok(None),
            None => IsolationStrategy::Unshare,
        };
        Ok(Some(Self {
            strategy,
            namespaces,
        }))
    }

    fn isolates(&self) -> bool {
        self.strategy != IsolationStrategy::Plain
    }
}

fn main() -> Result<()> {
    color_eyre::install()?;
    kharness::init_tracing();

    let mut ctx = TestContext::init(TCID, OPTIONS);
    let plan = IsolationPlan::from_context(&ctx)?;
    let mode = if plan.is_some() {
        ForkMode::Fork
    } else {
        ForkMode::NoFork
    };

    ctx.setup(mode, Some(cleanup));
    if ctx.config().flag('S') {
        ctx.res(Outcome::conf("not applicable on request"));
    }
    ctx.begin();
    ctx.make_workspace();
    ctx.set_expected_errnos(&[Errno::EEXIST]);

    info!("probe starting (copy {})", ctx.copy_index());
    while ctx.looping() {
        let turn = ctx.iteration();
        if turn == 1 && ctx.config().flag('F') {
            let _ = raise(Signal::SIGSEGV);
        }

        check_getpid(&mut ctx);
        check_workspace_file(&mut ctx, turn);
        check_mkdir_twice(&mut ctx, turn);
        if let Some(plan) = &plan {
            check_isolation(&mut ctx, plan);
        }
    }

    ctx.exit()
}

fn check_getpid(ctx: &mut TestContext) {
    // SAFETY: getpid cannot fail and has no preconditions.
    let res = ctx.test(|| unsafe { libc::getpid() });
    if res.failed() {
        ctx.res_errno(ResultKind::Fail, "getpid failed");
    } else if !ctx.config().functional {
        ctx.res(Outcome::pass("getpid returned"));
    } else if res.ret == i64::from(std::process::id()) {
        ctx.res(Outcome::pass(format!("getpid returned {}", res.ret)));
    } else {
        ctx.res(Outcome::fail(format!(
            "getpid returned {}, expected {}",
            res.ret,
            std::process::id()
        )));
    }
}

fn check_workspace_file(ctx: &mut TestContext, turn: u32) {
    let name = format!("probe.{turn}");
    let payload = format!("iteration {turn}");
    if let Err(e) = std::fs::write(&name, &payload) {
        ctx.brk(Outcome::brok(format!("cannot write {name}: {e}")));
    }
    if !ctx.config().functional {
        ctx.res(Outcome::pass(format!("wrote {name}")));
        return;
    }
    match std::fs::read_to_string(&name) {
        Ok(back) if back == payload => ctx.res(Outcome::pass(format!("{name} reads back"))),
        Ok(back) => ctx.res(Outcome::fail(format!("{name} holds {back:?}"))),
        Err(e) => ctx.res(Outcome::fail(format!("cannot read {name}: {e}"))),
    }
}

fn check_mkdir_twice(ctx: &mut TestContext, turn: u32) {
    let path = match CString::new(format!("dir.{turn}")) {
        Ok(path) => path,
        Err(e) => ctx.brk(Outcome::brok(format!("bad directory name: {e}"))),
    };

    // SAFETY: `path` is a valid NUL-terminated string for both calls.
    let first = ctx.test(|| unsafe { libc::mkdir(path.as_ptr(), 0o700) });
    if first.failed() {
        ctx.log_errno(first.errno);
        ctx.res_errno(ResultKind::Brok, "first mkdir failed");
    }

    let second = ctx.test(|| unsafe { libc::mkdir(path.as_ptr(), 0o700) });
    if !second.failed() {
        ctx.res(Outcome::fail("second mkdir succeeded"));
        return;
    }
    ctx.log_errno(second.errno);
    if second.errno == Errno::EEXIST {
        ctx.res_errno(ResultKind::Pass, "second mkdir refused");
    } else {
        ctx.res_errno(ResultKind::Fail, "second mkdir failed unexpectedly");
    }
}

fn check_isolation(ctx: &mut TestContext, plan: &IsolationPlan) {
    if let Some(missing) = plan.namespaces.first_unsupported() {
        ctx.res(Outcome::conf(format!("{missing} namespace not supported by this kernel")));
    }

    let mut before = Vec::new();
    for ns in plan.namespaces.iter() {
        match ns.inode() {
            Ok(inode) => before.push((ns, inode)),
            Err(e) => ctx.brk(Outcome::brok(format!("cannot read {}: {e}", ns.proc_path().display()))),
        }
    }

    let go = match HandshakeChannel::create() {
        Ok(chan) => RefCell::new(chan),
        Err(e) => ctx.brk(Outcome::brok(format!("handshake: {e}"))),
    };
    let isolates = plan.isolates();
    let strategy = plan.strategy;
    let started = Cell::new(None);

    let outcome = IsolationRunner::new().run(
        strategy,
        plan.namespaces,
        || {
            if go.borrow_mut().wait().is_err() {
                return ResultKind::Brok.exit_code();
            }
            let moved = before.iter().all(|(ns, inode)| match ns {
                // These apply to children of the caller, not the caller.
                Namespace::Pid | Namespace::Time if strategy == IsolationStrategy::Unshare => true,
                Namespace::Pid if strategy == IsolationStrategy::Clone => std::process::id() == 1,
                _ => ns.inode().map(|now| now != *inode).unwrap_or(false),
            });
            if moved == isolates || before.is_empty() {
                0
            } else {
                ResultKind::Fail.exit_code()
            }
        },
        Some(|child: ChildProcess| {
            if go.borrow_mut().notify().is_err() {
                let _ = nix::sys::signal::kill(child.pid(), Signal::SIGKILL);
            }
            started.set(Some(child));
            0
        }),
    );

    let label = format!("{} child ({})", strategy, plan.namespaces);
    match outcome {
        Ok(RunOutcome::Completed(_)) => {
            let Some(child) = started.take() else {
                ctx.brk(Outcome::brok(format!("{label} never started")))
            };
            match ctx.record_child_status(child) {
                ResultKind::Pass => ctx.res(Outcome::pass(format!("{label} behaved as expected"))),
                kind => ctx.res(Outcome::fail(format!("{label} returned {kind}"))),
            }
        }
        Ok(RunOutcome::ChildFailed { pid, exit }) => {
            ctx.record_child_exit(pid, exit);
            ctx.res(Outcome::fail(format!("{label} {exit}")))
        }
        Err(e) if e.is_unsupported() => {
            let mut outcome = Outcome::conf(format!("{label}: isolation not available"));
            outcome.errno = e.errno();
            ctx.res(outcome)
        }
        Err(e) => {
            let mut outcome = Outcome::brok(format!("{label}: {e}"));
            outcome.errno = e.errno();
            ctx.res(outcome)
        }
    }
}
