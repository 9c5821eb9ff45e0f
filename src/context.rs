use nix::errno::Errno;
use nix::unistd::{fork, ForkResult, Pid};
use std::io::Write;
use std::path::Path;
use std::process;
use tracing::{debug, error, info, warn};

use crate::cli::{Config, ConfigParser, OptionSpec, ParseError};
use crate::isolation::{ChildExit, ChildProcess};
use crate::looping::LoopState;
use crate::results::{Flow, Outcome, ResultAggregator, ResultKind};
use crate::signals::{self, ForkMode, SignalTable};
use crate::syscall::{self, SyscallResult, SyscallReturn, TimingStats};
use crate::workspace::TempWorkspace;

/// Everything one test process knows about its run.
///
/// Each concurrently running copy holds its own context; nothing is shared
/// between copies.
pub struct TestContext {
    tcid: &'static str,
    config: Config,
    results: ResultAggregator,
    looping: LoopState,
    signals: Option<SignalTable>,
    cleanup: Option<fn()>,
    workspace: Option<TempWorkspace>,
    timing: TimingStats,
    last: Option<SyscallResult>,
    copies: Vec<Pid>,
    copy_index: u32,
    cleaned_up: bool,
}

impl TestContext {
    /// Parses the process arguments against `options`.
    ///
    /// `-h` prints the help screen and exits 0. A parse error is reported
    /// as BROK and the process exits with the BROK status.
    pub fn init(tcid: &'static str, options: &[OptionSpec]) -> Self {
        match ConfigParser::new(tcid, options).parse(std::env::args_os()) {
            Ok(config) => Self::new(tcid, config),
            Err(ParseError::Help(text)) => {
                print!("{text}");
                let _ = std::io::stdout().flush();
                process::exit(0);
            }
            Err(e) => {
                let mut ctx = Self::new(tcid, Config::default());
                ctx.brk(Outcome::brok(format!("OPTION PARSING ERROR - {e}")))
            }
        }
    }

    pub fn new(tcid: &'static str, config: Config) -> Self {
        Self {
            tcid,
            results: ResultAggregator::new(tcid, config.output),
            looping: LoopState::new(config.iterations, config.duration),
            config,
            signals: None,
            cleanup: None,
            workspace: None,
            timing: TimingStats::default(),
            last: None,
            copies: Vec::new(),
            copy_index: 0,
            cleaned_up: false,
        }
    }

    /// Sends result lines to `sink` instead of stdout.
    pub fn with_output(mut self, sink: Box<dyn Write>) -> Self {
        self.results = ResultAggregator::with_sink(self.tcid, self.config.output, sink);
        self
    }

    pub fn tcid(&self) -> &'static str {
        self.tcid
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn results(&self) -> &ResultAggregator {
        &self.results
    }

    pub fn timing(&self) -> &TimingStats {
        &self.timing
    }

    pub fn workspace(&self) -> Option<&Path> {
        self.workspace.as_ref().map(TempWorkspace::path)
    }

    /// Turns granted by [`looping`](Self::looping) so far.
    pub fn iteration(&self) -> u32 {
        self.looping.index()
    }

    /// 0 in the original process, `1..copies` in the forked copies.
    pub fn copy_index(&self) -> u32 {
        self.copy_index
    }

    pub fn is_copy(&self) -> bool {
        self.copy_index > 0
    }

    /// The most recent call captured by [`test`](Self::test).
    pub fn last(&self) -> Option<SyscallResult> {
        self.last
    }

    /// Installs the fault handlers and remembers `cleanup`.
    ///
    /// `mode` says whether the test body forks children that should keep
    /// the handlers. Failure to install is BROK.
    pub fn setup(&mut self, mode: ForkMode, cleanup: Option<fn()>) {
        let table = SignalTable::standard(mode).named(self.tcid);
        if let Err(e) = table.install(cleanup) {
            self.brk(Outcome::brok(format!("signal setup failed: {e}")));
        }
        self.signals = Some(table);
        self.cleanup = cleanup;
    }

    /// Starts the additional copies and honors `-p`.
    pub fn begin(&mut self) {
        self.fork_copies();
        if self.config.pause {
            if let Err(e) = signals::pause_until_released() {
                self.brk(Outcome::brok(format!("pause failed: {e}")));
            }
        }
    }

    fn fork_copies(&mut self) {
        for index in 1..self.config.copies {
            // SAFETY: test programs are single-threaded; the child carries on
            // as an independent copy of this process.
            match unsafe { fork() } {
                Ok(ForkResult::Parent { child }) => {
                    debug!("started copy {} as PID {}", index, child);
                    self.copies.push(child);
                }
                Ok(ForkResult::Child) => {
                    signals::adopt_current_process();
                    self.copies.clear();
                    self.copy_index = index;
                    self.results.reset();
                    signals::note_case_number(0);
                    self.timing = TimingStats::default();
                    return;
                }
                Err(errno) => {
                    self.brk(Outcome::brok(format!("fork of copy {index} failed")).with_errno(errno))
                }
            }
        }
        if !self.copies.is_empty() {
            info!("running {} copies", self.copies.len() + 1);
        }
    }

    /// Creates the scratch directory and makes it the current directory.
    /// Failure is BROK.
    pub fn make_workspace(&mut self) -> &Path {
        match TempWorkspace::create(self.tcid) {
            Ok(ws) => {
                signals::register_fault_workspace(Some(ws.path()));
                self.workspace.insert(ws).path()
            }
            Err(e) => self.brk(Outcome::brok(format!("failed to create workspace: {e}"))),
        }
    }

    /// Whether the test body should run again.
    ///
    /// From the second call on, the `-P` delay is slept before deciding, so
    /// a duration bound also covers the delays. Nothing is slept once the
    /// iteration count is used up.
    pub fn looping(&mut self) -> bool {
        if self.looping.index() > 0 && !self.looping.is_exhausted() {
            if let Some(delay) = self.config.delay {
                std::thread::sleep(delay);
            }
        }
        self.looping.should_continue()
    }

    /// Runs `op`, capturing its return value and errno with nothing in
    /// between, and records its duration under `-t`.
    pub fn test<R: SyscallReturn>(&mut self, op: impl FnOnce() -> R) -> SyscallResult {
        let result = syscall::capture(op);
        if self.config.timing {
            self.timing.record(result.elapsed);
        }
        self.last = Some(result);
        result
    }

    /// Counts `errno` in the frequency table when `-e` is on.
    pub fn log_errno(&mut self, errno: Errno) {
        if self.config.errno_logging {
            self.results.log_errno(errno);
        }
    }

    pub fn set_expected_errnos(&mut self, errnos: &[Errno]) {
        self.results.set_expected_errnos(errnos);
    }

    /// Reports `outcome`. BROK and CONF end the run through
    /// [`brk`](Self::brk).
    pub fn res(&mut self, outcome: Outcome) {
        if outcome.kind.terminates() {
            self.brk(outcome);
        }
        self.report(&outcome);
    }

    fn report(&mut self, outcome: &Outcome) -> Flow {
        let flow = self.results.report(outcome);
        signals::note_case_number(self.results.case_number());
        flow
    }

    /// Reports `kind` with the errno of the last captured call attached.
    pub fn res_errno(&mut self, kind: ResultKind, message: impl Into<String>) {
        let mut outcome = Outcome::new(kind, message);
        outcome.errno = self.last.map(|r| r.errno).filter(|e| *e != Errno::UnknownErrno);
        self.res(outcome);
    }

    /// Reports `outcome`, runs cleanup and exits.
    pub fn brk(&mut self, outcome: Outcome) -> ! {
        let kind = outcome.kind;
        if self.report(&outcome) == Flow::Terminate {
            let remaining = match kind {
                ResultKind::Conf => "Remaining cases not appropriate for configuration",
                _ => "Remaining cases broken",
            };
            self.report(&Outcome::new(kind, remaining));
        }
        self.exit()
    }

    /// Waits for a child test process and folds its result into this run.
    /// Returns the worst kind the child reported.
    pub fn record_child_status(&mut self, child: ChildProcess) -> ResultKind {
        match child.wait() {
            Ok(exit) => self.record_child_exit(child.pid(), exit),
            Err(errno) => self.brk(
                Outcome::brok(format!("waitpid({}) failed", child.pid())).with_errno(errno),
            ),
        }
    }

    /// As [`record_child_status`](Self::record_child_status), for a child
    /// that has already been reaped. Death by a signal is BROK.
    pub fn record_child_exit(&mut self, pid: Pid, exit: ChildExit) -> ResultKind {
        match exit {
            ChildExit::Exited(code) => self.results.record_child_exit(code),
            ChildExit::Signaled(signal) => self.brk(Outcome::brok(format!(
                "child process ({pid}) killed by unexpected signal {signal}({})",
                signal as i32
            ))),
        }
    }

    /// Runs cleanup and exits with the aggregated status.
    pub fn exit(&mut self) -> ! {
        let code = self.finish();
        let _ = std::io::stdout().flush();
        process::exit(code)
    }

    /// Runs cleanup once and returns the exit status without exiting.
    ///
    /// Order: the test's cleanup callback, the errno table (`-e`), the
    /// timing summary (`-t`), workspace removal, then reaping copies.
    pub fn finish(&mut self) -> i32 {
        if !self.cleaned_up {
            self.cleaned_up = true;
            self.run_cleanup();
        }
        self.results.exit_status()
    }

    fn run_cleanup(&mut self) {
        signals::disarm_cleanup();
        if let Some(cleanup) = self.cleanup.take() {
            debug!("running test cleanup");
            cleanup();
        }

        if self.config.errno_logging {
            for line in self.results.errno_summary() {
                self.results.report(&line);
            }
        }

        if self.config.timing {
            if let Some(summary) = self.timing.summary() {
                self.results.report(&Outcome::info(summary));
            }
        }

        if let Some(ws) = self.workspace.take() {
            if let Err(e) = ws.destroy() {
                error!("{}", e);
                self.results.report(&Outcome::warn(format!("workspace cleanup failed: {e}")));
            }
        }

        for pid in self.copies.drain(..) {
            match ChildProcess::from_pid(pid).wait() {
                Ok(exit) => debug!("copy {} {}", pid, exit),
                Err(e) => warn!("failed to reap copy {}: {}", pid, e),
            }
        }

        if let Some(table) = self.signals.take() {
            if let Err(e) = table.restore() {
                warn!("{}", e);
            }
        }
    }
}
