//! Outcome classification, errno bookkeeping and the process exit status.

use nix::errno::Errno;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::{self, Write};
use tracing::{debug, warn};

/// Severity of a single checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultKind {
    Pass,
    Fail,
    Brok,
    Warn,
    Info,
    Conf,
}

impl ResultKind {
    pub fn label(self) -> &'static str {
        match self {
            ResultKind::Pass => "PASS",
            ResultKind::Fail => "FAIL",
            ResultKind::Brok => "BROK",
            ResultKind::Warn => "WARN",
            ResultKind::Info => "INFO",
            ResultKind::Conf => "CONF",
        }
    }

    /// Process exit status contributed by this kind. WARN and INFO never
    /// change the status and map to the pass code.
    pub fn exit_code(self) -> i32 {
        match self {
            ResultKind::Fail => 1,
            ResultKind::Brok => 2,
            ResultKind::Conf => 32,
            ResultKind::Pass | ResultKind::Warn | ResultKind::Info => 0,
        }
    }

    /// Whether reporting this kind ends the run.
    pub fn terminates(self) -> bool {
        matches!(self, ResultKind::Brok | ResultKind::Conf)
    }

    /// Whether this kind takes a test-case number.
    fn numbered(self) -> bool {
        !matches!(self, ResultKind::Warn | ResultKind::Info)
    }
}

impl fmt::Display for ResultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One reported checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub kind: ResultKind,
    pub message: String,
    pub errno: Option<Errno>,
}

impl Outcome {
    pub fn new(kind: ResultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            errno: None,
        }
    }

    pub fn pass(message: impl Into<String>) -> Self {
        Self::new(ResultKind::Pass, message)
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self::new(ResultKind::Fail, message)
    }

    pub fn brok(message: impl Into<String>) -> Self {
        Self::new(ResultKind::Brok, message)
    }

    pub fn conf(message: impl Into<String>) -> Self {
        Self::new(ResultKind::Conf, message)
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self::new(ResultKind::Warn, message)
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(ResultKind::Info, message)
    }

    pub fn with_errno(mut self, errno: Errno) -> Self {
        self.errno = Some(errno);
        self
    }

    /// Formats the classified result line, without a trailing newline.
    pub fn render(&self, tcid: &str, number: u32) -> String {
        let mut line = format!(
            "{:<8} {:>4}  {}  :  {}",
            tcid,
            number,
            self.kind.label(),
            self.message
        );
        if let Some(errno) = self.errno {
            line.push_str(&format!(
                ": errno={:?}({}): {}",
                errno,
                errno as i32,
                errno.desc()
            ));
        }
        line
    }
}

/// What the caller must do after a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Run cleanup and exit; no further checks are meaningful.
    Terminate,
}

/// How much of the result stream is printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    #[default]
    Verbose,
    /// Only FAIL, BROK and WARN lines.
    NoPass,
    Discard,
}

impl OutputMode {
    /// Reads the `TOUTPUT` convention: `NOPASS`, `DISCARD`, anything else is
    /// verbose.
    pub fn from_setting(value: Option<&str>) -> Self {
        match value {
            Some("NOPASS") => OutputMode::NoPass,
            Some("DISCARD") => OutputMode::Discard,
            _ => OutputMode::Verbose,
        }
    }

    fn shows(self, kind: ResultKind) -> bool {
        match self {
            OutputMode::Verbose => true,
            OutputMode::NoPass => matches!(kind, ResultKind::Fail | ResultKind::Brok | ResultKind::Warn),
            OutputMode::Discard => false,
        }
    }
}

/// A row of the errno frequency table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrnoEntry {
    pub errno: Errno,
    pub count: u64,
    pub expected: bool,
}

/// Errno occurrence counts plus the optional allow-list for the run.
#[derive(Debug, Clone, Default)]
pub struct ErrnoLog {
    counts: BTreeMap<i32, u64>,
    expected: Option<BTreeSet<i32>>,
}

impl ErrnoLog {
    pub fn record(&mut self, errno: Errno) {
        *self.counts.entry(errno as i32).or_insert(0) += 1;
    }

    pub fn set_expected(&mut self, errnos: &[Errno]) {
        self.expected = Some(errnos.iter().map(|e| *e as i32).collect());
    }

    /// Without an allow-list every value counts as expected.
    pub fn is_expected(&self, errno: Errno) -> bool {
        self.expected
            .as_ref()
            .map_or(true, |set| set.contains(&(errno as i32)))
    }

    pub fn count(&self, errno: Errno) -> u64 {
        self.counts.get(&(errno as i32)).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn entries(&self) -> Vec<ErrnoEntry> {
        self.counts
            .iter()
            .map(|(&raw, &count)| {
                let errno = Errno::from_raw(raw);
                ErrnoEntry {
                    errno,
                    count,
                    expected: self.is_expected(errno),
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub pass: u32,
    pub fail: u32,
    pub brok: u32,
    pub warn: u32,
    pub info: u32,
    pub conf: u32,
}

/// Collects outcomes for one test process and derives its exit status.
pub struct ResultAggregator {
    tcid: String,
    tally: Tally,
    case_number: u32,
    errno_log: ErrnoLog,
    mode: OutputMode,
    sink: Box<dyn Write>,
}

impl ResultAggregator {
    /// Prints to stdout in the given mode.
    pub fn new(tcid: impl Into<String>, mode: OutputMode) -> Self {
        Self::with_sink(tcid, mode, Box::new(io::stdout()))
    }

    pub fn with_sink(tcid: impl Into<String>, mode: OutputMode, sink: Box<dyn Write>) -> Self {
        Self {
            tcid: tcid.into(),
            tally: Tally::default(),
            case_number: 0,
            errno_log: ErrnoLog::default(),
            mode,
            sink,
        }
    }

    pub fn tcid(&self) -> &str {
        &self.tcid
    }

    pub fn tally(&self) -> Tally {
        self.tally
    }

    /// Number of the last numbered line printed so far.
    pub fn case_number(&self) -> u32 {
        self.case_number
    }

    fn count(&mut self, kind: ResultKind) {
        match kind {
            ResultKind::Pass => self.tally.pass += 1,
            ResultKind::Fail => self.tally.fail += 1,
            ResultKind::Brok => self.tally.brok += 1,
            ResultKind::Warn => self.tally.warn += 1,
            ResultKind::Info => self.tally.info += 1,
            ResultKind::Conf => self.tally.conf += 1,
        }
    }

    /// Records and prints `outcome`, telling the caller whether to go on.
    pub fn report(&mut self, outcome: &Outcome) -> Flow {
        self.count(outcome.kind);

        let number = if outcome.kind.numbered() {
            self.case_number += 1;
            self.case_number
        } else {
            0
        };

        if self.mode.shows(outcome.kind) {
            let line = outcome.render(&self.tcid, number);
            if let Err(e) = writeln!(self.sink, "{line}").and_then(|()| self.sink.flush()) {
                warn!("failed to write result line: {}", e);
            }
        }
        debug!(kind = %outcome.kind, number, "reported: {}", outcome.message);

        if outcome.kind.terminates() {
            Flow::Terminate
        } else {
            Flow::Continue
        }
    }

    /// Folds the exit status of a child test process into this run and
    /// returns the worst kind it carried.
    ///
    /// Each kind encoded in `code` counts as if reported here and gets an
    /// INFO line. A status that encodes no known kind counts as FAIL.
    pub fn record_child_exit(&mut self, code: i32) -> ResultKind {
        if code == 0 {
            self.report(&Outcome::info("Child process returned PASS"));
            return ResultKind::Pass;
        }

        let carried: Vec<ResultKind> = [ResultKind::Fail, ResultKind::Brok, ResultKind::Conf]
            .into_iter()
            .filter(|kind| code & kind.exit_code() != 0)
            .collect();
        if carried.is_empty() {
            self.count(ResultKind::Fail);
            self.report(&Outcome::info(format!("Child process returned status {code}")));
            return ResultKind::Fail;
        }

        for &kind in &carried {
            self.count(kind);
            self.report(&Outcome::info(format!("Child process returned {kind}")));
        }
        [ResultKind::Brok, ResultKind::Fail, ResultKind::Conf]
            .into_iter()
            .find(|kind| carried.contains(kind))
            .unwrap_or(ResultKind::Fail)
    }

    pub fn log_errno(&mut self, errno: Errno) {
        self.errno_log.record(errno);
    }

    pub fn set_expected_errnos(&mut self, errnos: &[Errno]) {
        self.errno_log.set_expected(errnos);
    }

    pub fn errno_log(&self) -> &ErrnoLog {
        &self.errno_log
    }

    /// Outcomes describing the errno table, unexpected values as WARN.
    pub fn errno_summary(&self) -> Vec<Outcome> {
        self.errno_log
            .entries()
            .into_iter()
            .map(|entry| {
                let text = format!(
                    "ERRNO {:?}({}): received {} times",
                    entry.errno, entry.errno as i32, entry.count
                );
                if entry.expected {
                    Outcome::info(text)
                } else {
                    Outcome::warn(format!("{text} (not expected)"))
                }
            })
            .collect()
    }

    /// Worst severity observed, as a process exit status.
    ///
    /// BROK beats FAIL beats everything else. CONF yields the skipped status
    /// only when nothing passed; otherwise the run still counts as a pass.
    pub fn exit_status(&self) -> i32 {
        let t = &self.tally;
        if t.brok > 0 {
            ResultKind::Brok.exit_code()
        } else if t.fail > 0 {
            ResultKind::Fail.exit_code()
        } else if t.conf > 0 && t.pass == 0 {
            ResultKind::Conf.exit_code()
        } else {
            ResultKind::Pass.exit_code()
        }
    }

    /// Forgets everything, as a freshly forked copy must.
    pub fn reset(&mut self) {
        self.tally = Tally::default();
        self.case_number = 0;
        self.errno_log = ErrnoLog::default();
    }
}
