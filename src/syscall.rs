//! Capturing a call's return value together with the errno it left behind.

use nix::errno::Errno;
use std::time::{Duration, Instant};

/// Raw return types of C-level calls.
pub trait SyscallReturn {
    fn into_raw(self) -> i64;
}

impl SyscallReturn for i32 {
    fn into_raw(self) -> i64 {
        i64::from(self)
    }
}

impl SyscallReturn for i64 {
    fn into_raw(self) -> i64 {
        self
    }
}

impl SyscallReturn for isize {
    fn into_raw(self) -> i64 {
        self as i64
    }
}

impl SyscallReturn for u32 {
    fn into_raw(self) -> i64 {
        i64::from(self)
    }
}

/// Return value and errno of one captured call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallResult {
    pub ret: i64,
    pub errno: Errno,
    pub elapsed: Duration,
}

impl SyscallResult {
    /// The C convention: `-1` means the call failed and `errno` is valid.
    pub fn failed(&self) -> bool {
        self.ret == -1
    }
}

/// Runs `op` and reads errno before anything else can touch it.
///
/// errno is cleared first, so a successful call reports `Errno::UnknownErrno`
/// (zero) instead of whatever an earlier call left behind.
pub fn capture<R: SyscallReturn>(op: impl FnOnce() -> R) -> SyscallResult {
    let start = Instant::now();
    Errno::clear();
    let ret = op().into_raw();
    let errno = Errno::last();
    let elapsed = start.elapsed();
    SyscallResult { ret, errno, elapsed }
}

/// Running min/max/total of captured call durations (`-t`).
#[derive(Debug, Clone, Copy, Default)]
pub struct TimingStats {
    count: u64,
    total: Duration,
    min: Option<Duration>,
    max: Duration,
}

impl TimingStats {
    pub fn record(&mut self, elapsed: Duration) {
        self.count += 1;
        self.total += elapsed;
        self.max = self.max.max(elapsed);
        self.min = Some(self.min.map_or(elapsed, |m| m.min(elapsed)));
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> Option<Duration> {
        let count = u32::try_from(self.count).ok().filter(|c| *c > 0)?;
        Some(self.total / count)
    }

    pub fn summary(&self) -> Option<String> {
        let mean = self.mean()?;
        Some(format!(
            "timing: {} calls, min {:?}, max {:?}, mean {:?}",
            self.count,
            self.min.unwrap_or_default(),
            self.max,
            mean
        ))
    }
}
