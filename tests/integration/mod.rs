//! Integration tests driving the kharness-probe binary
//!
//! Each scenario runs the probe in its own scratch directory and checks the
//! result lines it prints, its exit status, and what it leaves on disk.

pub mod infrastructure;
pub mod scenarios;

pub use infrastructure::{ProbeHarness, ProbeOutput, ProbeProcess};
