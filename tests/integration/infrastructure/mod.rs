pub mod process_harness;
pub mod result_assertions;

pub use process_harness::{ProbeHarness, ProbeOutput, ProbeProcess};
pub use result_assertions::*;
