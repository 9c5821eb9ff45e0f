use crate::infrastructure::{assert_exit_code, assert_stdout_contains, ProbeHarness};
use anyhow::Result;
use std::time::Duration;

const LIMIT: Duration = Duration::from_secs(15);

#[tokio::test]
async fn test_errno_table_counts_expected_values() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut harness = ProbeHarness::new()?;
    let output = harness.run_probe(&["-e", "-i", "4"], LIMIT).await?;

    assert_exit_code(&output, 0);
    assert_stdout_contains(&output, "INFO  :  ERRNO EEXIST(17): received 4 times");
    assert!(!output.stdout.contains("(not expected)"));
    Ok(())
}

#[tokio::test]
async fn test_no_errno_table_without_flag() -> Result<()> {
    let mut harness = ProbeHarness::new()?;
    let output = harness.run_probe(&["-i", "2"], LIMIT).await?;

    assert_exit_code(&output, 0);
    assert!(!output.stdout.contains("ERRNO"));
    Ok(())
}

#[tokio::test]
async fn test_timing_summary() -> Result<()> {
    let mut harness = ProbeHarness::new()?;
    let output = harness.run_probe(&["-t", "-i", "2"], LIMIT).await?;

    assert_exit_code(&output, 0);
    // getpid plus two mkdir calls per iteration.
    assert_stdout_contains(&output, "timing: 6 calls");
    Ok(())
}

#[tokio::test]
async fn test_functional_checks_can_be_disabled() -> Result<()> {
    let mut harness = ProbeHarness::new()?;
    let output = harness.run_probe(&["-f"], LIMIT).await?;

    assert_exit_code(&output, 0);
    assert_stdout_contains(&output, "PASS  :  getpid returned\n");
    assert_stdout_contains(&output, "PASS  :  wrote probe.1");
    Ok(())
}
