use crate::infrastructure::{
    assert_exit_code, assert_stdout_contains, count_kind, result_lines, ProbeHarness,
};
use anyhow::Result;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::debug;

const LIMIT: Duration = Duration::from_secs(15);

/// Each iteration reports three checks: getpid, file round trip, mkdir.
const PASSES_PER_ITERATION: usize = 3;

#[tokio::test]
async fn test_iterations_pass_and_clean_up() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut harness = ProbeHarness::new()?;
    let output = harness.run_probe(&["-i", "3"], LIMIT).await?;
    debug!("probe stdout:\n{}", output.stdout);

    assert_exit_code(&output, 0);
    assert_eq!(count_kind(&output, "PASS"), 3 * PASSES_PER_ITERATION);
    assert_eq!(count_kind(&output, "FAIL"), 0);

    let numbers: Vec<u32> = result_lines(&output)
        .iter()
        .filter(|l| l.kind == "PASS")
        .map(|l| l.number)
        .collect();
    assert_eq!(numbers, (1..=9).collect::<Vec<_>>());

    assert!(harness.leftovers()?.is_empty(), "workspace was not removed");
    Ok(())
}

#[tokio::test]
async fn test_zero_iterations_still_runs_once() -> Result<()> {
    let mut harness = ProbeHarness::new()?;
    let output = harness.run_probe(&["-i", "0"], LIMIT).await?;
    assert_exit_code(&output, 0);
    assert_eq!(count_kind(&output, "PASS"), PASSES_PER_ITERATION);
    Ok(())
}

#[tokio::test]
async fn test_duration_bound_overrides_count() -> Result<()> {
    let mut harness = ProbeHarness::new()?;
    let started = std::time::Instant::now();
    let output = harness
        .run_probe(&["-i", "1", "-I", "0.5", "-P", "0.05"], LIMIT)
        .await?;

    assert_exit_code(&output, 0);
    assert!(started.elapsed() >= Duration::from_millis(500));
    assert!(count_kind(&output, "PASS") > PASSES_PER_ITERATION);
    Ok(())
}

#[tokio::test]
async fn test_help_exits_zero() -> Result<()> {
    let mut harness = ProbeHarness::new()?;
    let output = harness.run_probe(&["-h"], LIMIT).await?;

    assert_exit_code(&output, 0);
    assert_stdout_contains(&output, "Turn on errno logging");
    assert_stdout_contains(&output, "STRATEGY");
    assert!(harness.leftovers()?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_unknown_option_is_broken() -> Result<()> {
    let mut harness = ProbeHarness::new()?;
    let output = harness.run_probe(&["-Z"], LIMIT).await?;

    assert_exit_code(&output, 2);
    assert_stdout_contains(&output, "BROK  :  OPTION PARSING ERROR");
    assert_stdout_contains(&output, "BROK  :  Remaining cases broken");
    Ok(())
}

#[tokio::test]
async fn test_invalid_test_option_argument() -> Result<()> {
    let mut harness = ProbeHarness::new()?;
    let output = harness.run_probe(&["-s", "teleport"], LIMIT).await?;

    assert_exit_code(&output, 2);
    assert_stdout_contains(&output, "unknown isolation strategy");
    Ok(())
}

#[tokio::test]
async fn test_not_applicable_exits_skipped() -> Result<()> {
    let mut harness = ProbeHarness::new()?;
    let output = harness.run_probe(&["-S"], LIMIT).await?;

    assert_exit_code(&output, 32);
    assert_stdout_contains(&output, "CONF  :  not applicable on request");
    assert_stdout_contains(
        &output,
        "CONF  :  Remaining cases not appropriate for configuration",
    );
    assert!(harness.leftovers()?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_environment_fallbacks() -> Result<()> {
    let mut harness = ProbeHarness::new()?;
    harness.set_environment("USC_ITERATIONS", "2");
    harness.set_environment("TOUTPUT", "NOPASS");
    let output = harness.run_probe(&[], LIMIT).await?;

    assert_exit_code(&output, 0);
    assert_eq!(count_kind(&output, "PASS"), 0, "NOPASS should hide passes");

    harness.set_environment("TOUTPUT", "VERBOSE");
    let output = harness.run_probe(&[], LIMIT).await?;
    assert_eq!(count_kind(&output, "PASS"), 2 * PASSES_PER_ITERATION);
    Ok(())
}

#[tokio::test]
async fn test_copies_run_as_separate_processes() -> Result<()> {
    let mut harness = ProbeHarness::new()?;
    let output = harness.run_probe(&["-c", "3", "-i", "2"], LIMIT).await?;

    assert_exit_code(&output, 0);
    assert_eq!(count_kind(&output, "PASS"), 3 * 2 * PASSES_PER_ITERATION);

    let pids: BTreeSet<String> = result_lines(&output)
        .into_iter()
        .filter_map(|l| l.message.strip_prefix("getpid returned ").map(String::from))
        .collect();
    assert_eq!(pids.len(), 3, "expected three distinct copies, got {pids:?}");
    assert!(harness.leftovers()?.is_empty());
    Ok(())
}
