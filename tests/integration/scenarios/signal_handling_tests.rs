use crate::infrastructure::{
    assert_exit_code, assert_stdout_contains, count_kind, result_lines, ProbeHarness,
};
use anyhow::Result;
use nix::sys::signal::Signal;
use std::time::Duration;

const LIMIT: Duration = Duration::from_secs(15);

#[tokio::test]
async fn test_fault_cleans_up_and_exits_broken() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut harness = ProbeHarness::new()?;
    let output = harness.run_probe(&["-F", "-i", "3"], LIMIT).await?;

    assert_exit_code(&output, 2);
    let broken: Vec<_> = result_lines(&output)
        .into_iter()
        .filter(|l| l.kind == "BROK")
        .collect();
    assert_eq!(broken.len(), 1, "stdout:\n{}", output.stdout);
    assert_eq!(broken[0].tcid, "kprobe");
    assert_eq!(broken[0].message, "unexpected signal 11");
    assert_eq!(count_kind(&output, "PASS"), 0);
    assert!(harness.leftovers()?.is_empty(), "fault left the workspace behind");
    Ok(())
}

#[tokio::test]
async fn test_sigterm_mid_run_is_broken() -> Result<()> {
    let mut harness = ProbeHarness::new()?;
    let process = harness.spawn_probe(&["-I", "30", "-P", "0.05"]).await?;

    tokio::time::sleep(Duration::from_millis(300)).await;
    process.signal(Signal::SIGTERM)?;
    let output = process.finish(LIMIT).await?;

    assert_exit_code(&output, 2);
    assert_stdout_contains(&output, "BROK  :  unexpected signal 15");
    assert!(harness.leftovers()?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_pause_waits_for_sigusr1() -> Result<()> {
    let mut harness = ProbeHarness::new()?;
    let mut process = harness.spawn_probe(&["-p", "-i", "1"]).await?;

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(process.is_running(), "probe should be paused");
    assert!(
        harness.leftovers()?.is_empty(),
        "workspace must not exist before release"
    );

    process.signal(Signal::SIGUSR1)?;
    let output = process.finish(LIMIT).await?;

    assert_exit_code(&output, 0);
    assert_eq!(count_kind(&output, "PASS"), 3);
    Ok(())
}
