use crate::infrastructure::{assert_exit_code, count_kind, result_lines, ProbeHarness};
use anyhow::Result;
use std::time::Duration;

const LIMIT: Duration = Duration::from_secs(15);

#[tokio::test]
async fn test_every_strategy_without_namespaces() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    for strategy in ["plain", "clone", "unshare"] {
        let mut harness = ProbeHarness::new()?;
        let output = harness.run_probe(&["-s", strategy, "-i", "2"], LIMIT).await?;

        assert_exit_code(&output, 0);
        let isolation_passes = result_lines(&output)
            .iter()
            .filter(|l| l.kind == "PASS" && l.message.starts_with(&format!("{strategy} child")))
            .count();
        assert_eq!(isolation_passes, 2, "{strategy}: {}", output.stdout);
        assert!(harness.leftovers()?.is_empty());
    }
    Ok(())
}

#[tokio::test]
async fn test_plain_child_shares_namespaces() -> Result<()> {
    let mut harness = ProbeHarness::new()?;
    let output = harness.run_probe(&["-s", "plain", "-n", "uts,ipc"], LIMIT).await?;

    assert_exit_code(&output, 0);
    assert_eq!(count_kind(&output, "FAIL"), 0);
    Ok(())
}

/// Needs privileges or user namespaces; either way it must never FAIL or
/// BROK, only pass or report the configuration as unsupported.
#[tokio::test]
async fn test_unshare_uts_passes_or_is_unsupported() -> Result<()> {
    for strategy in ["unshare", "clone"] {
        let mut harness = ProbeHarness::new()?;
        let output = harness.run_probe(&["-s", strategy, "-n", "uts"], LIMIT).await?;

        match output.code() {
            Some(0) => assert!(count_kind(&output, "PASS") > 0),
            Some(32) => assert_eq!(count_kind(&output, "CONF"), 2),
            other => panic!(
                "{strategy}: unexpected exit {other:?}\nstdout:\n{}\nstderr:\n{}",
                output.stdout, output.stderr
            ),
        }
        assert_eq!(count_kind(&output, "FAIL"), 0);
        assert!(harness.leftovers()?.is_empty());
    }
    Ok(())
}

#[tokio::test]
async fn test_unknown_namespace_is_rejected() -> Result<()> {
    let mut harness = ProbeHarness::new()?;
    let output = harness.run_probe(&["-n", "uts,warp"], LIMIT).await?;

    assert_exit_code(&output, 2);
    assert!(output.stdout.contains("unknown namespace 'warp'"));
    Ok(())
}
