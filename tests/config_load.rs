//! Configuration loading: defaults, TOML file, environment overrides.

use claimguard_rs::{ReassignmentPolicy, ReconcilerConfig};
use std::time::Duration;
use tempfile::tempdir;

// Env vars are process-wide and tests run in parallel, so every load in
// this binary happens in this one test.
#[test]
fn file_and_env_layers_apply_in_order() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("claimguard.toml");
    std::fs::write(
        &path,
        r#"
scan_interval_ms = 250
suppression_id = "Camp_Guard"
reassignment = "recreate"
"#,
    )?;

    let config = ReconcilerConfig::load(Some(&path))?;
    assert_eq!(config.scan_interval(), Duration::from_millis(250));
    assert_eq!(config.suppression_id, "Camp_Guard");
    assert_eq!(config.reassignment, ReassignmentPolicy::Recreate);
    assert_eq!(config.marker_prefix, "ClaimGuard:");
    assert_eq!(config.sweep_interval(), Duration::from_secs(5));

    std::env::set_var("CLAIMGUARD_SCAN_INTERVAL_MS", "40");
    std::env::set_var("CLAIMGUARD_REASSIGNMENT", "keep");
    let overridden = ReconcilerConfig::load(Some(&path));
    std::env::remove_var("CLAIMGUARD_SCAN_INTERVAL_MS");
    std::env::remove_var("CLAIMGUARD_REASSIGNMENT");
    let overridden = overridden?;
    assert_eq!(overridden.scan_interval_ms, 40);
    assert_eq!(overridden.reassignment, ReassignmentPolicy::Keep);
    assert_eq!(overridden.suppression_id, "Camp_Guard");

    std::env::set_var("CLAIMGUARD_SWEEP_INTERVAL_SECS", "0");
    let rejected = ReconcilerConfig::load(None);
    std::env::remove_var("CLAIMGUARD_SWEEP_INTERVAL_SECS");
    let err = rejected.expect_err("zero sweep interval must be rejected");
    assert!(err.to_string().contains("sweep_interval_secs"));

    // A missing file contributes nothing.
    let config = ReconcilerConfig::load(Some(&dir.path().join("absent.toml")))?;
    assert_eq!(config.suppression_id, "Spawn_Camp");
    assert_eq!(config.max_flush_batch, 0);

    let bad = dir.path().join("bad.toml");
    std::fs::write(&bad, "scan_interval_ms = \"soon\"\n")?;
    let err = ReconcilerConfig::load(Some(&bad)).expect_err("type mismatch");
    assert!(err.to_string().starts_with("configuration error"));
    Ok(())
}
