//! Unit tests for engine configuration loading and validation

use std::time::Duration;

use swap_engine::SwapConfig;

/// Test the built-in defaults
/// What is tested: Default interval, unbounded retries, lock-window ordering
/// Why: Embedders relying on Default must get a valid configuration
#[test]
fn test_default_config_is_valid() {
    let config = SwapConfig::default();
    config.validate().unwrap();
    assert_eq!(config.retry_interval(), Duration::from_secs(5));
    assert_eq!(config.max_retry_attempts, None);
    assert!(config.script_lock_duration_secs > config.contract_lock_duration_secs);
}

/// Test validation failures
/// What is tested: Zero interval, zero attempt cap, inverted lock windows
/// Why: Each of these would wedge or unbalance a live swap
#[test]
fn test_config_validation_rejects_bad_values() {
    let mut config = SwapConfig::default();
    config.retry_interval_ms = 0;
    assert!(config.validate().is_err());

    let mut config = SwapConfig::default();
    config.max_retry_attempts = Some(0);
    assert!(config.validate().is_err());

    // The first locker must outlive the second locker's window, or the
    // counterpart could refund and withdraw both legs.
    let mut config = SwapConfig::default();
    config.script_lock_duration_secs = 600;
    config.contract_lock_duration_secs = 600;
    assert!(config.validate().is_err());

    config.script_lock_duration_secs = 1200;
    config.validate().unwrap();
}

/// Test TOML loading
/// What is tested: Explicit values override, omitted fields take defaults,
/// invalid files and invalid values are rejected
/// Why: Production deployments configure the engine through TOML files
#[test]
fn test_config_loads_from_toml() {
    let dir = std::env::temp_dir();
    let path = dir.join(format!("swap-config-{}.toml", std::process::id()));
    std::fs::write(
        &path,
        "retry_interval_ms = 250\nmax_retry_attempts = 10\n",
    )
    .unwrap();

    let config = SwapConfig::load_from_path(path.to_str().unwrap()).unwrap();
    assert_eq!(config.retry_interval(), Duration::from_millis(250));
    assert_eq!(config.max_retry_attempts, Some(10));
    // Omitted lock windows fall back to the defaults.
    assert_eq!(
        config.script_lock_duration_secs,
        SwapConfig::default().script_lock_duration_secs
    );

    std::fs::write(&path, "retry_interval_ms = 0\n").unwrap();
    assert!(SwapConfig::load_from_path(path.to_str().unwrap()).is_err());

    std::fs::write(&path, "retry_interval_ms = \"soon\"\n").unwrap();
    assert!(SwapConfig::load_from_path(path.to_str().unwrap()).is_err());

    std::fs::remove_file(&path).ok();

    assert!(SwapConfig::load_from_path("/nonexistent/swap.toml").is_err());
}
