use anyhow::Result;

use crate::config::Config;

#[test]
fn new_test_config_validates() -> Result<()> {
    let (config, _tmpdir) = Config::new_test(false)?;
    assert!(!config.wal_enable);
    config.validate()?;
    Ok(())
}

#[test]
fn wal_requires_checkpoint_dir() -> Result<()> {
    let (config, _tmpdir) = Config::new_test(true)?;
    let mut config = (*config).clone();
    config.checkpoint_dir = None;
    assert!(config.validate().is_err(), "expected validation to fail without checkpoint_dir");
    Ok(())
}

#[test]
fn zero_queue_size_is_rejected() -> Result<()> {
    let (config, _tmpdir) = Config::new_test(false)?;
    let mut config = (*config).clone();
    config.block_queue_size = 0;
    assert!(config.validate().is_err(), "expected validation to fail with empty handoff queue");
    Ok(())
}

#[test]
fn tracker_addr_is_a_resolvable_name() -> Result<()> {
    let (config, _tmpdir) = Config::new_test(false)?;
    assert_eq!(config.tracker_addr(), "localhost:7077/receiver-tracker");
    Ok(())
}
