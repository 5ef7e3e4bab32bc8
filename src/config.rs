//! Runtime configuration.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// The endpoint name under which the receiver tracker is registered.
pub const TRACKER_ENDPOINT_NAME: &str = "receiver-tracker";

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    #[serde(default)]
    pub rust_log: String,

    /// The host on which the coordinator's tracker endpoint lives.
    #[serde(default = "default_coordinator_host")]
    pub coordinator_host: String,
    /// The port on which the coordinator's tracker endpoint lives.
    #[serde(default = "default_coordinator_port")]
    pub coordinator_port: u16,

    /// Enables write-ahead logging for both the block handlers and the
    /// tracker's event log.
    #[serde(default)]
    pub wal_enable: bool,
    /// The cadence on which the block generator cuts blocks, in milliseconds.
    #[serde(default = "default_block_interval_ms")]
    pub block_interval_ms: u64,
    /// The capacity of the block generator's handoff queue.
    #[serde(default = "default_block_queue_size")]
    pub block_queue_size: usize,
    /// The deadline for RPC replies, in milliseconds.
    #[serde(default = "default_ask_timeout_ms")]
    pub ask_timeout_ms: u64,
    /// The directory used for tracker & block WAL segments.
    ///
    /// Required when `wal_enable` is set.
    #[serde(default)]
    pub checkpoint_dir: Option<String>,
    /// The interval after which an open WAL segment is rotated, in milliseconds.
    #[serde(default = "default_wal_rotation_ms")]
    pub wal_rotation_ms: i64,
}

fn default_coordinator_host() -> String {
    "localhost".into()
}

fn default_coordinator_port() -> u16 {
    7077
}

fn default_block_interval_ms() -> u64 {
    200
}

fn default_block_queue_size() -> usize {
    10
}

fn default_ask_timeout_ms() -> u64 {
    30_000
}

fn default_wal_rotation_ms() -> i64 {
    60_000
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routine just parses the runtime environment and builds
    /// the application config from that. In the future, this may take into
    /// account an optional config file as well.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate invariants which envy can not express.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.wal_enable && self.checkpoint_dir.is_none() {
            bail!("checkpoint_dir is required when wal_enable is set");
        }
        if self.block_queue_size == 0 {
            bail!("block_queue_size must be greater than 0");
        }
        if self.block_interval_ms == 0 {
            bail!("block_interval_ms must be greater than 0");
        }
        Ok(())
    }

    /// The resolvable address of the coordinator's tracker endpoint.
    pub fn tracker_addr(&self) -> String {
        format!("{}:{}/{}", self.coordinator_host, self.coordinator_port, TRACKER_ENDPOINT_NAME)
    }

    /// The block generator cadence as a duration.
    pub fn block_interval(&self) -> Duration {
        Duration::from_millis(self.block_interval_ms)
    }

    /// The RPC reply deadline as a duration.
    pub fn ask_timeout(&self) -> Duration {
        Duration::from_millis(self.ask_timeout_ms)
    }

    /// Build an instance for use in tests.
    #[cfg(test)]
    pub fn new_test(wal_enable: bool) -> Result<(std::sync::Arc<Self>, tempfile::TempDir)> {
        let tmpdir = tempfile::tempdir_in("/tmp").context("error creating tmp dir in /tmp")?;
        Ok((
            std::sync::Arc::new(Self {
                rust_log: "".into(),
                coordinator_host: "localhost".into(),
                coordinator_port: 7077,
                wal_enable,
                block_interval_ms: 20,
                block_queue_size: 10,
                ask_timeout_ms: 2_000,
                checkpoint_dir: Some(tmpdir.path().to_string_lossy().to_string()),
                wal_rotation_ms: 60_000,
            }),
            tmpdir,
        ))
    }
}
