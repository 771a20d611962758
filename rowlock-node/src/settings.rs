use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

const ENV_PREFIX: &str = "ROWLOCK";

/// Runner settings, read from the same `ROWLOCK_*` environment as the lock.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeSettings {
    /// Interval between liveness checks while the lock is held.
    pub poll_interval_ms: u64,
    /// Ceiling for the retry delay after storage failures.
    pub retry_backoff_max_ms: u64,
    /// Log format: "compact" or "json".
    pub log_format: String,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            retry_backoff_max_ms: 30_000,
            log_format: "compact".to_string(),
        }
    }
}

impl NodeSettings {
    pub fn load() -> anyhow::Result<Self> {
        let defaults_json = serde_json::to_string(&Self::default())
            .with_context(|| "failed to serialize defaults")?;
        let settings = config::Config::builder()
            .add_source(
                config::File::from_str(&defaults_json, config::FileFormat::Json).required(false),
            )
            .add_source(config::Environment::with_prefix(ENV_PREFIX))
            .build()
            .with_context(|| "failed to load node settings")?;
        let cfg: NodeSettings = settings
            .try_deserialize()
            .with_context(|| "failed to deserialize node settings")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_backoff_max(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_max_ms)
    }

    pub fn json_logs(&self) -> bool {
        self.log_format == "json"
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.poll_interval_ms == 0 {
            anyhow::bail!("poll_interval_ms must be greater than zero");
        }
        if self.retry_backoff_max_ms == 0 {
            anyhow::bail!("retry_backoff_max_ms must be greater than zero");
        }
        if !matches!(self.log_format.as_str(), "compact" | "json") {
            anyhow::bail!(
                "unsupported log_format `{}`, expected compact or json",
                self.log_format
            );
        }
        Ok(())
    }
}
