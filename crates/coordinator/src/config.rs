//! Coordinator configuration.

use gearshift_runtime::CheckpointConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Timeout handed to every task RPC.
    pub rpc_timeout_ms: u64,
    /// How long a synchronize waits for rescale-point acknowledgements before
    /// aborting. `None` waits forever.
    pub sync_timeout_ms: Option<u64>,
    pub checkpoint: CheckpointConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            rpc_timeout_ms: 10_000,
            sync_timeout_ms: Some(60_000),
            checkpoint: CheckpointConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    /// Load from a JSON file; missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn with_sync_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.sync_timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    pub fn with_checkpoint(mut self, checkpoint: CheckpointConfig) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn sync_timeout(&self) -> Option<Duration> {
        self.sync_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: CoordinatorConfig =
            serde_json::from_str(r#"{"sync_timeout_ms": 250, "checkpoint": {"interval_ms": 1000}}"#).unwrap();
        assert_eq!(config.rpc_timeout(), Duration::from_secs(10));
        assert_eq!(config.sync_timeout(), Some(Duration::from_millis(250)));
        assert!(config.checkpoint.is_periodic());
        assert_eq!(config.checkpoint.num_retained, 3);
    }

    #[test]
    fn test_unbounded_sync() {
        let config: CoordinatorConfig = serde_json::from_str(r#"{"sync_timeout_ms": null}"#).unwrap();
        assert_eq!(config.sync_timeout(), None);
        assert_eq!(
            CoordinatorConfig::default().with_sync_timeout(None).sync_timeout(),
            None
        );
    }
}
