//! Node configuration, loaded from a JSON file.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::epoch_process::EpochProcessConfig;
use crate::error::DarknodeError;
use crate::identity::NodeId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DarknodeConfig {
    /// Number of darknodes registered in the simulation
    pub nodes: usize,
    /// Target number of darknodes per pool
    pub pool_size: usize,
    /// Minimum epoch interval in seconds
    pub epoch_interval_secs: u64,
    /// Unix time of epoch zero; defaults to startup time
    pub genesis: Option<u64>,
    pub send_timeout_secs: u64,
    /// Registry poll interval once an epoch deadline has passed
    pub poll_interval_ms: u64,
    pub channel_capacity: usize,
    /// Crossing buy/sell pairs submitted to every pool each epoch
    pub orders_per_epoch: usize,
    /// Seed from which node ids are derived
    pub seed: String,
}

impl Default for DarknodeConfig {
    fn default() -> Self {
        Self {
            nodes: 8,
            pool_size: 4,
            epoch_interval_secs: 10,
            genesis: None,
            send_timeout_secs: 60,
            poll_interval_ms: 100,
            channel_capacity: 64,
            orders_per_epoch: 2,
            seed: "darknode".to_string(),
        }
    }
}

impl DarknodeConfig {
    pub fn load(path: &Path) -> Result<Self, DarknodeError> {
        let bytes = std::fs::read(path)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| DarknodeError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn validate(&self) -> Result<(), DarknodeError> {
        if self.nodes == 0 {
            return Err(DarknodeError::Config("nodes must be at least 1".to_string()));
        }
        if self.pool_size == 0 || self.pool_size > self.nodes {
            return Err(DarknodeError::Config(format!(
                "pool_size must be between 1 and nodes ({})",
                self.nodes
            )));
        }
        if self.epoch_interval_secs == 0 {
            return Err(DarknodeError::Config(
                "epoch_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.send_timeout_secs == 0 {
            return Err(DarknodeError::Config(
                "send_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(DarknodeError::Config(
                "channel_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn epoch_interval(&self) -> Duration {
        Duration::from_secs(self.epoch_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn process_config(&self) -> EpochProcessConfig {
        EpochProcessConfig {
            send_timeout: Duration::from_secs(self.send_timeout_secs),
            channel_capacity: self.channel_capacity,
        }
    }

    /// Ids of every registered darknode, in registration order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        (0..self.nodes)
            .map(|i| NodeId::from_seed(format!("{}/{}", self.seed, i).as_bytes()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        DarknodeConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: DarknodeConfig =
            serde_json::from_str(r#"{ "nodes": 12, "pool_size": 6 }"#).unwrap();
        assert_eq!(config.nodes, 12);
        assert_eq!(config.pool_size, 6);
        assert_eq!(config.send_timeout_secs, 60);
        assert_eq!(config.process_config().send_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_validation_rejects_bad_ranges() {
        let cases = [
            DarknodeConfig { nodes: 0, ..Default::default() },
            DarknodeConfig { pool_size: 0, ..Default::default() },
            DarknodeConfig { pool_size: 9, ..Default::default() },
            DarknodeConfig { epoch_interval_secs: 0, ..Default::default() },
            DarknodeConfig { send_timeout_secs: 0, ..Default::default() },
            DarknodeConfig { channel_capacity: 0, ..Default::default() },
        ];
        for config in cases {
            assert!(matches!(config.validate(), Err(DarknodeError::Config(_))), "{:?}", config);
        }
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("darknode-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{ "epoch_interval_secs": 30, "seed": "test" }"#).unwrap();
        let config = DarknodeConfig::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.epoch_interval(), Duration::from_secs(30));
        assert_eq!(config.node_ids().len(), 8);
        assert_ne!(config.node_ids(), DarknodeConfig::default().node_ids());
    }

    #[test]
    fn test_load_reports_malformed_json() {
        let path = std::env::temp_dir().join(format!("darknode-bad-{}.json", std::process::id()));
        std::fs::write(&path, "{ nodes: ").unwrap();
        let result = DarknodeConfig::load(&path);
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(result, Err(DarknodeError::Config(_))));
    }
}
