//! Node configuration

use std::time::Duration;

use pnsim_core::{SimError, SimResult};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Simulation node configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Simulation identifier; random when omitted
    pub node_id: Option<String>,
    /// Drop publishes to unknown nets instead of keeping them in the backlog
    pub detached: bool,
    /// Dump every net's marking after each execution
    pub debug: bool,
    /// Bound on port negotiation at setup
    #[serde(with = "humantime_duration")]
    pub port_timeout: Duration,
    /// Re-publish interval of unacknowledged requests
    #[serde(with = "humantime_duration")]
    pub request_retry: Duration,
    /// Lateness tolerated before a drift warning
    #[serde(with = "humantime_duration")]
    pub drift_tolerance: Duration,
    /// Seed of the per-net random generators
    pub seed: Option<u64>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            node_id: None,
            detached: true,
            debug: false,
            port_timeout: Duration::from_secs(10),
            request_retry: Duration::from_secs(2),
            drift_tolerance: Duration::from_millis(5),
            seed: None,
        }
    }
}

impl NodeConfig {
    /// Keep undeliverable publishes until their net is announced
    pub fn attached() -> Self {
        NodeConfig {
            detached: false,
            ..Default::default()
        }
    }

    /// Short timeouts and a fixed seed
    pub fn testing() -> Self {
        NodeConfig {
            port_timeout: Duration::from_secs(3),
            request_retry: Duration::from_millis(200),
            drift_tolerance: Duration::from_millis(50),
            seed: Some(42),
            ..Default::default()
        }
    }

    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn from_json(json: &str) -> SimResult<Self> {
        let config: NodeConfig =
            serde_json::from_str(json).map_err(|e| SimError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> SimResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| SimError::Config(e.to_string()))
    }

    pub fn validate(&self) -> SimResult<()> {
        if self.port_timeout.is_zero() {
            return Err(SimError::Config("port_timeout must be positive".into()));
        }
        if self.request_retry.is_zero() {
            return Err(SimError::Config("request_retry must be positive".into()));
        }
        match &self.node_id {
            Some(id) if id.is_empty() || id.contains('/') || id.contains(',') => Err(
                SimError::Config(format!("node_id {:?} is not a valid topic level", id)),
            ),
            _ => Ok(()),
        }
    }

    /// Configured id, or a fresh `sim-<hex>` one
    pub fn resolve_node_id(&self) -> String {
        match &self.node_id {
            Some(id) => id.clone(),
            None => format!("sim-{:08x}", rand::thread_rng().gen::<u32>()),
        }
    }
}

mod humantime_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert!(config.detached);
        assert!(!config.debug);
        assert_eq!(config.port_timeout, Duration::from_secs(10));
        assert!(!NodeConfig::attached().detached);
        assert_eq!(NodeConfig::testing().seed, Some(42));
    }

    #[test]
    fn test_from_json() {
        let config = NodeConfig::from_json(
            r#"{"node_id": "sim-1", "detached": false, "port_timeout": "1s 500ms", "seed": 7}"#,
        )
        .unwrap();
        assert_eq!(config.node_id.as_deref(), Some("sim-1"));
        assert!(!config.detached);
        assert_eq!(config.port_timeout, Duration::from_millis(1500));
        assert_eq!(config.request_retry, Duration::from_secs(2));
        assert_eq!(config.seed, Some(7));
    }

    #[test]
    fn test_json_roundtrip() {
        let config = NodeConfig::testing().with_node_id("sim-2");
        let json = config.to_json().unwrap();
        assert!(json.contains("\"200ms\""));
        assert_eq!(NodeConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn test_invalid_config() {
        assert!(matches!(
            NodeConfig::from_json(r#"{"port_timeout": "soon"}"#),
            Err(SimError::Config(_))
        ));
        assert!(matches!(
            NodeConfig::from_json(r#"{"request_retry": "0s"}"#),
            Err(SimError::Config(_))
        ));
        assert!(NodeConfig::default().with_node_id("a/b").validate().is_err());
    }

    #[test]
    fn test_random_node_id() {
        let config = NodeConfig::default();
        let a = config.resolve_node_id();
        assert!(a.starts_with("sim-"));
        assert_eq!(a.len(), 12);
        assert_eq!(config.with_node_id("fixed").resolve_node_id(), "fixed");
    }
}
