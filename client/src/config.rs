use shared::{DATA_CHANNEL_LABEL, DEFAULT_STUN_SERVER, STATS_INTERVAL_MS};
use std::time::Duration;

/// Settings shared by the mesh, its transports and the health monitor
#[derive(Debug, Clone, PartialEq)]
pub struct MeshConfig {
    /// STUN/TURN urls handed to the link transport
    pub ice_servers: Vec<String>,
    /// Label of the single data channel opened on every link
    pub channel_label: String,
    /// Period of the link statistics sampling
    pub stats_interval: Duration,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            channel_label: DATA_CHANNEL_LABEL.to_string(),
            stats_interval: Duration::from_millis(STATS_INTERVAL_MS),
        }
    }
}

impl MeshConfig {
    pub fn with_ice_servers(mut self, ice_servers: Vec<String>) -> Self {
        self.ice_servers = ice_servers;
        self
    }

    pub fn with_stats_interval(mut self, stats_interval: Duration) -> Self {
        self.stats_interval = stats_interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MeshConfig::default();
        assert_eq!(config.ice_servers, vec!["stun:stun.l.google.com:19302"]);
        assert_eq!(config.channel_label, "gameState");
        assert_eq!(config.stats_interval, Duration::from_secs(2));
    }

    #[test]
    fn test_builder_overrides() {
        let config = MeshConfig::default()
            .with_ice_servers(vec![])
            .with_stats_interval(Duration::from_millis(50));
        assert!(config.ice_servers.is_empty());
        assert_eq!(config.stats_interval, Duration::from_millis(50));
    }
}
