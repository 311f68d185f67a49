use std::path::{Path, PathBuf};
use serde::Deserialize;
use anyhow::{Context, Result};
use shared::protocol::DEFAULT_SERVICES_FILE;
use shared::signal_queue::DEFAULT_PRECISION_MS;
use shared::types::{Network, NetworkType};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    /// Directory holding discovery.dat and its backup
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,
    #[serde(default = "default_defaults_file")]
    pub defaults_file: PathBuf,
    /// Minimum time between two requests to the same service
    #[serde(default = "default_access_throttle")]
    pub access_throttle_secs: u64,
    /// Time after which a zero-rated service may be tried again
    #[serde(default = "default_revival_interval")]
    pub zero_rating_revival_secs: u64,
    /// Revivals allowed before a failing service is banned
    #[serde(default = "default_max_zero_revivals")]
    pub max_zero_revivals: u8,
    #[serde(default = "default_update_interval")]
    pub update_interval_secs: u64,
    #[serde(default = "default_query_interval")]
    pub query_interval_secs: u64,
    #[serde(default = "default_save_interval")]
    pub save_interval_secs: u64,
    #[serde(default = "default_networks")]
    pub networks: Vec<Network>,
    /// Web caches accepted from a single query reply
    #[serde(default = "default_max_caches_per_reply")]
    pub max_caches_per_reply: usize,
    /// Web caches learned from replies stop being added past this total
    #[serde(default = "default_max_gwc_services")]
    pub max_gwc_services: usize,
    /// Our reachable "ip:port", sent to web caches on update
    #[serde(default)]
    pub advertised_address: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Four letter vendor code sent to web caches
    #[serde(default = "default_client_id")]
    pub client_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_precision")]
    pub precision_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_data_path() -> PathBuf {
    PathBuf::from("/var/lib/discoveryd")
}

fn default_defaults_file() -> PathBuf {
    PathBuf::from("/usr/share/discoveryd").join(DEFAULT_SERVICES_FILE)
}

fn default_access_throttle() -> u64 {
    3600
}

fn default_revival_interval() -> u64 {
    86400
}

fn default_max_zero_revivals() -> u8 {
    3
}

fn default_update_interval() -> u64 {
    3600
}

fn default_query_interval() -> u64 {
    600
}

fn default_save_interval() -> u64 {
    300
}

fn default_networks() -> Vec<Network> {
    vec![Network::G2]
}

fn default_max_caches_per_reply() -> usize {
    10
}

fn default_max_gwc_services() -> usize {
    100
}

fn default_user_agent() -> String {
    format!("discoveryd/{}", env!("CARGO_PKG_VERSION"))
}

fn default_request_timeout() -> u64 {
    30
}

fn default_client_id() -> String {
    "DSCD".to_string()
}

fn default_precision() -> u64 {
    DEFAULT_PRECISION_MS
}

fn default_listen() -> String {
    "127.0.0.1:8054".to_string()
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            data_path: default_data_path(),
            defaults_file: default_defaults_file(),
            access_throttle_secs: default_access_throttle(),
            zero_rating_revival_secs: default_revival_interval(),
            max_zero_revivals: default_max_zero_revivals(),
            update_interval_secs: default_update_interval(),
            query_interval_secs: default_query_interval(),
            save_interval_secs: default_save_interval(),
            networks: default_networks(),
            max_caches_per_reply: default_max_caches_per_reply(),
            max_gwc_services: default_max_gwc_services(),
            advertised_address: None,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            request_timeout_secs: default_request_timeout(),
            client_id: default_client_id(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            precision_ms: default_precision(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl DiscoveryConfig {
    /// All configured networks as one mask
    pub fn network_mask(&self) -> NetworkType {
        self.networks.iter().copied().collect()
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.discovery.access_throttle_secs, 3600);
        assert_eq!(config.discovery.networks, vec![Network::G2]);
        assert_eq!(config.queue.precision_ms, DEFAULT_PRECISION_MS);
        assert_eq!(config.api.listen, "127.0.0.1:8054");
        assert!(config.discovery.advertised_address.is_none());
        assert_eq!(config.discovery.max_caches_per_reply, 10);
        assert_eq!(config.discovery.max_gwc_services, 100);
    }

    #[test]
    fn test_partial_sections() {
        let config: Config = toml::from_str(
            r#"
            [discovery]
            data_path = "/tmp/discovery"
            networks = ["g2", "gnutella"]
            advertised_address = "203.0.113.7:6346"
            max_gwc_services = 20

            [queue]
            precision_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.discovery.data_path, PathBuf::from("/tmp/discovery"));
        assert_eq!(config.discovery.zero_rating_revival_secs, 86400);
        assert!(config.discovery.network_mask().is_network(Network::Gnutella.into()));
        assert_eq!(config.queue.precision_ms, 250);
        assert_eq!(config.network.request_timeout_secs, 30);
        assert_eq!(config.discovery.max_gwc_services, 20);
        assert_eq!(config.discovery.max_caches_per_reply, 10);
    }
}
