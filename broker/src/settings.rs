/*
Application settings for a broker node. Settings are merged from the Settings
file, an environment specific Settings file, and environment variables with
the BROKER prefix. All of the timing settings are in milliseconds.
*/

use config::Config;
use courier_net::data_types::{NodeUuid, PortNumber, Timestamp};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug)]
pub enum SettingsError {
    Error { msg: String },
}

pub type SettingsResult = Result<ClusterSettings, SettingsError>;

#[derive(Clone, Deserialize)]
#[cfg_attr(debug_assertions, derive(Debug))]
pub struct ClusterSettings {
    /// The network interface that this node listens on
    #[serde(default = "default_ip_address")]
    pub ip_address: String,

    /// The port that this node accepts cluster connections on
    #[serde(default = "default_port")]
    pub port: PortNumber,

    /// Identifies this node to the rest of the cluster. Generated on startup
    /// when not configured.
    #[serde(default)]
    pub node_uuid: Option<NodeUuid>,

    /// Addresses of the other nodes in the cluster, as host:port
    #[serde(default)]
    pub peers: Vec<String>,

    #[serde(default = "default_heart_beat_interval")]
    pub heart_beat_interval_ms: Timestamp,

    #[serde(default = "default_heart_beat_timeout")]
    pub heart_beat_timeout_ms: Timestamp,

    #[serde(default = "default_dead_node_timeout")]
    pub dead_node_timeout_ms: Timestamp,

    #[serde(default = "default_cluster_retry")]
    pub cluster_retry_ms: Timestamp,

    #[serde(default = "default_coalesce_interval")]
    pub coalesce_interval_ms: Timestamp,

    #[serde(default = "default_compaction_interval")]
    pub compaction_interval_ms: Timestamp,

    #[serde(default = "default_auction_timeout")]
    pub auction_timeout_ms: Timestamp,

    #[serde(default = "default_bid_timeout")]
    pub bid_timeout_ms: Timestamp,

    #[serde(default = "default_start_timeout")]
    pub start_timeout_ms: Timestamp,
}

fn default_ip_address() -> String {
    String::from("127.0.0.1")
}
fn default_port() -> PortNumber {
    8002
}
fn default_heart_beat_interval() -> Timestamp {
    5000
}
fn default_heart_beat_timeout() -> Timestamp {
    500
}
fn default_dead_node_timeout() -> Timestamp {
    2000
}
fn default_cluster_retry() -> Timestamp {
    10000
}
fn default_coalesce_interval() -> Timestamp {
    15000
}
fn default_compaction_interval() -> Timestamp {
    60000
}
fn default_auction_timeout() -> Timestamp {
    1000
}
fn default_bid_timeout() -> Timestamp {
    2000
}
fn default_start_timeout() -> Timestamp {
    1000
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            ip_address: default_ip_address(),
            port: default_port(),
            node_uuid: None,
            peers: Vec::new(),
            heart_beat_interval_ms: default_heart_beat_interval(),
            heart_beat_timeout_ms: default_heart_beat_timeout(),
            dead_node_timeout_ms: default_dead_node_timeout(),
            cluster_retry_ms: default_cluster_retry(),
            coalesce_interval_ms: default_coalesce_interval(),
            compaction_interval_ms: default_compaction_interval(),
            auction_timeout_ms: default_auction_timeout(),
            bid_timeout_ms: default_bid_timeout(),
            start_timeout_ms: default_start_timeout(),
        }
    }
}

impl ClusterSettings {
    /// Merges configuration sources for the environment and deserializes the
    /// application settings. A malformed configuration is fatal to startup.
    pub fn load(environment: &str) -> SettingsResult {
        let config = match Config::builder()
            .add_source(config::File::with_name("Settings").required(false))
            .add_source(
                config::File::with_name(&("Settings.".to_owned() + environment)).required(false),
            )
            .add_source(config::Environment::with_prefix("BROKER").try_parsing(true))
            .build()
        {
            Ok(config) => config,
            Err(e) => {
                return Err(SettingsError::Error {
                    msg: format!("Failed to merge configuration sources: {e}"),
                })
            }
        };

        match config.try_deserialize::<ClusterSettings>() {
            Ok(settings) => Ok(settings),
            Err(e) => Err(SettingsError::Error {
                msg: format!("Failed to deserialize application settings: {e}"),
            }),
        }
    }

    pub fn authority(self: &Self) -> String {
        format!("{}:{}", self.ip_address, self.port)
    }

    pub fn heart_beat_interval(self: &Self) -> Duration {
        Duration::from_millis(self.heart_beat_interval_ms)
    }

    pub fn heart_beat_timeout(self: &Self) -> Duration {
        Duration::from_millis(self.heart_beat_timeout_ms)
    }

    pub fn cluster_retry(self: &Self) -> Duration {
        Duration::from_millis(self.cluster_retry_ms)
    }

    pub fn coalesce_interval(self: &Self) -> Duration {
        Duration::from_millis(self.coalesce_interval_ms)
    }

    pub fn compaction_interval(self: &Self) -> Duration {
        Duration::from_millis(self.compaction_interval_ms)
    }

    pub fn auction_timeout(self: &Self) -> Duration {
        Duration::from_millis(self.auction_timeout_ms)
    }

    pub fn bid_timeout(self: &Self) -> Duration {
        Duration::from_millis(self.bid_timeout_ms)
    }

    pub fn start_timeout(self: &Self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }
}
