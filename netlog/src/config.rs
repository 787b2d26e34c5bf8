//! Layered configuration: built-in defaults, then the YAML file, then
//! `NETLOG_`-prefixed environment variables, then explicit CLI flags.

use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{cli::Cli, error::ConfigError, filter::FilterConf};

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// NICs to capture on.
    pub interfaces: Vec<String>,
    /// Namespace label stamped on every record.
    pub netns: String,
    /// Ports at or above this aggregate under the wildcard port 0.
    pub port_wildcard_floor: u16,
    pub sweep_interval_secs: u64,
    pub flush_interval_secs: u64,
    /// Idle eviction horizon for active connections.
    pub active_timeout_secs: u64,
    /// How long closed connections linger for late segments and reuse.
    pub linger_timeout_secs: u64,
    /// Emit per-chunk TCP records.
    pub emit_tcp_records: bool,
    /// Emit windowed flow aggregates.
    pub emit_metrics: bool,
    /// Classify gRPC traffic; when off, a gRPC connection's L7 state is
    /// discarded as soon as it is recognized.
    pub enable_grpc: bool,
    /// Packets per chunk before a boundary is forced.
    pub chunk_packet_cap: u32,
    pub filter: FilterConf,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            interfaces: Vec::new(),
            netns: "default".to_owned(),
            port_wildcard_floor: crate::agg::DEFAULT_PORT_WILDCARD_FLOOR,
            sweep_interval_secs: 8,
            flush_interval_secs: 60,
            active_timeout_secs: 120,
            linger_timeout_secs: 60,
            emit_tcp_records: true,
            emit_metrics: true,
            enable_grpc: true,
            chunk_packet_cap: crate::conn::chunk::CHUNK_PACKET_CAP,
            filter: FilterConf::default(),
        }
    }
}

impl Config {
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        if let Some(path) = &cli.config {
            if !path.exists() {
                return Err(ConfigError::NoConfigFile);
            }
            figment = figment.merge(Yaml::file(path));
        }
        figment = figment.merge(Env::prefixed("NETLOG_"));
        if !cli.interfaces.is_empty() {
            figment = figment.merge(Serialized::default("interfaces", &cli.interfaces));
        }

        let config: Config = figment
            .extract()
            .map_err(|e| ConfigError::Extraction(Box::new(e)))?;
        if config.interfaces.is_empty() {
            return Err(ConfigError::NoInterfaces);
        }
        Ok(config)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn timeouts(&self) -> crate::conn::table::SweepTimeouts {
        crate::conn::table::SweepTimeouts {
            active_nanos: self.active_timeout_secs as i64 * 1_000_000_000,
            linger_nanos: self.linger_timeout_secs as i64 * 1_000_000_000,
        }
    }
}
