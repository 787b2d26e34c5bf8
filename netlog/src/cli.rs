use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::Level;

#[derive(Parser, Debug, Serialize, Deserialize)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Set the path to the configuration file (e.g., "netlog.yaml").
    #[arg(short, long, value_name = "FILE", env = "NETLOG_CONFIG_PATH")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<PathBuf>,

    /// Interfaces to capture on; repeatable. Overrides the config file.
    #[arg(short, long = "interface", value_name = "IFACE")]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<String>,

    /// Set the application's log level (e.g., "debug", "warn").
    #[arg(
        short,
        long,
        value_name = "LEVEL",
        env = "NETLOG_LOG_LEVEL",
        default_value = "info"
    )]
    #[serde(with = "level_serde")]
    pub log_level: Level,
}

mod level_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(level.as_str())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse::<Level>().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser as _;

    use super::*;

    #[test]
    fn defaults() {
        let cli = Cli::parse_from(["netlog"]);
        assert!(cli.config.is_none());
        assert!(cli.interfaces.is_empty());
        assert_eq!(cli.log_level, Level::INFO);
    }

    #[test]
    fn repeated_interfaces() {
        let cli = Cli::parse_from(["netlog", "-i", "eth0", "-i", "eth1"]);
        assert_eq!(cli.interfaces, vec!["eth0", "eth1"]);
    }

    #[test]
    fn log_level_parses() {
        let cli = Cli::parse_from(["netlog", "--log-level", "debug"]);
        assert_eq!(cli.log_level, Level::DEBUG);
    }
}
