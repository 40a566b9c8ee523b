//! TOML configuration.
//!
//! Every section has defaults, so an empty file (or no file at all) yields a
//! working configuration. The file is looked up through the
//! `BRIDGETEST_CONFIG` environment variable, then the system location.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::engine::PortId;
use crate::headers::{ipv6_join, Endpoint, MacAddr};

pub const CONFIG_ENV: &str = "BRIDGETEST_CONFIG";
const SYSTEM_CONFIG_PATH: &str = "/etc/bridgetest/bridgetest.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrafficConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub addressing: AddressingConfig,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl TrafficConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Try `$BRIDGETEST_CONFIG`, then the system path, then defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "BRIDGETEST_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// `host:port` of the packet-generation engine.
    #[serde(default = "default_engine_address")]
    pub address: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            address: default_engine_address(),
        }
    }
}

fn default_engine_address() -> String {
    "127.0.0.1:7878".to_string()
}

// ---------------------------------------------------------------------------
// Addressing
// ---------------------------------------------------------------------------

/// Bases from which each port's addresses are derived by adding its port id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressingConfig {
    #[serde(default = "default_base_mac")]
    pub base_mac: MacAddr,
    #[serde(default = "default_base_ipv4")]
    pub base_ipv4: Ipv4Addr,
    /// Destination of IPv4 broadcast streams.
    #[serde(default = "default_broadcast_ipv4")]
    pub broadcast_ipv4: Ipv4Addr,
    /// High 64 bits shared by every port's IPv6 address.
    #[serde(default = "default_ipv6_prefix")]
    pub ipv6_prefix: u64,
    #[serde(default = "default_ipv6_base")]
    pub ipv6_base: u64,
}

impl Default for AddressingConfig {
    fn default() -> Self {
        Self {
            base_mac: default_base_mac(),
            base_ipv4: default_base_ipv4(),
            broadcast_ipv4: default_broadcast_ipv4(),
            ipv6_prefix: default_ipv6_prefix(),
            ipv6_base: default_ipv6_base(),
        }
    }
}

impl AddressingConfig {
    pub fn mac_for(&self, port: PortId) -> MacAddr {
        self.base_mac.offset(u64::from(port.0))
    }

    pub fn ipv4_for(&self, port: PortId) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.base_ipv4).wrapping_add(port.0))
    }

    pub fn ipv6_for(&self, port: PortId) -> Ipv6Addr {
        ipv6_join(self.ipv6_prefix, self.ipv6_base.wrapping_add(u64::from(port.0)))
    }

    pub fn endpoint_for(&self, port: PortId) -> Endpoint {
        Endpoint {
            mac: self.mac_for(port),
            ipv4: self.ipv4_for(port),
            ipv6: self.ipv6_for(port),
        }
    }
}

fn default_base_mac() -> MacAddr {
    MacAddr::new(0x0010_2030_4000)
}

fn default_base_ipv4() -> Ipv4Addr {
    Ipv4Addr::new(192, 168, 58, 10)
}

fn default_broadcast_ipv4() -> Ipv4Addr {
    Ipv4Addr::new(192, 168, 42, 255)
}

fn default_ipv6_prefix() -> u64 {
    0xfd00_0000_0000_003a
}

fn default_ipv6_base() -> u64 {
    0x0a
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Sleep between transmit-state polls.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Upper bound on waiting for transmit to finish. Unset waits forever.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Directory that receives one pcap per interface per run.
    #[serde(default = "default_capture_dir")]
    pub capture_dir: PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            timeout_ms: None,
            capture_dir: default_capture_dir(),
        }
    }
}

impl RunConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_capture_dir() -> PathBuf {
    PathBuf::from(".")
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing` filter directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let cfg: TrafficConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.engine.address, "127.0.0.1:7878");
        assert_eq!(cfg.run.poll_interval(), Duration::from_secs(1));
        assert_eq!(cfg.run.timeout(), None);
        assert_eq!(cfg.addressing.base_mac.to_string(), "00:10:20:30:40:00");
    }

    #[test]
    fn test_partial_sections_override() {
        let cfg: TrafficConfig = toml::from_str(
            r#"
            [engine]
            address = "10.0.0.5:7878"

            [addressing]
            base_mac = "02:00:00:00:10:00"

            [run]
            poll_interval_ms = 50
            timeout_ms = 30000
            "#,
        )
        .unwrap();
        assert_eq!(cfg.engine.address, "10.0.0.5:7878");
        assert_eq!(cfg.addressing.base_mac.value(), 0x0200_0000_1000);
        assert_eq!(cfg.addressing.base_ipv4, Ipv4Addr::new(192, 168, 58, 10));
        assert_eq!(cfg.run.timeout(), Some(Duration::from_secs(30)));
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn test_bad_mac_is_rejected() {
        let err = toml::from_str::<TrafficConfig>("[addressing]\nbase_mac = \"nope\"\n").unwrap_err();
        assert!(err.to_string().contains("invalid MAC address"));
    }

    #[test]
    fn test_addresses_derive_from_port_id() {
        let addressing = AddressingConfig::default();
        let ep = addressing.endpoint_for(PortId(5));
        assert_eq!(ep.mac.to_string(), "00:10:20:30:40:05");
        assert_eq!(ep.ipv4, Ipv4Addr::new(192, 168, 58, 15));
        assert_eq!(ep.ipv6, "fd00:0:0:3a::f".parse::<Ipv6Addr>().unwrap());
    }

    #[test]
    fn test_load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridgetest.toml");
        std::fs::write(&path, "[logging]\nlevel = \"debug\"\njson = true\n").unwrap();
        let cfg = TrafficConfig::load(&path).unwrap();
        assert_eq!(cfg.logging.level, "debug");
        assert!(cfg.logging.json);
        assert!(TrafficConfig::load(&dir.path().join("missing.toml")).is_err());
    }
}
