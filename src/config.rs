//! Crate configuration: which link names to classify and watch, and
//! whether the encrypted data plane is enabled. Loaded from TOML; every
//! field has a default so an empty file (or no file) works.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Top-level configuration.
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub topology: TopologyConfig,
    #[serde(default)]
    pub ipsec: IpsecConfig,
}

/// Bridge/datapath naming and hairpin watch settings.
#[derive(Debug, Deserialize)]
pub struct TopologyConfig {
    /// Name of the overlay bridge link.
    #[serde(default = "default_bridge_name")]
    pub bridge_name: String,
    /// Name of the datapath link.
    #[serde(default = "default_datapath_name")]
    pub datapath_name: String,
    /// Buffered link-change events per hairpin watch.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            bridge_name: default_bridge_name(),
            datapath_name: default_datapath_name(),
            event_buffer: default_event_buffer(),
        }
    }
}

/// Encrypted tunnel settings.
#[derive(Debug, Deserialize)]
pub struct IpsecConfig {
    /// Install kernel SAs/policies for peer sessions.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Flush the security-policy database on startup.
    #[serde(default = "default_true")]
    pub flush_on_start: bool,
}

impl Default for IpsecConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            flush_on_start: true,
        }
    }
}

fn default_bridge_name() -> String {
    crate::bridge::BRIDGE_IFNAME.to_string()
}

fn default_datapath_name() -> String {
    crate::bridge::DATAPATH_IFNAME.to_string()
}

fn default_event_buffer() -> usize {
    64
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read config {:?}", path.as_ref()))?;
        let config: Config = toml::from_str(&content).context("failed to parse TOML config")?;
        Ok(config)
    }

    /// Load from the first existing well-known path, or fall back to
    /// defaults.
    pub fn load_or_default() -> Self {
        for path in ["/etc/meshplane/config.toml", "./meshplane.toml"] {
            if Path::new(path).exists() {
                match Self::load(path) {
                    Ok(config) => return config,
                    Err(e) => {
                        log::warn!("ignoring config {}: {:#}", path, e);
                    }
                }
            }
        }
        Config::default()
    }
}
