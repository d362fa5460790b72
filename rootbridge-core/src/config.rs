use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

fn _default_listen() -> SocketAddr {
    "127.0.0.1:22000".parse().expect("valid default listen address")
}

fn _default_assets_root() -> PathBuf {
    PathBuf::from("./web")
}

fn _default_approved_identities_file() -> PathBuf {
    PathBuf::from("./data/approved_identities.json")
}

fn _default_control_socket() -> PathBuf {
    PathBuf::from("./data/rootbridge.sock")
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TunnelMode {
    #[default]
    Quick,
    Named,
}

fn _default_tunnel_binary() -> String {
    "cloudflared".to_owned()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TunnelConfig {
    #[serde(default = "_default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub mode: TunnelMode,
    #[serde(default = "_default_tunnel_binary")]
    pub binary: String,
    #[serde(default)]
    pub token: Option<String>,
}

fn _default_true() -> bool {
    true
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: TunnelMode::default(),
            binary: _default_tunnel_binary(),
            token: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct LogConfig {
    #[serde(default)]
    pub format: LogFormat,
}

/// Daemon configuration, loaded once at startup from a YAML file.
///
/// This is not watched for live changes: nothing in the protocol state
/// machine depends on config changing mid-session.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BridgeConfig {
    #[serde(default = "_default_listen")]
    pub listen: SocketAddr,
    #[serde(default = "_default_assets_root")]
    pub assets_root: PathBuf,
    #[serde(default = "_default_approved_identities_file")]
    pub approved_identities_file: PathBuf,
    #[serde(default = "_default_control_socket")]
    pub control_socket: PathBuf,
    pub custom_origin_host: Option<String>,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            listen: _default_listen(),
            assets_root: _default_assets_root(),
            approved_identities_file: _default_approved_identities_file(),
            control_socket: _default_control_socket(),
            custom_origin_host: None,
            tunnel: TunnelConfig::default(),
            log: LogConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<BridgeConfig> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        BridgeError::Config(format!("could not read {}: {e}", path.display()))
    })?;
    let config: BridgeConfig = serde_yaml::from_str(&raw)?;
    Ok(config)
}
