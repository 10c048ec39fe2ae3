//! Process wiring: configuration file loading and transport
//! registration for the demo binary.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};

use group_config::CollisionPolicy;
use group_crypto::NodeIdentity;
use group_discovery::beacon::DEFAULT_BEACON_PORT;
use group_discovery::{
    BeaconConfig, BeaconTransport, DiscoveryController, LanTransport, RelayTransport,
};
use group_model::ProviderId;

#[derive(Debug, Clone, serde::Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_app_id")]
    pub app_id: String,
    #[serde(default = "default_moniker")]
    pub moniker: String,
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_service_port")]
    pub service_port: u16,
    #[serde(default = "default_true")]
    pub enable_mdns: bool,
    #[serde(default)]
    pub enable_beacon: bool,
    #[serde(default = "default_beacon_port")]
    pub beacon_port: u16,
    #[serde(default)]
    pub relay_addr: Option<String>,
    #[serde(default)]
    pub relay_port: Option<u16>,
    #[serde(default = "default_collision_policy")]
    pub collision_policy: String,
    #[serde(default)]
    pub found_group: Option<String>,
    #[serde(default = "default_discovery_window")]
    pub discovery_window_secs: u64,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_app_id() -> String {
    "groupmesh".into()
}
fn default_moniker() -> String {
    "demo".into()
}
fn default_listen() -> String {
    "0.0.0.0:1337".into()
}
fn default_service_port() -> u16 {
    1337
}
fn default_beacon_port() -> u16 {
    DEFAULT_BEACON_PORT
}
fn default_true() -> bool {
    true
}
fn default_collision_policy() -> String {
    "abort".into()
}
fn default_discovery_window() -> u64 {
    15
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            app_id: default_app_id(),
            moniker: default_moniker(),
            listen: default_listen(),
            service_port: default_service_port(),
            enable_mdns: true,
            enable_beacon: false,
            beacon_port: default_beacon_port(),
            relay_addr: None,
            relay_port: None,
            collision_policy: default_collision_policy(),
            found_group: None,
            discovery_window_secs: default_discovery_window(),
        }
    }
}

impl AppConfig {
    pub fn collision_policy(&self) -> Result<CollisionPolicy> {
        match self.collision_policy.as_str() {
            "abort" => Ok(CollisionPolicy::Abort),
            "delete" => Ok(CollisionPolicy::Delete),
            "single-backup" => Ok(CollisionPolicy::SingleBackup),
            "complete-backup" => Ok(CollisionPolicy::CompleteBackup),
            other => anyhow::bail!("unknown collision policy: {other}"),
        }
    }
}

pub fn load_config(path: &Path) -> Result<AppConfig> {
    if path.exists() {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read {}", path.display()))?;
        let config: AppConfig =
            toml::from_str(&text).with_context(|| format!("parse {}", path.display()))?;
        Ok(config)
    } else {
        Ok(AppConfig::default())
    }
}

/// Register every transport the configuration enables. Registration does
/// not start discovery; the controller does that when asked.
pub async fn register_transports(
    controller: &DiscoveryController,
    config: &AppConfig,
    identity: &NodeIdentity,
    ca_cert_pem: &str,
) -> Result<Vec<ProviderId>> {
    let mut providers = Vec::new();

    if config.enable_mdns {
        let lan = LanTransport::new(&identity.node_id, config.service_port);
        providers.push(controller.register_provider(Arc::new(lan)).await);
    }

    if config.enable_beacon {
        let beacon_config = BeaconConfig {
            port: config.beacon_port,
            ..BeaconConfig::default()
        };
        let beacon = BeaconTransport::new(&identity.node_id, &config.listen, beacon_config);
        providers.push(controller.register_provider(Arc::new(beacon)).await);
    }

    if let (Some(relay_addr), Some(relay_port)) = (&config.relay_addr, config.relay_port) {
        let relay =
            RelayTransport::new(identity, ca_cert_pem, &config.app_id, relay_addr, relay_port)
                .context("create relay transport")?;
        providers.push(controller.register_provider(Arc::new(relay)).await);
    }

    anyhow::ensure!(!providers.is_empty(), "no discovery transports enabled");
    Ok(providers)
}
