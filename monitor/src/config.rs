//! TOML configuration for the monitor daemon
//!
//! Every section and every key is optional; a missing file section falls back
//! to the defaults below.

use crate::model::GameServer;
use crate::retry::RetryPolicy;
use anyhow::{bail, Context, Result};
use log::warn;
use serde::Deserialize;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub monitor: MonitorSettings,
    pub query: QuerySettings,
    pub relay: RelaySettings,
    pub version: VersionSettings,
    pub store: StoreSettings,
    pub servers: Vec<ServerEntry>,
    pub commands: CommandTemplates,
}

/// Sweep cadence and rollout policy
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub sweep_interval_secs: u64,
    pub status_interval_secs: u64,
    pub status_max_age_secs: u64,
    /// How long after an issued update a server is left alone
    pub update_grace_secs: u64,
    /// Held attempts after which a server is reported as a straggler
    pub escalation_threshold: u32,
    pub announce_throttle_secs: u64,
    pub parallelism: usize,
    pub password_lifetime_secs: u64,
    pub password_rotation_margin_secs: u64,
    pub announce_message: String,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 300,
            status_interval_secs: 60,
            status_max_age_secs: 120,
            update_grace_secs: 600,
            escalation_threshold: 6,
            announce_throttle_secs: 1200,
            parallelism: 8,
            password_lifetime_secs: 86400,
            password_rotation_margin_secs: 3600,
            announce_message: "A game update is pending. The server will restart once it is empty."
                .to_string(),
        }
    }
}

impl MonitorSettings {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs.max(1))
    }

    pub fn status_max_age(&self) -> Duration {
        Duration::from_secs(self.status_max_age_secs)
    }

    pub fn update_grace(&self) -> Duration {
        Duration::from_secs(self.update_grace_secs)
    }

    pub fn announce_throttle(&self) -> Duration {
        Duration::from_secs(self.announce_throttle_secs)
    }

    /// Age at which a stored RCON password is refreshed proactively
    pub fn password_refresh_age(&self) -> Duration {
        Duration::from_secs(
            self.password_lifetime_secs
                .saturating_sub(self.password_rotation_margin_secs),
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QuerySettings {
    pub attempts: u32,
    pub backoff_ms: u64,
    pub timeout_ms: u64,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_ms: 1000,
            timeout_ms: 3000,
        }
    }
}

impl QuerySettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.attempts,
            backoff: Duration::from_millis(self.backoff_ms),
            timeout: Duration::from_millis(self.timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Absent disables the log relay
    pub port: Option<u16>,
    pub bind_ip: IpAddr,
    /// Skips the IP lookup when set
    pub public_ip: Option<IpAddr>,
    pub ip_lookup_url: String,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            port: None,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            public_ip: None,
            ip_lookup_url: "https://api.ipify.org".to_string(),
        }
    }
}

impl RelaySettings {
    /// The configured listener port, if it is usable
    pub fn listen_port(&self) -> Option<u16> {
        match self.port {
            Some(0) => {
                warn!("relay.port = 0 is not a usable log port, relay disabled");
                None
            }
            port => port,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VersionSettings {
    pub app_id: u32,
    pub check_url: String,
}

impl Default for VersionSettings {
    fn default() -> Self {
        Self {
            app_id: 730,
            check_url: "https://api.steampowered.com/ISteamApps/UpToDateCheck/v1/".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// JSON snapshot of the fleet; kept in memory only when absent
    pub path: Option<PathBuf>,
}

/// One configured server
#[derive(Debug, Clone, Deserialize)]
pub struct ServerEntry {
    pub id: String,
    pub address: SocketAddr,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub rcon_password: String,
    #[serde(default)]
    pub server_password: Option<String>,
    /// Attach the log relay at startup
    #[serde(default)]
    pub log: bool,
}

impl ServerEntry {
    pub fn to_server(&self) -> GameServer {
        let name = self.name.clone().unwrap_or_else(|| self.id.clone());
        let mut server = GameServer::new(self.id.clone(), self.address, name)
            .with_rcon_password(self.rcon_password.clone());
        server.server_password = self.server_password.clone();
        server.log_enabled = self.log;
        server
    }
}

/// Shell command templates for lifecycle actions
///
/// `{id}`, `{address}` and `{name}` are substituted before the command is
/// handed to `shell -c`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CommandTemplates {
    pub shell: String,
    pub update: Option<String>,
    pub restart: Option<String>,
    pub stop: Option<String>,
}

impl Default for CommandTemplates {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            update: None,
            restart: None,
            stop: None,
        }
    }
}

impl MonitorConfig {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("in config {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: MonitorConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut addresses = HashSet::new();
        let mut ids = HashSet::new();
        for entry in &self.servers {
            if !addresses.insert(entry.address) {
                bail!("server address {} is configured twice", entry.address);
            }
            if !ids.insert(entry.id.as_str()) {
                bail!("server id {:?} is configured twice", entry.id);
            }
        }
        if self.monitor.parallelism == 0 {
            bail!("monitor.parallelism must be at least 1");
        }
        Ok(())
    }

    pub fn seed_servers(&self) -> Vec<GameServer> {
        self.servers.iter().map(ServerEntry::to_server).collect()
    }

    pub fn server(&self, id: &str) -> Option<&ServerEntry> {
        self.servers.iter().find(|entry| entry.id == id)
    }
}
