//! Concrete collaborators used by the daemon
//!
//! - [`ConfigCatalog`]: credentials from the config file, lifecycle actions
//!   through shell command templates
//! - [`SteamVersionOracle`]: target build from the Steam `UpToDateCheck` API
//! - [`HttpIpLookup`] / [`StaticIp`]: the address servers send logs to

use crate::collaborators::{CredentialProvider, Credentials, PublicAddressResolver, VersionOracle};
use crate::config::{CommandTemplates, MonitorConfig};
use crate::model::GameServer;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use protocol::GameVersion;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(120);
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const USER_AGENT: &str = concat!("fleet-monitor/", env!("CARGO_PKG_VERSION"));

/// Credential provider backed by the monitor's own config file
///
/// The file is re-read on every credential lookup so a rotated password can
/// be dropped in without restarting the daemon.
pub struct ConfigCatalog {
    path: PathBuf,
    commands: CommandTemplates,
    timeout: Duration,
}

impl ConfigCatalog {
    pub fn new(path: impl Into<PathBuf>, commands: CommandTemplates) -> Self {
        Self {
            path: path.into(),
            commands,
            timeout: COMMAND_TIMEOUT,
        }
    }

    /// Overrides how long a lifecycle command may run before it is killed
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run_template(
        &self,
        action: &str,
        template: Option<&String>,
        server: &GameServer,
    ) -> Result<()> {
        let template = template.ok_or_else(|| anyhow!("no `{}` command configured", action))?;
        let command = render(template, server);
        info!("Running {} for {}: {}", action, server, command);

        // The child is killed when the timeout drops the output future
        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.commands.shell)
                .arg("-c")
                .arg(&command)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .with_context(|| format!("{} command timed out", action))?
        .with_context(|| format!("failed to spawn {} command", action))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            debug!("{} output: {}", action, stdout.trim());
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "{} command exited with {}: {}",
                action,
                output.status,
                stderr.trim()
            );
        }
        Ok(())
    }
}

fn render(template: &str, server: &GameServer) -> String {
    template
        .replace("{id}", &server.id)
        .replace("{address}", &server.address.to_string())
        .replace("{name}", &server.name)
}

#[async_trait]
impl CredentialProvider for ConfigCatalog {
    async fn credentials(&self, server_id: &str) -> Result<Credentials> {
        let config = MonitorConfig::load(&self.path).await?;
        let entry = config
            .server(server_id)
            .ok_or_else(|| anyhow!("server {} is not in {}", server_id, self.path.display()))?;

        let mut metadata = HashMap::new();
        metadata.insert("address".to_string(), entry.address.to_string());
        if let Some(name) = &entry.name {
            metadata.insert("name".to_string(), name.clone());
        }

        Ok(Credentials {
            rcon_password: entry.rcon_password.clone(),
            server_password: entry.server_password.clone(),
            metadata,
        })
    }

    async fn issue_update(&self, server: &GameServer) -> Result<()> {
        self.run_template("update", self.commands.update.as_ref(), server)
            .await
    }

    async fn restart(&self, server: &GameServer) -> Result<()> {
        self.run_template("restart", self.commands.restart.as_ref(), server)
            .await
    }

    async fn stop(&self, server: &GameServer) -> Result<()> {
        self.run_template("stop", self.commands.stop.as_ref(), server)
            .await
    }
}

#[derive(Debug, Deserialize)]
struct UpToDateCheck {
    response: UpToDateResponse,
}

#[derive(Debug, Deserialize)]
struct UpToDateResponse {
    success: bool,
    #[serde(default)]
    required_version: Option<u32>,
    #[serde(default)]
    error: Option<String>,
}

fn required_version(check: UpToDateCheck) -> Result<GameVersion> {
    let response = check.response;
    if !response.success {
        bail!(
            "version check rejected: {}",
            response.error.as_deref().unwrap_or("no reason given")
        );
    }
    response
        .required_version
        .map(GameVersion)
        .ok_or_else(|| anyhow!("version check returned no required_version"))
}

/// Asks Steam which build is currently required for the app
pub struct SteamVersionOracle {
    client: reqwest::Client,
    url: String,
    app_id: u32,
}

impl SteamVersionOracle {
    pub fn new(url: impl Into<String>, app_id: u32) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            app_id,
        })
    }
}

#[async_trait]
impl VersionOracle for SteamVersionOracle {
    async fn target_version(&self) -> Result<GameVersion> {
        // version=0 is always outdated, so the answer carries required_version
        let response = self
            .client
            .get(&self.url)
            .query(&[
                ("appid", self.app_id.to_string()),
                ("version", "0".to_string()),
                ("format", "json".to_string()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            bail!("version check failed: {}", response.status());
        }

        let version = required_version(response.json().await?)?;
        debug!("Required version for app {} is {}", self.app_id, version);
        Ok(version)
    }
}

/// Discovers the public address through a plain-text "what is my IP" endpoint
pub struct HttpIpLookup {
    client: reqwest::Client,
    url: String,
}

impl HttpIpLookup {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl PublicAddressResolver for HttpIpLookup {
    async fn public_ip(&self) -> Result<IpAddr> {
        let body = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        body.trim().parse().map_err(|e| {
            warn!("IP lookup at {} answered {:?}", self.url, body.trim());
            anyhow!("invalid address from {}: {}", self.url, e)
        })
    }
}

/// Fixed public address from config
#[derive(Debug, Clone, Copy)]
pub struct StaticIp(pub IpAddr);

#[async_trait]
impl PublicAddressResolver for StaticIp {
    async fn public_ip(&self) -> Result<IpAddr> {
        Ok(self.0)
    }
}
