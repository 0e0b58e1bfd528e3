//! Interfaces to the systems the monitor depends on but does not own
//!
//! Everything here returns `anyhow::Result`: callers only log or classify these
//! failures, they never match on them.

use crate::model::GameServer;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use protocol::GameVersion;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

/// Current secrets for one server as known by the hosting panel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub rcon_password: String,
    pub server_password: Option<String>,
    /// Anything else the provider knows about the server
    pub metadata: HashMap<String, String>,
}

/// Source of truth for credentials and the lifecycle actions on a server
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn credentials(&self, server_id: &str) -> anyhow::Result<Credentials>;

    /// Asks the host to update the server's game files and restart it
    async fn issue_update(&self, server: &GameServer) -> anyhow::Result<()>;

    async fn restart(&self, server: &GameServer) -> anyhow::Result<()>;

    async fn stop(&self, server: &GameServer) -> anyhow::Result<()>;
}

/// Tells which build every server is expected to run
#[async_trait]
pub trait VersionOracle: Send + Sync {
    async fn target_version(&self) -> anyhow::Result<GameVersion>;
}

/// Persistence for fleet records
#[async_trait]
pub trait ServerStore: Send + Sync {
    async fn find_all(&self) -> anyhow::Result<Vec<GameServer>>;

    async fn find_by_address(&self, address: SocketAddr) -> anyhow::Result<Option<GameServer>>;

    /// Servers never checked, or last checked before `older_than`
    async fn find_due_for_status_check(
        &self,
        older_than: DateTime<Utc>,
    ) -> anyhow::Result<Vec<GameServer>>;

    async fn find_below_version(&self, version: GameVersion) -> anyhow::Result<Vec<GameServer>>;

    async fn save(&self, server: &GameServer) -> anyhow::Result<()>;

    /// Writes only the probe-observed fields onto the stored record
    ///
    /// Status refreshes run beside the sweep; a full save from a stale copy
    /// would roll back update timestamps and rotated passwords.
    async fn save_status(&self, server: &GameServer) -> anyhow::Result<()>;
}

/// Discovers the address game servers should send their logs to
#[async_trait]
pub trait PublicAddressResolver: Send + Sync {
    async fn public_ip(&self) -> anyhow::Result<IpAddr>;
}
