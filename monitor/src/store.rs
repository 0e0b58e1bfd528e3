//! In-memory fleet store with optional JSON snapshot persistence

use crate::collaborators::ServerStore;
use crate::model::GameServer;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};
use parking_lot::RwLock;
use protocol::GameVersion;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Records keyed by address; every save rewrites the snapshot when one is configured
pub struct MemoryStore {
    servers: RwLock<HashMap<SocketAddr, GameServer>>,
    snapshot: Option<PathBuf>,
    /// Serializes snapshot writes
    write_lock: tokio::sync::Mutex<()>,
}

impl MemoryStore {
    pub fn new(servers: impl IntoIterator<Item = GameServer>) -> Self {
        Self {
            servers: RwLock::new(
                servers
                    .into_iter()
                    .map(|server| (server.address, server))
                    .collect(),
            ),
            snapshot: None,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Seeds the store from config and overlays whatever the snapshot remembers
    ///
    /// Seed entries that are absent from the snapshot are added; snapshot
    /// entries whose address is no longer seeded are dropped.
    pub async fn load(path: impl AsRef<Path>, seeds: Vec<GameServer>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut store = Self::new(seeds);

        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            let content = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let saved: Vec<GameServer> = serde_json::from_str(&content)
                .with_context(|| format!("parsing {}", path.display()))?;

            let mut servers = store.servers.write();
            let mut restored = 0;
            for record in saved {
                if let Some(seed) = servers.get_mut(&record.address) {
                    *seed = merge(seed, record);
                    restored += 1;
                }
            }
            info!("Restored {} server records from {}", restored, path.display());
        } else {
            info!("No snapshot at {}, starting fresh", path.display());
        }

        store.snapshot = Some(path);
        Ok(store)
    }

    fn sorted(&self, keep: impl Fn(&GameServer) -> bool) -> Vec<GameServer> {
        let mut servers: Vec<GameServer> = self
            .servers
            .read()
            .values()
            .filter(|server| keep(server))
            .cloned()
            .collect();
        servers.sort_by_key(|server| server.address);
        servers
    }

    async fn write_snapshot(&self, path: &Path) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let content = serde_json::to_string_pretty(&self.sorted(|_| true))?;
        tokio::fs::write(path, content)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        debug!("Snapshot written to {}", path.display());
        Ok(())
    }
}

/// Keeps configured identity from the seed and observed state from the snapshot
fn merge(seed: &GameServer, saved: GameServer) -> GameServer {
    GameServer {
        id: seed.id.clone(),
        name: seed.name.clone(),
        log_enabled: seed.log_enabled,
        ..saved
    }
}

#[async_trait]
impl ServerStore for MemoryStore {
    async fn find_all(&self) -> Result<Vec<GameServer>> {
        Ok(self.sorted(|_| true))
    }

    async fn find_by_address(&self, address: SocketAddr) -> Result<Option<GameServer>> {
        Ok(self.servers.read().get(&address).cloned())
    }

    async fn find_due_for_status_check(&self, older_than: DateTime<Utc>) -> Result<Vec<GameServer>> {
        Ok(self.sorted(|server| {
            server
                .last_status_check
                .map_or(true, |checked| checked < older_than)
        }))
    }

    async fn find_below_version(&self, version: GameVersion) -> Result<Vec<GameServer>> {
        Ok(self.sorted(|server| server.is_behind(version)))
    }

    async fn save(&self, server: &GameServer) -> Result<()> {
        self.servers
            .write()
            .insert(server.address, server.clone());

        if let Some(path) = &self.snapshot {
            self.write_snapshot(path).await?;
        }
        Ok(())
    }

    async fn save_status(&self, server: &GameServer) -> Result<()> {
        {
            let mut servers = self.servers.write();
            match servers.get_mut(&server.address) {
                Some(stored) => stored.apply_status(server),
                None => {
                    servers.insert(server.address, server.clone());
                }
            }
        }

        if let Some(path) = &self.snapshot {
            self.write_snapshot(path).await?;
        }
        Ok(())
    }
}
