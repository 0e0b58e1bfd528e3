//! In-process fakes shared by the unit tests

use crate::collaborators::{CredentialProvider, Credentials, ServerStore, VersionOracle};
use crate::error::QueryError;
use crate::model::GameServer;
use crate::session::{ServerSession, SessionFactory};
use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use protocol::{GameVersion, InfoResponse, PlayerEntry};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

pub fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

pub fn info_response(name: &str, players: u8) -> InfoResponse {
    InfoResponse {
        protocol: 17,
        name: name.to_string(),
        map: "de_dust2".to_string(),
        folder: "csgo".to_string(),
        game: "Counter-Strike: Global Offensive".to_string(),
        app_id: 730,
        players,
        max_players: 12,
        bots: 0,
        server_type: 'd',
        environment: 'l',
        password_protected: false,
        vac: true,
        version: "1.38.7.9".to_string(),
        port: Some(27015),
        steam_id: None,
        tv_port: Some(27020),
        tv_name: None,
        keywords: None,
        game_id: None,
    }
}

fn unreachable_error() -> QueryError {
    QueryError::Io(io::Error::from(io::ErrorKind::TimedOut))
}

struct ServerState {
    online: bool,
    players: Option<u32>,
    password: String,
    version: String,
    commands: Vec<String>,
}

/// Scriptable game server behind a [`ServerSession`]
pub struct MockServer {
    state: Mutex<ServerState>,
    info_calls: AtomicU32,
    rcon_calls: AtomicU32,
}

impl MockServer {
    /// Online, empty, rcon password `secret`
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ServerState {
                online: true,
                players: Some(0),
                password: "secret".to_string(),
                version: "1.38.7.9".to_string(),
                commands: Vec::new(),
            }),
            info_calls: AtomicU32::new(0),
            rcon_calls: AtomicU32::new(0),
        })
    }

    pub fn set_online(&self, online: bool) {
        self.state.lock().online = online;
    }

    /// `None` makes the player query fail while info keeps working
    pub fn set_players(&self, players: Option<u32>) {
        self.state.lock().players = players;
    }

    pub fn set_password(&self, password: &str) {
        self.state.lock().password = password.to_string();
    }

    /// Version string reported by `A2S_INFO`
    pub fn set_version(&self, version: &str) {
        self.state.lock().version = version.to_string();
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }

    pub fn info_calls(&self) -> u32 {
        self.info_calls.load(Ordering::SeqCst)
    }

    pub fn rcon_calls(&self) -> u32 {
        self.rcon_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServerSession for MockServer {
    async fn info(&self) -> Result<InfoResponse, QueryError> {
        self.info_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock();
        if !state.online {
            return Err(unreachable_error());
        }
        let mut info = info_response("Mock", state.players.unwrap_or(0) as u8);
        info.version = state.version.clone();
        Ok(info)
    }

    async fn players(&self) -> Result<Vec<PlayerEntry>, QueryError> {
        let state = self.state.lock();
        match (state.online, state.players) {
            (true, Some(count)) => Ok((0..count)
                .map(|index| PlayerEntry {
                    index: index as u8,
                    name: format!("player{}", index),
                    score: 0,
                    duration: 60.0,
                })
                .collect()),
            _ => Err(unreachable_error()),
        }
    }

    async fn rcon(&self, password: &str, command: &str) -> Result<String, QueryError> {
        self.rcon_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        if !state.online {
            return Err(unreachable_error());
        }
        if state.password != password {
            return Err(QueryError::AuthenticationFailed);
        }
        state.commands.push(command.to_string());
        Ok(format!("ok: {}", command))
    }
}

/// Hands out [`MockServer`]s by address
#[derive(Default)]
pub struct MockFactory {
    servers: Mutex<HashMap<SocketAddr, Arc<MockServer>>>,
    connects: Mutex<HashMap<SocketAddr, u32>>,
    failures: Mutex<HashMap<SocketAddr, u32>>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, address: SocketAddr, server: Arc<MockServer>) {
        self.servers.lock().insert(address, server);
    }

    /// The next `count` connects to `address` fail
    pub fn fail_connects(&self, address: SocketAddr, count: u32) {
        self.failures.lock().insert(address, count);
    }

    pub fn connects(&self, address: SocketAddr) -> u32 {
        self.connects.lock().get(&address).copied().unwrap_or(0)
    }
}

#[async_trait]
impl SessionFactory for MockFactory {
    async fn connect(&self, address: SocketAddr) -> Result<Arc<dyn ServerSession>, QueryError> {
        *self.connects.lock().entry(address).or_insert(0) += 1;

        if let Some(remaining) = self.failures.lock().get_mut(&address) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(QueryError::Io(io::Error::from(
                    io::ErrorKind::ConnectionRefused,
                )));
            }
        }

        match self.servers.lock().get(&address) {
            Some(server) => Ok(Arc::clone(server) as Arc<dyn ServerSession>),
            None => Err(QueryError::Io(io::Error::from(
                io::ErrorKind::ConnectionRefused,
            ))),
        }
    }
}

/// Credential provider that records every lifecycle action
#[derive(Default)]
pub struct MockCatalog {
    passwords: Mutex<HashMap<String, String>>,
    updates: Mutex<Vec<String>>,
    restarts: Mutex<Vec<String>>,
    stops: Mutex<Vec<String>>,
    credential_calls: AtomicU32,
    fail_updates: AtomicBool,
}

impl MockCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_password(&self, server_id: &str, password: &str) {
        self.passwords
            .lock()
            .insert(server_id.to_string(), password.to_string());
    }

    pub fn fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    pub fn updates(&self) -> Vec<String> {
        self.updates.lock().clone()
    }

    pub fn restarts(&self) -> Vec<String> {
        self.restarts.lock().clone()
    }

    pub fn stops(&self) -> Vec<String> {
        self.stops.lock().clone()
    }

    pub fn credential_calls(&self) -> u32 {
        self.credential_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialProvider for MockCatalog {
    async fn credentials(&self, server_id: &str) -> anyhow::Result<Credentials> {
        self.credential_calls.fetch_add(1, Ordering::SeqCst);
        let password = self
            .passwords
            .lock()
            .get(server_id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown server {}", server_id))?;
        Ok(Credentials {
            rcon_password: password,
            ..Credentials::default()
        })
    }

    async fn issue_update(&self, server: &GameServer) -> anyhow::Result<()> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(anyhow!("panel refused the update"));
        }
        self.updates.lock().push(server.id.clone());
        Ok(())
    }

    async fn restart(&self, server: &GameServer) -> anyhow::Result<()> {
        self.restarts.lock().push(server.id.clone());
        Ok(())
    }

    async fn stop(&self, server: &GameServer) -> anyhow::Result<()> {
        self.stops.lock().push(server.id.clone());
        Ok(())
    }
}

/// Version oracle with a settable answer; `None` means the lookup fails
#[derive(Default)]
pub struct MockOracle {
    target: Mutex<Option<GameVersion>>,
}

impl MockOracle {
    pub fn new(target: Option<GameVersion>) -> Self {
        Self {
            target: Mutex::new(target),
        }
    }

    pub fn set(&self, target: Option<GameVersion>) {
        *self.target.lock() = target;
    }
}

#[async_trait]
impl VersionOracle for MockOracle {
    async fn target_version(&self) -> anyhow::Result<GameVersion> {
        (*self.target.lock()).ok_or_else(|| anyhow!("version service unavailable"))
    }
}

/// Store whose every call fails
pub struct BrokenStore;

#[async_trait]
impl ServerStore for BrokenStore {
    async fn find_all(&self) -> anyhow::Result<Vec<GameServer>> {
        Err(anyhow!("store offline"))
    }

    async fn find_by_address(&self, _address: SocketAddr) -> anyhow::Result<Option<GameServer>> {
        Err(anyhow!("store offline"))
    }

    async fn find_due_for_status_check(
        &self,
        _older_than: DateTime<Utc>,
    ) -> anyhow::Result<Vec<GameServer>> {
        Err(anyhow!("store offline"))
    }

    async fn find_below_version(&self, _version: GameVersion) -> anyhow::Result<Vec<GameServer>> {
        Err(anyhow!("store offline"))
    }

    async fn save(&self, _server: &GameServer) -> anyhow::Result<()> {
        Err(anyhow!("store offline"))
    }

    async fn save_status(&self, _server: &GameServer) -> anyhow::Result<()> {
        Err(anyhow!("store offline"))
    }
}
