//! Fleet records and observations

use chrono::{DateTime, Utc};
use protocol::{GameVersion, InfoResponse};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

/// Result of probing a server for a numeric value
///
/// The two failure variants stay distinct: `NoSession` means we never got as
/// far as talking to the server, `QueryFailed` means every retry of the query
/// itself failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum Probe<T> {
    Observed(T),
    NoSession,
    QueryFailed,
}

impl<T: Copy> Probe<T> {
    pub fn observed(&self) -> Option<T> {
        match self {
            Probe::Observed(value) => Some(*value),
            _ => None,
        }
    }

    pub fn is_observed(&self) -> bool {
        matches!(self, Probe::Observed(_))
    }

    /// Carries a failure over to another probe type; observations become `QueryFailed`
    pub fn failure<U>(&self) -> Probe<U> {
        match self {
            Probe::NoSession => Probe::NoSession,
            _ => Probe::QueryFailed,
        }
    }
}

impl<T> Default for Probe<T> {
    fn default() -> Self {
        Probe::NoSession
    }
}

impl<T: fmt::Display> fmt::Display for Probe<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Probe::Observed(value) => write!(f, "{}", value),
            Probe::NoSession => write!(f, "no session"),
            Probe::QueryFailed => write!(f, "query failed"),
        }
    }
}

/// Engine-reported fields, keyed so a caller can apply each one independently
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InfoField {
    Name,
    Map,
    Game,
    Version,
    Players,
    MaxPlayers,
    Bots,
    TvPort,
}

pub type ServerInfo = HashMap<InfoField, String>;

/// Flattens an `A2S_INFO` response into the best-effort field map
pub fn info_fields(info: &InfoResponse) -> ServerInfo {
    let mut fields = ServerInfo::new();
    fields.insert(InfoField::Name, info.name.clone());
    fields.insert(InfoField::Map, info.map.clone());
    fields.insert(InfoField::Game, info.game.clone());
    fields.insert(InfoField::Version, info.version.clone());
    fields.insert(InfoField::Players, info.players.to_string());
    fields.insert(InfoField::MaxPlayers, info.max_players.to_string());
    fields.insert(InfoField::Bots, info.bots.to_string());
    if let Some(tv_port) = info.tv_port {
        fields.insert(InfoField::TvPort, tv_port.to_string());
    }
    fields
}

/// One managed game server as persisted by the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameServer {
    /// Identifier understood by the credential/catalog provider
    pub id: String,
    pub address: SocketAddr,
    pub name: String,
    pub rcon_password: String,
    #[serde(default)]
    pub server_password: Option<String>,
    /// SourceTV relay port
    #[serde(default)]
    pub tv_port: Option<u16>,
    #[serde(default)]
    pub version: Option<GameVersion>,
    #[serde(default)]
    pub map: Option<String>,
    #[serde(default)]
    pub max_players: Option<u32>,
    #[serde(default)]
    pub ping: Probe<u32>,
    #[serde(default)]
    pub players: Probe<u32>,
    /// Attach the log relay to this server at startup
    #[serde(default)]
    pub log_enabled: bool,
    #[serde(default)]
    pub last_status_check: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_rcon_refresh: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_update_attempt: Option<DateTime<Utc>>,
}

impl GameServer {
    pub fn new(id: impl Into<String>, address: SocketAddr, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address,
            name: name.into(),
            rcon_password: String::new(),
            server_password: None,
            tv_port: None,
            version: None,
            map: None,
            max_players: None,
            ping: Probe::NoSession,
            players: Probe::NoSession,
            log_enabled: false,
            last_status_check: None,
            last_rcon_refresh: None,
            last_update_attempt: None,
        }
    }

    pub fn with_rcon_password(mut self, password: impl Into<String>) -> Self {
        self.rcon_password = password.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<GameVersion>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn is_behind(&self, target: GameVersion) -> bool {
        self.version.is_some_and(|version| version.is_behind(target))
    }

    /// Copies the fields a status probe observes, leaving credentials and
    /// update bookkeeping alone
    pub fn apply_status(&mut self, observed: &GameServer) {
        self.ping = observed.ping;
        self.players = observed.players;
        self.map = observed.map.clone();
        self.version = observed.version;
        self.max_players = observed.max_players;
        self.tv_port = observed.tv_port;
        self.last_status_check = observed.last_status_check;
    }
}

impl fmt::Display for GameServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:27015".parse().unwrap()
    }

    #[test]
    fn test_probe_accessors() {
        let observed: Probe<u32> = Probe::Observed(12);
        assert_eq!(observed.observed(), Some(12));
        assert!(observed.is_observed());

        let failed: Probe<u32> = Probe::QueryFailed;
        assert_eq!(failed.observed(), None);
        assert_eq!(failed.failure::<u8>(), Probe::QueryFailed);
        assert_eq!(Probe::<u32>::NoSession.failure::<u8>(), Probe::NoSession);
        assert_eq!(observed.failure::<u8>(), Probe::QueryFailed);
    }

    #[test]
    fn test_probe_serialization_keeps_failures_apart() {
        let json = serde_json::to_string(&Probe::<u32>::NoSession).unwrap();
        assert_eq!(json, r#"{"status":"no_session"}"#);

        let json = serde_json::to_string(&Probe::Observed(7u32)).unwrap();
        assert_eq!(json, r#"{"status":"observed","value":7}"#);

        let back: Probe<u32> = serde_json::from_str(r#"{"status":"query_failed"}"#).unwrap();
        assert_eq!(back, Probe::QueryFailed);
    }

    #[test]
    fn test_new_server_defaults() {
        let server = GameServer::new("srv-1", test_addr(), "Retake #1");
        assert_eq!(server.ping, Probe::NoSession);
        assert_eq!(server.players, Probe::NoSession);
        assert!(server.last_update_attempt.is_none());
        assert!(!server.is_behind(GameVersion(10)));
    }

    #[test]
    fn test_is_behind() {
        let server = GameServer::new("srv-1", test_addr(), "Retake #1").with_version(4);
        assert!(server.is_behind(GameVersion(5)));
        assert!(!server.is_behind(GameVersion(4)));
        assert_eq!(server.to_string(), "Retake #1 (127.0.0.1:27015)");
    }

    #[test]
    fn test_apply_status_keeps_bookkeeping() {
        let stamped = Utc::now();
        let mut stored = GameServer::new("srv-1", test_addr(), "Retake #1")
            .with_rcon_password("rotated")
            .with_version(4);
        stored.last_update_attempt = Some(stamped);
        stored.last_rcon_refresh = Some(stamped);

        let mut observed = GameServer::new("srv-1", test_addr(), "Retake #1")
            .with_rcon_password("stale")
            .with_version(5);
        observed.ping = Probe::Observed(9);
        observed.players = Probe::Observed(3);
        observed.map = Some("de_mirage".to_string());
        observed.last_status_check = Some(stamped);

        stored.apply_status(&observed);

        assert_eq!(stored.ping, Probe::Observed(9));
        assert_eq!(stored.players, Probe::Observed(3));
        assert_eq!(stored.version, Some(GameVersion(5)));
        assert_eq!(stored.map.as_deref(), Some("de_mirage"));
        assert_eq!(stored.last_status_check, Some(stamped));
        assert_eq!(stored.rcon_password, "rotated");
        assert_eq!(stored.last_update_attempt, Some(stamped));
        assert_eq!(stored.last_rcon_refresh, Some(stamped));
    }

    #[test]
    fn test_record_roundtrips_through_json() {
        let mut server = GameServer::new("srv-1", test_addr(), "Retake #1")
            .with_rcon_password("secret")
            .with_version(13879);
        server.ping = Probe::Observed(14);
        server.players = Probe::QueryFailed;
        server.last_status_check = Some(Utc::now());

        let json = serde_json::to_string(&server).unwrap();
        let back: GameServer = serde_json::from_str(&json).unwrap();
        assert_eq!(back, server);
    }
}
