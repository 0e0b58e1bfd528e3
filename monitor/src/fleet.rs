//! Periodic fleet sweep and the rollout state machine
//!
//! A sweep refreshes every server, asks the version oracle for the target
//! build and walks each outdated server through [`FleetMonitor::perform_game_update`].
//! The rollout itself lives in the [`UpdateLedger`]:
//!
//! ```text
//! IDLE --first held/issued server--> IN_PROGRESS --no eligible servers--> COMPLETED --> IDLE
//! ```
//!
//! A single server's failure never aborts a sweep; it is logged and the
//! server is counted as held.

use crate::collaborators::{CredentialProvider, ServerStore, VersionOracle};
use crate::config::MonitorSettings;
use crate::events::{EventBus, Notification, Straggler};
use crate::gateway::QueryGateway;
use crate::ledger::UpdateLedger;
use crate::model::{GameServer, InfoField, Probe, ServerInfo};
use anyhow::anyhow;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use log::{debug, error, info, warn};
use protocol::GameVersion;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepOutcome {
    /// Another sweep was still running
    Skipped,
    StoreUnavailable,
    /// Servers were refreshed but no target version could be resolved
    NoTarget,
    Swept {
        target: GameVersion,
        eligible: usize,
        completed: bool,
    },
}

/// What `perform_game_update` did with one server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateAction {
    HeldForPlayers {
        players: u32,
        attempts: u32,
        announced: bool,
    },
    HeldUnreachable {
        attempts: u32,
    },
    Issued,
    IssueFailed {
        attempts: u32,
    },
}

/// Clears the sweep flag when the sweep ends, however it ends
struct SweepGuard<'a>(&'a AtomicBool);

impl<'a> SweepGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| SweepGuard(flag))
    }
}

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36500))
}

pub struct FleetMonitor {
    gateway: Arc<QueryGateway>,
    store: Arc<dyn ServerStore>,
    credentials: Arc<dyn CredentialProvider>,
    oracle: Arc<dyn VersionOracle>,
    ledger: Arc<UpdateLedger>,
    events: EventBus,
    settings: MonitorSettings,
    sweeping: AtomicBool,
}

impl FleetMonitor {
    pub fn new(
        gateway: Arc<QueryGateway>,
        store: Arc<dyn ServerStore>,
        credentials: Arc<dyn CredentialProvider>,
        oracle: Arc<dyn VersionOracle>,
        events: EventBus,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            gateway,
            store,
            credentials,
            oracle,
            ledger: Arc::new(UpdateLedger::new()),
            events,
            settings,
            sweeping: AtomicBool::new(false),
        }
    }

    pub fn ledger(&self) -> &Arc<UpdateLedger> {
        &self.ledger
    }

    pub fn gateway(&self) -> &Arc<QueryGateway> {
        &self.gateway
    }

    async fn save(&self, server: &GameServer) {
        if let Err(e) = self.store.save(server).await {
            error!("Failed to save {}: {:#}", server, e);
        }
    }

    /// Probes one server and records what was observed
    ///
    /// Info fields are applied one by one; a malformed field is skipped
    /// without discarding the others. A failed ping is copied onto the
    /// player count so both report the same failure.
    ///
    /// Only the status fields are written back, so a copy read before a
    /// concurrent sweep cannot undo that sweep's bookkeeping.
    pub async fn refresh_server_status(&self, server: &mut GameServer) {
        let ping = self.gateway.ping(server.address).await;
        server.ping = ping;

        if ping.is_observed() {
            server.players = self.gateway.players(server.address).await;
            let info = self.gateway.info(server.address).await;
            apply_info(server, &info);
        } else {
            server.players = ping.failure();
        }

        server.last_status_check = Some(Utc::now());
        debug!(
            "Status of {}: ping {}, players {}",
            server, server.ping, server.players
        );
        if let Err(e) = self.store.save_status(server).await {
            error!("Failed to save status of {}: {:#}", server, e);
        }
    }

    /// Pulls the RCON password when it was never fetched or is about to rotate
    ///
    /// Returns whether a refresh happened.
    pub async fn refresh_rcon_password(&self, server: &mut GameServer) -> bool {
        let max_age = to_chrono(self.settings.password_refresh_age());
        let due = server
            .last_rcon_refresh
            .map_or(true, |refreshed| Utc::now() - refreshed >= max_age);
        if !due {
            return false;
        }

        match self.gateway.refresh_credentials(server).await {
            Ok(()) => {
                self.save(server).await;
                true
            }
            Err(e) => {
                warn!("{}", e);
                false
            }
        }
    }

    async fn refresh_all(&self, servers: Vec<GameServer>) -> Vec<GameServer> {
        stream::iter(servers)
            .map(|mut server| async move {
                self.refresh_rcon_password(&mut server).await;
                self.refresh_server_status(&mut server).await;
                server
            })
            .buffer_unordered(self.settings.parallelism.max(1))
            .collect()
            .await
    }

    /// Refreshes servers whose last status check is older than `max_age`
    ///
    /// Returns how many servers were refreshed.
    pub async fn refresh_stale_statuses(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now() - to_chrono(max_age);
        let servers = match self.store.find_due_for_status_check(cutoff).await {
            Ok(servers) => servers,
            Err(e) => {
                error!("Could not list servers due for a status check: {:#}", e);
                return 0;
            }
        };

        let count = servers.len();
        stream::iter(servers)
            .for_each_concurrent(self.settings.parallelism.max(1), |mut server| async move {
                self.refresh_server_status(&mut server).await;
            })
            .await;
        count
    }

    /// One pass of the update state machine over the whole fleet
    pub async fn update_game_servers(&self) -> SweepOutcome {
        let Some(_guard) = SweepGuard::acquire(&self.sweeping) else {
            info!("Previous sweep still running, skipping");
            return SweepOutcome::Skipped;
        };

        let servers = match self.store.find_all().await {
            Ok(servers) => servers,
            Err(e) => {
                error!("Could not list servers: {:#}", e);
                return SweepOutcome::StoreUnavailable;
            }
        };
        let servers = self.refresh_all(servers).await;
        info!("Refreshed {} servers", servers.len());

        let target = match self.oracle.target_version().await {
            Ok(target) => target,
            Err(e) => {
                warn!("Could not resolve target version: {:#}", e);
                return SweepOutcome::NoTarget;
            }
        };

        let behind = match self.store.find_below_version(target).await {
            Ok(behind) => behind,
            Err(e) => {
                error!("Could not list outdated servers: {:#}", e);
                return SweepOutcome::StoreUnavailable;
            }
        };

        let now = Utc::now();
        let grace = to_chrono(self.settings.update_grace());
        let eligible: Vec<GameServer> = behind
            .into_iter()
            .filter(|server| outside_grace(server.last_update_attempt, now, grace))
            .collect();
        let eligible_count = eligible.len();

        if eligible_count > 0 {
            info!("{} servers behind {}", eligible_count, target);
        }

        stream::iter(eligible)
            .for_each_concurrent(self.settings.parallelism.max(1), |mut server| async move {
                let action = self.perform_game_update(&mut server, target).await;
                debug!("{}: {:?}", server, action);
            })
            .await;

        let completed = eligible_count == 0 && !self.ledger.is_empty();
        if completed {
            let attempts = self.ledger.duplicate();
            self.ledger.clear();
            info!("Update to {} completed", target);
            self.events
                .publish(Notification::UpdateCompleted { version: target, attempts });
        } else {
            self.escalate(target, &servers);
        }

        SweepOutcome::Swept {
            target,
            eligible: eligible_count,
            completed,
        }
    }

    fn escalate(&self, target: GameVersion, servers: &[GameServer]) {
        let slow = self
            .ledger
            .get_slow_updates(self.settings.escalation_threshold);
        if slow.is_empty() {
            return;
        }

        let stragglers: Vec<Straggler> = slow
            .into_iter()
            .map(|address| Straggler {
                address,
                name: display_name(servers, address),
                attempts: self.ledger.attempts(&address).unwrap_or(0),
            })
            .collect();
        warn!(
            "Update to {} delayed on {} servers",
            target,
            stragglers.len()
        );
        self.events.publish(Notification::UpdateDelayed {
            version: target,
            stragglers,
        });
    }

    /// Holds, warns, or updates one outdated server
    ///
    /// The server is held while players are connected or while its state is
    /// unknown; every hold counts as an attempt.
    pub async fn perform_game_update(
        &self,
        server: &mut GameServer,
        target: GameVersion,
    ) -> UpdateAction {
        let result = self.ledger.compute_if_absent(server.address);
        if self.ledger.begin_rollout() {
            info!("Rolling out version {}", target);
            self.events
                .publish(Notification::UpdateStarted { version: target });
        }

        match (server.ping, server.players) {
            (Probe::Observed(_), Probe::Observed(players)) if players > 0 => {
                let attempts = result.increment_attempts();
                let announced = result
                    .try_claim_announce(Utc::now(), self.settings.announce_throttle())
                    && self.announce(server).await;
                debug!(
                    "Holding update of {}: {} players connected (attempt {})",
                    server, players, attempts
                );
                UpdateAction::HeldForPlayers {
                    players,
                    attempts,
                    announced,
                }
            }
            (Probe::Observed(_), Probe::Observed(_)) => {
                match self.credentials.issue_update(server).await {
                    Ok(()) => {
                        server.last_update_attempt = Some(Utc::now());
                        info!("Issued update of {} to {}", server, target);
                        self.save(server).await;
                        UpdateAction::Issued
                    }
                    Err(e) => {
                        let attempts = result.increment_attempts();
                        error!("Could not issue update for {}: {:#}", server, e);
                        UpdateAction::IssueFailed { attempts }
                    }
                }
            }
            _ => {
                let attempts = result.increment_attempts();
                debug!(
                    "Holding update of {}: ping {}, players {} (attempt {})",
                    server, server.ping, server.players, attempts
                );
                UpdateAction::HeldUnreachable { attempts }
            }
        }
    }

    async fn announce(&self, server: &mut GameServer) -> bool {
        let refreshed = server.last_rcon_refresh;
        let command = format!("say {}", self.settings.announce_message);
        let result = self.gateway.rcon_refreshing(server, &command).await;

        if server.last_rcon_refresh != refreshed {
            self.save(server).await;
        }
        match result {
            Ok(_) => true,
            Err(e) => {
                warn!("Could not warn players on {}: {}", server, e);
                false
            }
        }
    }

    async fn find(&self, address: SocketAddr) -> anyhow::Result<GameServer> {
        self.store
            .find_by_address(address)
            .await?
            .ok_or_else(|| anyhow!("no server is known at {}", address))
    }

    pub async fn restart_server(&self, address: SocketAddr) -> anyhow::Result<()> {
        let server = self.find(address).await?;
        info!("Restarting {}", server);
        self.credentials.restart(&server).await
    }

    pub async fn stop_server(&self, address: SocketAddr) -> anyhow::Result<()> {
        let server = self.find(address).await?;
        info!("Stopping {}", server);
        self.credentials.stop(&server).await
    }
}

fn outside_grace(
    last_attempt: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    grace: chrono::Duration,
) -> bool {
    last_attempt.map_or(true, |attempted| now - attempted >= grace)
}

fn display_name(servers: &[GameServer], address: SocketAddr) -> String {
    servers
        .iter()
        .find(|server| server.address == address)
        .map(|server| server.name.clone())
        .unwrap_or_else(|| address.to_string())
}

fn apply_info(server: &mut GameServer, info: &ServerInfo) {
    for (field, value) in info {
        match field {
            InfoField::Map => server.map = Some(value.clone()),
            InfoField::Version => match value.parse::<GameVersion>() {
                Ok(version) => server.version = Some(version),
                Err(e) => warn!("Ignoring version reported by {}: {}", server, e),
            },
            InfoField::MaxPlayers => match value.parse() {
                Ok(max) => server.max_players = Some(max),
                Err(_) => warn!("Ignoring max players {:?} reported by {}", value, server),
            },
            InfoField::TvPort => match value.parse() {
                Ok(port) => server.tv_port = Some(port),
                Err(_) => warn!("Ignoring TV port {:?} reported by {}", value, server),
            },
            // Configured name wins; live player count comes from A2S_PLAYER
            InfoField::Name | InfoField::Game | InfoField::Players | InfoField::Bots => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::store::MemoryStore;
    use crate::test_support::{addr, BrokenStore, MockCatalog, MockFactory, MockOracle, MockServer};
    use std::collections::HashMap;
    use tokio::sync::broadcast;

    struct Harness {
        monitor: FleetMonitor,
        servers: HashMap<SocketAddr, Arc<MockServer>>,
        catalog: Arc<MockCatalog>,
        oracle: Arc<MockOracle>,
        store: Arc<MemoryStore>,
        events: broadcast::Receiver<Notification>,
    }

    impl Harness {
        fn mock(&self, port: u16) -> &Arc<MockServer> {
            &self.servers[&addr(port)]
        }

        async fn record(&self, port: u16) -> GameServer {
            self.store
                .find_by_address(addr(port))
                .await
                .unwrap()
                .unwrap()
        }

        fn drain(&mut self) -> Vec<Notification> {
            let mut seen = Vec::new();
            while let Ok(notification) = self.events.try_recv() {
                seen.push(notification);
            }
            seen
        }
    }

    /// `(port, version string, players)` per server, target build 5
    fn harness(fleet: &[(u16, &str, Option<u32>)]) -> Harness {
        let factory = Arc::new(MockFactory::new());
        let catalog = Arc::new(MockCatalog::new());
        let mut servers = HashMap::new();
        let mut records = Vec::new();

        for (port, version, players) in fleet {
            let mock = MockServer::new();
            mock.set_version(version);
            mock.set_players(*players);
            factory.add(addr(*port), Arc::clone(&mock));
            servers.insert(addr(*port), mock);

            let id = format!("srv-{}", port);
            catalog.set_password(&id, "secret");
            records.push(
                GameServer::new(id, addr(*port), format!("Server {}", port))
                    .with_rcon_password("secret"),
            );
        }

        let retry = RetryPolicy {
            attempts: 3,
            backoff: Duration::from_secs(1),
            timeout: Duration::from_secs(3),
        };
        let gateway = Arc::new(QueryGateway::new(factory, catalog.clone(), retry));
        let store = Arc::new(MemoryStore::new(records));
        let oracle = Arc::new(MockOracle::new(Some(GameVersion(5))));
        let events = EventBus::new(64);
        let receiver = events.subscribe();

        let monitor = FleetMonitor::new(
            gateway,
            store.clone(),
            catalog.clone(),
            oracle.clone(),
            events,
            MonitorSettings::default(),
        );

        Harness {
            monitor,
            servers,
            catalog,
            oracle,
            store,
            events: receiver,
        }
    }

    fn started(notifications: &[Notification]) -> usize {
        notifications
            .iter()
            .filter(|n| matches!(n, Notification::UpdateStarted { .. }))
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_fleet_scenario() {
        // A: outdated and empty, B: outdated with players, C: current
        let mut h = harness(&[(1, "4", Some(0)), (2, "4", Some(2)), (3, "5", Some(0))]);
        let before = Utc::now();

        let outcome = h.monitor.update_game_servers().await;
        assert_eq!(
            outcome,
            SweepOutcome::Swept {
                target: GameVersion(5),
                eligible: 2,
                completed: false
            }
        );

        assert_eq!(h.catalog.updates(), vec!["srv-1".to_string()]);
        let a = h.record(1).await;
        let stamped = a.last_update_attempt.expect("update timestamp");
        assert!(stamped >= before && stamped <= Utc::now());

        let ledger = h.monitor.ledger();
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.attempts(&addr(1)), Some(0));
        assert_eq!(ledger.attempts(&addr(2)), Some(1));
        assert_eq!(ledger.attempts(&addr(3)), None);
        assert!(h.record(3).await.last_update_attempt.is_none());

        let seen = h.drain();
        assert_eq!(started(&seen), 1);
        assert!(!seen
            .iter()
            .any(|n| matches!(n, Notification::UpdateCompleted { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollout_completes_once() {
        let mut h = harness(&[(1, "4", Some(0)), (2, "4", Some(2))]);

        h.monitor.update_game_servers().await;
        h.monitor.update_game_servers().await;
        assert_eq!(h.monitor.ledger().attempts(&addr(2)), Some(2));

        // Players leave, B gets its update; A restarted on the new build
        h.mock(2).set_players(Some(0));
        h.mock(1).set_version("5");
        h.monitor.update_game_servers().await;
        assert_eq!(h.catalog.updates(), vec!["srv-1", "srv-2"]);

        h.mock(2).set_version("5");
        let outcome = h.monitor.update_game_servers().await;
        assert_eq!(
            outcome,
            SweepOutcome::Swept {
                target: GameVersion(5),
                eligible: 0,
                completed: true
            }
        );
        assert!(h.monitor.ledger().is_empty());

        let outcome = h.monitor.update_game_servers().await;
        assert!(matches!(
            outcome,
            SweepOutcome::Swept {
                completed: false,
                ..
            }
        ));

        let seen = h.drain();
        assert_eq!(started(&seen), 1);
        let completions: Vec<_> = seen
            .iter()
            .filter_map(|n| match n {
                Notification::UpdateCompleted { version, attempts } => Some((*version, attempts)),
                _ => None,
            })
            .collect();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].0, GameVersion(5));
        assert_eq!(completions[0].1.get(&addr(2)), Some(&2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_carries_current_target() {
        let mut h = harness(&[(1, "4", Some(3))]);
        h.monitor.update_game_servers().await;

        h.mock(1).set_version("6");
        h.oracle.set(Some(GameVersion(6)));
        h.monitor.update_game_servers().await;

        let seen = h.drain();
        assert!(seen.contains(&Notification::UpdateCompleted {
            version: GameVersion(6),
            attempts: HashMap::from([(addr(1), 1)]),
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_players_hold_and_announce_is_throttled() {
        let h = harness(&[(1, "4", Some(4))]);

        for _ in 0..3 {
            h.monitor.update_game_servers().await;
        }

        assert!(h.catalog.updates().is_empty());
        assert_eq!(h.monitor.ledger().attempts(&addr(1)), Some(3));
        let says: Vec<_> = h
            .mock(1)
            .commands()
            .into_iter()
            .filter(|c| c.starts_with("say "))
            .collect();
        assert_eq!(says.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_server_is_held() {
        let h = harness(&[(1, "4", Some(0))]);
        let mut server = h.record(1).await;
        server.ping = Probe::QueryFailed;
        server.players = Probe::QueryFailed;

        let action = h.monitor.perform_game_update(&mut server, GameVersion(5)).await;
        assert_eq!(action, UpdateAction::HeldUnreachable { attempts: 1 });

        server.ping = Probe::Observed(10);
        server.players = Probe::QueryFailed;
        let action = h.monitor.perform_game_update(&mut server, GameVersion(5)).await;
        assert_eq!(action, UpdateAction::HeldUnreachable { attempts: 2 });

        assert!(h.catalog.updates().is_empty());
        assert!(server.last_update_attempt.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_issue_counts_as_attempt() {
        let h = harness(&[(1, "4", Some(0))]);
        h.catalog.fail_updates(true);
        let mut server = h.record(1).await;
        server.ping = Probe::Observed(10);
        server.players = Probe::Observed(0);

        let action = h.monitor.perform_game_update(&mut server, GameVersion(5)).await;
        assert_eq!(action, UpdateAction::IssueFailed { attempts: 1 });
        assert!(server.last_update_attempt.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_window_skips_recent_updates() {
        let h = harness(&[(1, "4", Some(0))]);
        h.monitor.update_game_servers().await;
        let outcome = h.monitor.update_game_servers().await;

        assert_eq!(h.catalog.updates().len(), 1);
        assert!(matches!(
            outcome,
            SweepOutcome::Swept {
                eligible: 0,
                completed: true,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stragglers_escalate() {
        let mut h = harness(&[(1, "4", Some(1)), (2, "4", Some(0))]);
        h.mock(2).set_online(false);
        // Offline servers never report a version, so seed the last known one
        let known = h.record(2).await.with_version(4);
        h.store.save(&known).await.unwrap();

        for _ in 0..6 {
            h.monitor.update_game_servers().await;
        }

        let delayed: Vec<_> = h
            .drain()
            .into_iter()
            .filter_map(|n| match n {
                Notification::UpdateDelayed { stragglers, .. } => Some(stragglers),
                _ => None,
            })
            .collect();
        assert_eq!(delayed.len(), 1);
        assert_eq!(delayed[0].len(), 2);
        assert_eq!(delayed[0][0].name, "Server 1");
        assert_eq!(delayed[0][0].attempts, 6);
        assert_eq!(h.monitor.ledger().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_copies_ping_failure_to_players() {
        let h = harness(&[(1, "4", Some(3))]);
        h.mock(1).set_online(false);
        let mut server = h.record(1).await;

        h.monitor.refresh_server_status(&mut server).await;

        assert_eq!(server.ping, Probe::QueryFailed);
        assert_eq!(server.players, Probe::QueryFailed);
        assert!(server.last_status_check.is_some());
        assert_eq!(h.record(1).await.ping, Probe::QueryFailed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_applies_info_fields() {
        let h = harness(&[(1, "1.38.7.9", Some(3))]);
        let mut server = h.record(1).await;

        h.monitor.refresh_server_status(&mut server).await;

        assert_eq!(server.players, Probe::Observed(3));
        assert_eq!(server.version, Some(GameVersion(13879)));
        assert_eq!(server.map.as_deref(), Some("de_dust2"));
        assert_eq!(server.tv_port, Some(27020));
        assert_eq!(server.name, "Server 1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_version_keeps_other_fields() {
        let h = harness(&[(1, "beta", Some(0))]);
        let mut server = h.record(1).await.with_version(4);

        h.monitor.refresh_server_status(&mut server).await;

        assert_eq!(server.version, Some(GameVersion(4)));
        assert_eq!(server.max_players, Some(12));
    }

    #[tokio::test(start_paused = true)]
    async fn test_password_refresh_only_when_due() {
        let h = harness(&[(1, "4", Some(0))]);
        let mut server = h.record(1).await;

        assert!(h.monitor.refresh_rcon_password(&mut server).await);
        assert!(!h.monitor.refresh_rcon_password(&mut server).await);
        assert_eq!(h.catalog.credential_calls(), 1);

        server.last_rcon_refresh = Some(Utc::now() - chrono::Duration::hours(23));
        assert!(h.monitor.refresh_rcon_password(&mut server).await);
        assert_eq!(h.catalog.credential_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_sweep_is_skipped() {
        let h = harness(&[(1, "4", Some(0))]);
        let _held = SweepGuard::acquire(&h.monitor.sweeping).unwrap();

        assert_eq!(h.monitor.update_game_servers().await, SweepOutcome::Skipped);
        assert!(h.catalog.updates().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_guard_released_after_sweep() {
        let h = harness(&[(1, "4", Some(0))]);
        h.monitor.update_game_servers().await;
        assert!(!h.monitor.sweeping.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_target_version() {
        let h = harness(&[(1, "4", Some(0))]);
        h.oracle.set(None);

        assert_eq!(h.monitor.update_game_servers().await, SweepOutcome::NoTarget);
        assert!(h.record(1).await.last_status_check.is_some());
        assert!(h.catalog.updates().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_failure_aborts_sweep_quietly() {
        let h = harness(&[(1, "4", Some(0))]);
        let monitor = FleetMonitor::new(
            Arc::clone(h.monitor.gateway()),
            Arc::new(BrokenStore),
            h.catalog.clone(),
            h.oracle.clone(),
            EventBus::default(),
            MonitorSettings::default(),
        );

        assert_eq!(
            monitor.update_game_servers().await,
            SweepOutcome::StoreUnavailable
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_stale_statuses() {
        let h = harness(&[(1, "4", Some(0)), (2, "4", Some(0))]);
        let mut fresh = h.record(1).await;
        fresh.last_status_check = Some(Utc::now());
        h.store.save(&fresh).await.unwrap();

        let refreshed = h
            .monitor
            .refresh_stale_statuses(Duration::from_secs(120))
            .await;

        assert_eq!(refreshed, 1);
        assert_eq!(h.mock(1).info_calls(), 0);
        assert!(h.mock(2).info_calls() > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_refresh_keeps_update_stamp() {
        let h = harness(&[(1, "4", Some(0))]);
        let mut stale = h.record(1).await;

        h.monitor.update_game_servers().await;
        let stamped = h.record(1).await.last_update_attempt;
        assert!(stamped.is_some());

        // The status loop read its copy before the sweep stamped the record
        h.monitor.refresh_server_status(&mut stale).await;
        assert_eq!(h.record(1).await.last_update_attempt, stamped);

        tokio::time::advance(Duration::from_secs(5)).await;
        h.monitor.update_game_servers().await;
        assert_eq!(h.catalog.updates(), vec!["srv-1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_and_stop() {
        let h = harness(&[(1, "4", Some(0))]);

        h.monitor.restart_server(addr(1)).await.unwrap();
        h.monitor.stop_server(addr(1)).await.unwrap();
        assert!(h.monitor.restart_server(addr(9)).await.is_err());

        assert_eq!(h.catalog.restarts(), vec!["srv-1"]);
        assert_eq!(h.catalog.stops(), vec!["srv-1"]);
    }
}
