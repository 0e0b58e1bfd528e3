//! # Fleet Monitor
//!
//! Keeps an eye on a small fleet of Source engine dedicated servers: probes
//! their liveness and occupancy, runs remote console commands, rolls out game
//! updates without kicking players, and collects the log stream the servers
//! push over UDP.
//!
//! ## Core Responsibilities
//!
//! ### Status Probing
//! Every server is pinged with `A2S_INFO`; live servers are also asked for
//! their player list and engine fields. Failures are recorded as
//! [`model::Probe`] variants, never as errors, so one dead server never stops
//! a sweep over the others.
//!
//! ### Update Rollout
//! The periodic sweep compares each server's build against the version the
//! oracle requires. Empty servers get the update instruction right away;
//! servers with players are held and warned (throttled) until they empty out.
//! The [`ledger::UpdateLedger`] tracks held attempts so stragglers can be
//! escalated, and announces when the rollout starts and completes.
//!
//! ### Log Relay
//! A single shared UDP listener receives log lines from every attached server
//! and republishes them, attributed by sender address, on the
//! [`events::EventBus`].
//!
//! ## Module Organization
//!
//! ### Sessions (`session`, `retry`, `gateway`)
//! One lazily created session per server address, wrapped by the
//! [`gateway::QueryGateway`] which adds per-call timeouts, bounded retries
//! with fixed backoff, and a single credential refresh on a rejected RCON
//! password.
//!
//! ### Fleet (`fleet`, `ledger`)
//! The sweep and the rollout state machine.
//!
//! ### Relay (`relay`)
//! Listener lifecycle and `logaddress_add`/`logaddress_del` registration.
//!
//! ### Collaborators (`collaborators`, `providers`, `store`)
//! Traits for everything the monitor consumes but does not own (credentials,
//! target version, persistence, public address) plus the implementations the
//! daemon ships with.
//!
//! ## Concurrency
//!
//! Everything runs on the tokio multi-threaded runtime. The session cache and
//! the ledger are `DashMap`s, counters are atomics, and the sweep guard and
//! relay listener flag use compare-and-set so overlapping triggers are
//! harmless.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use monitor::config::MonitorConfig;
//! use monitor::events::EventBus;
//! use monitor::fleet::FleetMonitor;
//! use monitor::gateway::QueryGateway;
//! use monitor::providers::{ConfigCatalog, SteamVersionOracle};
//! use monitor::session::SourceSessionFactory;
//! use monitor::store::MemoryStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = MonitorConfig::load("monitor.toml").await?;
//!     let catalog = Arc::new(ConfigCatalog::new("monitor.toml", config.commands.clone()));
//!     let gateway = Arc::new(QueryGateway::new(
//!         Arc::new(SourceSessionFactory),
//!         catalog.clone(),
//!         config.query.retry_policy(),
//!     ));
//!     let store = Arc::new(MemoryStore::new(config.seed_servers()));
//!     let oracle = Arc::new(SteamVersionOracle::new(
//!         config.version.check_url.clone(),
//!         config.version.app_id,
//!     )?);
//!
//!     let monitor = FleetMonitor::new(gateway, store, catalog, oracle, EventBus::default(), config.monitor);
//!     println!("{:?}", monitor.update_game_servers().await);
//!     Ok(())
//! }
//! ```

pub mod collaborators;
pub mod config;
pub mod error;
pub mod events;
pub mod fleet;
pub mod gateway;
pub mod ledger;
pub mod model;
pub mod providers;
pub mod relay;
pub mod retry;
pub mod session;
pub mod store;

#[cfg(test)]
mod test_support;

pub use error::{GatewayError, QueryError, RelayError};
pub use events::{EventBus, Notification};
pub use fleet::{FleetMonitor, SweepOutcome};
pub use model::{GameServer, Probe};
