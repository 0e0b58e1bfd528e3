//! Retrying, failure-classifying front end to server sessions
//!
//! Probes (`ping`, `players`, `info`) never fail: they fold every problem into
//! a [`Probe`] variant or an empty map. Remote commands return a
//! [`GatewayError`] that tells the caller whether the session, the network or
//! the password was at fault.

use crate::collaborators::CredentialProvider;
use crate::error::{GatewayError, QueryError};
use crate::model::{info_fields, GameServer, Probe, ServerInfo};
use crate::retry::{RetryFailure, RetryPolicy};
use crate::session::{ServerSession, SessionCache, SessionFactory};
use chrono::Utc;
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::Instant;

pub struct QueryGateway {
    sessions: SessionCache,
    credentials: Arc<dyn CredentialProvider>,
    retry: RetryPolicy,
}

impl QueryGateway {
    pub fn new(
        factory: Arc<dyn SessionFactory>,
        credentials: Arc<dyn CredentialProvider>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            sessions: SessionCache::new(factory, retry),
            credentials,
            retry,
        }
    }

    pub fn sessions(&self) -> &SessionCache {
        &self.sessions
    }

    async fn session(&self, address: SocketAddr) -> Option<Arc<dyn ServerSession>> {
        match self.sessions.get_or_create(address).await {
            Ok(session) => Some(session),
            Err(e) => {
                debug!("No session for {}: {}", address, e);
                None
            }
        }
    }

    /// Round-trip time of an `A2S_INFO` exchange in milliseconds
    pub async fn ping(&self, address: SocketAddr) -> Probe<u32> {
        let Some(session) = self.session(address).await else {
            return Probe::NoSession;
        };
        let session = session.as_ref();

        let result = self
            .retry
            .run("ping", move || async move {
                let started = Instant::now();
                session.info().await?;
                Ok::<_, QueryError>(
                    u32::try_from(started.elapsed().as_millis()).unwrap_or(u32::MAX),
                )
            })
            .await;

        match result {
            Ok(millis) => Probe::Observed(millis),
            Err(failure) => {
                debug!("Ping to {} failed: {}", address, failure.error);
                Probe::QueryFailed
            }
        }
    }

    /// Number of connected players according to `A2S_PLAYER`
    pub async fn players(&self, address: SocketAddr) -> Probe<u32> {
        let Some(session) = self.session(address).await else {
            return Probe::NoSession;
        };
        let session = session.as_ref();

        match self.retry.run("player query", move || session.players()).await {
            Ok(players) => Probe::Observed(u32::try_from(players.len()).unwrap_or(u32::MAX)),
            Err(failure) => {
                debug!("Player query to {} failed: {}", address, failure.error);
                Probe::QueryFailed
            }
        }
    }

    /// Engine fields from `A2S_INFO`, empty when the server cannot be queried
    pub async fn info(&self, address: SocketAddr) -> ServerInfo {
        let Some(session) = self.session(address).await else {
            return ServerInfo::new();
        };
        let session = session.as_ref();

        match self.retry.run("info query", move || session.info()).await {
            Ok(info) => info_fields(&info),
            Err(failure) => {
                debug!("Info query to {} failed: {}", address, failure.error);
                ServerInfo::new()
            }
        }
    }

    /// Runs a console command, retrying transient failures only
    pub async fn rcon(
        &self,
        address: SocketAddr,
        password: &str,
        command: &str,
    ) -> Result<String, GatewayError> {
        let session = self
            .sessions
            .get_or_create(address)
            .await
            .map_err(|source| GatewayError::NoSession { address, source })?;
        let session = session.as_ref();

        self.retry
            .run("rcon", move || session.rcon(password, command))
            .await
            .map_err(|failure| classify(address, failure))
    }

    /// Pulls the current password from the credential provider onto the record
    pub async fn refresh_credentials(&self, server: &mut GameServer) -> Result<(), GatewayError> {
        let credentials = self
            .credentials
            .credentials(&server.id)
            .await
            .map_err(|cause| GatewayError::CredentialRefresh {
                id: server.id.clone(),
                cause,
            })?;

        server.rcon_password = credentials.rcon_password;
        server.server_password = credentials.server_password;
        server.last_rcon_refresh = Some(Utc::now());
        debug!("Refreshed credentials for {}", server);
        Ok(())
    }

    /// Runs a console command with the record's password
    ///
    /// A rejected password triggers exactly one credential refresh followed by
    /// exactly one retry. The refreshed password stays on the record; saving it
    /// is up to the caller.
    pub async fn rcon_refreshing(
        &self,
        server: &mut GameServer,
        command: &str,
    ) -> Result<String, GatewayError> {
        let first = self
            .rcon(server.address, &server.rcon_password, command)
            .await;
        match first {
            Err(e) if e.is_authentication() => {
                info!("RCON password for {} rejected, refreshing", server);
                self.refresh_credentials(server).await?;
                let result = self
                    .rcon(server.address, &server.rcon_password, command)
                    .await;
                if let Err(e) = &result {
                    warn!("RCON to {} still failing after refresh: {}", server, e);
                }
                result
            }
            other => other,
        }
    }
}

fn classify(address: SocketAddr, failure: RetryFailure) -> GatewayError {
    match failure.error {
        QueryError::AuthenticationFailed => GatewayError::Authentication { address },
        source @ QueryError::Protocol(_) => GatewayError::Protocol { address, source },
        source => GatewayError::Transient {
            address,
            attempts: failure.attempts,
            source,
        },
    }
}
