//! Failure taxonomy for the monitor
//!
//! Session-level failures (`QueryError`) are classified as transient or not;
//! the gateway turns them into per-operation outcomes (`GatewayError`) after
//! retrying. Nothing here is allowed to escape a per-server boundary during a
//! fleet sweep.

use protocol::ProtocolError;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// A single failed exchange with a server
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("rcon password rejected")]
    AuthenticationFailed,

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl QueryError {
    /// Timeouts and socket errors are worth another attempt; everything else is not
    pub fn is_transient(&self) -> bool {
        matches!(self, QueryError::Timeout(_) | QueryError::Io(_))
    }
}

/// Outcome of a gateway operation after retries
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("no session for {address}: {source}")]
    NoSession {
        address: SocketAddr,
        source: QueryError,
    },

    #[error("{address} unreachable after {attempts} attempts: {source}")]
    Transient {
        address: SocketAddr,
        attempts: u32,
        source: QueryError,
    },

    #[error("rcon authentication failed for {address}")]
    Authentication { address: SocketAddr },

    #[error("protocol failure talking to {address}: {source}")]
    Protocol {
        address: SocketAddr,
        source: QueryError,
    },

    #[error("credential refresh for server {id} failed: {cause:#}")]
    CredentialRefresh { id: String, cause: anyhow::Error },
}

impl GatewayError {
    pub fn is_authentication(&self) -> bool {
        matches!(self, GatewayError::Authentication { .. })
    }
}

/// Failures of the log relay; none of them affect the rest of the monitor
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("log relay port is not configured")]
    NotConfigured,

    #[error("could not resolve public address: {0:#}")]
    PublicAddress(anyhow::Error),

    #[error("could not bind log listener on {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },

    #[error(transparent)]
    Rcon(#[from] GatewayError),
}
