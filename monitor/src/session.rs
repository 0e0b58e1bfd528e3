//! Per-address server sessions and the cache that memoizes them
//!
//! A session owns one connected UDP socket for A2S queries and, lazily, one
//! authenticated RCON connection. Sessions are created on first use and live
//! for the rest of the process; the cache guarantees at most one per address.

use crate::error::QueryError;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, info, warn};
use protocol::query::{self, QueryResponse, NO_CHALLENGE};
use protocol::rcon::{self, RconPacket, AUTH_FAILED_ID};
use protocol::{InfoResponse, PlayerEntry, ProtocolError, MAX_PACKET_SIZE};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Mutex;

/// How many challenge round-trips a query tolerates before giving up
const MAX_CHALLENGE_ROUNDS: usize = 3;

/// Query and command handle for one server
#[async_trait]
pub trait ServerSession: Send + Sync {
    async fn info(&self) -> Result<InfoResponse, QueryError>;

    async fn players(&self) -> Result<Vec<PlayerEntry>, QueryError>;

    async fn rcon(&self, password: &str, command: &str) -> Result<String, QueryError>;
}

/// Creates sessions; swapped out in tests
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn connect(&self, address: SocketAddr) -> Result<Arc<dyn ServerSession>, QueryError>;
}

/// Memoized sessions keyed by server address
pub struct SessionCache {
    sessions: DashMap<SocketAddr, Arc<dyn ServerSession>>,
    factory: Arc<dyn SessionFactory>,
    retry: RetryPolicy,
}

impl SessionCache {
    pub fn new(factory: Arc<dyn SessionFactory>, retry: RetryPolicy) -> Self {
        Self {
            sessions: DashMap::new(),
            factory,
            retry,
        }
    }

    /// Returns the cached session or creates one, retrying creation with backoff
    ///
    /// A failed creation caches nothing, so the next call tries again. When two
    /// callers race to create the same session the first insert wins and the
    /// other session is dropped.
    pub async fn get_or_create(
        &self,
        address: SocketAddr,
    ) -> Result<Arc<dyn ServerSession>, QueryError> {
        if let Some(session) = self.sessions.get(&address) {
            return Ok(Arc::clone(session.value()));
        }

        let factory = self.factory.as_ref();
        let session = self
            .retry
            .run("session setup", move || factory.connect(address))
            .await
            .map_err(|failure| {
                warn!(
                    "Could not create session for {} after {} attempts: {}",
                    address, failure.attempts, failure.error
                );
                failure.error
            })?;

        let session = Arc::clone(self.sessions.entry(address).or_insert(session).value());
        debug!("Session ready for {}", address);
        Ok(session)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, address: &SocketAddr) -> bool {
        self.sessions.contains_key(address)
    }
}

/// Builds [`SourceSession`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct SourceSessionFactory;

#[async_trait]
impl SessionFactory for SourceSessionFactory {
    async fn connect(&self, address: SocketAddr) -> Result<Arc<dyn ServerSession>, QueryError> {
        let session = SourceSession::connect(address).await?;
        Ok(Arc::new(session))
    }
}

/// Live session against a Source engine server
pub struct SourceSession {
    address: SocketAddr,
    socket: UdpSocket,
    /// One outstanding query at a time on the shared socket
    query_lock: Mutex<()>,
    rcon: Mutex<Option<RconConnection>>,
}

impl SourceSession {
    pub async fn connect(address: SocketAddr) -> Result<Self, QueryError> {
        let local: SocketAddr = if address.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(address).await?;
        info!("Opened query session for {}", address);

        Ok(Self {
            address,
            socket,
            query_lock: Mutex::new(()),
            rcon: Mutex::new(None),
        })
    }

    /// Drops datagrams left over from a query that timed out
    fn drain_stale(&self) {
        let mut scratch = [0u8; MAX_PACKET_SIZE];
        while let Ok(len) = self.socket.try_recv(&mut scratch) {
            debug!("Dropped {} stale bytes from {}", len, self.address);
        }
    }

    async fn exchange(&self, request: &[u8]) -> Result<QueryResponse, QueryError> {
        self.drain_stale();
        self.socket.send(request).await?;

        let mut buffer = [0u8; MAX_PACKET_SIZE];
        let len = self.socket.recv(&mut buffer).await?;
        Ok(query::parse_response(&buffer[..len])?)
    }
}

#[async_trait]
impl ServerSession for SourceSession {
    async fn info(&self) -> Result<InfoResponse, QueryError> {
        let _guard = self.query_lock.lock().await;

        let mut challenge = None;
        for _ in 0..MAX_CHALLENGE_ROUNDS {
            match self.exchange(&query::info_request(challenge)).await? {
                QueryResponse::Info(info) => return Ok(info),
                QueryResponse::Challenge(value) => challenge = Some(value),
                QueryResponse::Players(_) => {
                    return Err(ProtocolError::UnexpectedType(b'D').into());
                }
            }
        }
        Err(ProtocolError::ChallengeLoop.into())
    }

    async fn players(&self) -> Result<Vec<PlayerEntry>, QueryError> {
        let _guard = self.query_lock.lock().await;

        let mut challenge = NO_CHALLENGE;
        for _ in 0..MAX_CHALLENGE_ROUNDS {
            match self.exchange(&query::player_request(challenge)).await? {
                QueryResponse::Players(players) => return Ok(players),
                QueryResponse::Challenge(value) => challenge = value,
                QueryResponse::Info(_) => {
                    return Err(ProtocolError::UnexpectedType(b'I').into());
                }
            }
        }
        Err(ProtocolError::ChallengeLoop.into())
    }

    async fn rcon(&self, password: &str, command: &str) -> Result<String, QueryError> {
        let mut slot = self.rcon.lock().await;

        // Taken out of the slot so a cancelled or failed command never leaves
        // a half-read stream behind for the next caller
        let mut connection = match slot.take() {
            Some(connection) if connection.password == password => connection,
            _ => RconConnection::open(self.address, password).await?,
        };

        let output = connection.execute(command).await?;
        *slot = Some(connection);
        Ok(output)
    }
}

/// Authenticated remote console stream
struct RconConnection {
    stream: TcpStream,
    password: String,
    next_id: i32,
}

impl RconConnection {
    async fn open(address: SocketAddr, password: &str) -> Result<Self, QueryError> {
        let stream = TcpStream::connect(address).await?;
        let mut connection = Self {
            stream,
            password: password.to_string(),
            next_id: rand::random::<i32>() & 0x3FFF_FFFF,
        };
        connection.authenticate().await?;
        debug!("Authenticated rcon connection to {}", address);
        Ok(connection)
    }

    fn take_id(&mut self) -> i32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1) & 0x3FFF_FFFF;
        id
    }

    async fn authenticate(&mut self) -> Result<(), QueryError> {
        let id = self.take_id();
        let password = self.password.clone();
        self.send(&RconPacket::auth(id, &password)).await?;

        // Servers send an empty RESPONSE_VALUE ahead of the auth response
        loop {
            let packet = self.receive().await?;
            if !packet.is_auth_response() {
                continue;
            }
            if packet.id == AUTH_FAILED_ID {
                return Err(QueryError::AuthenticationFailed);
            }
            if packet.id == id {
                return Ok(());
            }
        }
    }

    async fn execute(&mut self, command: &str) -> Result<String, QueryError> {
        let id = self.take_id();
        let marker = self.take_id();
        self.send(&RconPacket::command(id, command)).await?;
        self.send(&RconPacket::end_marker(marker)).await?;

        let mut output = String::new();
        loop {
            let packet = self.receive().await?;
            if packet.id == id {
                output.push_str(&packet.body);
            } else if packet.id == marker {
                return Ok(output);
            } else if packet.is_auth_response() && packet.id == AUTH_FAILED_ID {
                return Err(QueryError::AuthenticationFailed);
            } else {
                debug!("Skipping rcon frame with unexpected id {}", packet.id);
            }
        }
    }

    async fn send(&mut self, packet: &RconPacket) -> Result<(), QueryError> {
        self.stream.write_all(&packet.encode()).await?;
        Ok(())
    }

    async fn receive(&mut self) -> Result<RconPacket, QueryError> {
        let mut prefix = [0u8; 4];
        self.stream.read_exact(&mut prefix).await?;
        let len = rcon::frame_len(prefix)?;

        let mut frame = vec![0u8; len];
        self.stream.read_exact(&mut frame).await?;
        Ok(RconPacket::decode(&frame)?)
    }
}
