//! Inbound UDP log relay
//!
//! One shared listener receives the log stream of every attached server.
//! Attaching registers the monitor's public `ip:port` on the server through
//! RCON; the listener is started on the first attach and keeps running until
//! its socket fails.
//!
//! Senders are identified by source address only. Anyone who can reach the
//! port can inject lines under a known server's name.

use crate::collaborators::{PublicAddressResolver, ServerStore};
use crate::config::RelaySettings;
use crate::error::RelayError;
use crate::events::{EventBus, LogEvent, Notification, ServerRef};
use crate::gateway::QueryGateway;
use crate::model::GameServer;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use protocol::{decode_log_packet, MAX_LOG_PACKET_SIZE};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

#[derive(Default)]
struct ListenerState {
    running: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
    /// Held across check-and-bind so concurrent starts all see the bind result
    starting: tokio::sync::Mutex<()>,
}

/// Where the listener reads datagrams from
#[async_trait]
trait DatagramSource: Send + Sync + 'static {
    async fn recv_from(&self, buffer: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
}

#[async_trait]
impl DatagramSource for UdpSocket {
    async fn recv_from(&self, buffer: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buffer).await
    }
}

pub struct LogRelay {
    settings: RelaySettings,
    gateway: Arc<QueryGateway>,
    resolver: Arc<dyn PublicAddressResolver>,
    inbound: Inbound,
    listener: Arc<ListenerState>,
}

impl LogRelay {
    pub fn new(
        settings: RelaySettings,
        gateway: Arc<QueryGateway>,
        store: Arc<dyn ServerStore>,
        resolver: Arc<dyn PublicAddressResolver>,
        events: EventBus,
    ) -> Self {
        Self {
            settings,
            gateway,
            resolver,
            inbound: Inbound { store, events },
            listener: Arc::new(ListenerState::default()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.listener.running.load(Ordering::SeqCst)
    }

    /// Address the listener is bound to, while it runs
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.listener.local_addr.lock()
    }

    async fn log_address(&self) -> Result<SocketAddr, RelayError> {
        let port = self.settings.listen_port().ok_or(RelayError::NotConfigured)?;
        let ip = self
            .resolver
            .public_ip()
            .await
            .map_err(RelayError::PublicAddress)?;
        Ok(SocketAddr::new(ip, port))
    }

    /// Starts forwarding `server`'s log stream to this monitor
    ///
    /// The address is deleted before being added again so a server that
    /// already knew it does not end up sending every line twice.
    pub async fn start(&self, server: &mut GameServer) -> Result<(), RelayError> {
        let log_address = self.log_address().await?;
        self.ensure_listening(log_address.port()).await?;

        for command in ["logaddress_add", "logaddress_del", "logaddress_add"] {
            self.gateway
                .rcon_refreshing(server, &format!("{} {}", command, log_address))
                .await?;
        }

        info!("Attached log relay to {} via {}", server, log_address);
        self.inbound
            .events
            .publish(Notification::Attached(server_ref(server)));
        Ok(())
    }

    /// Stops `server` from sending its log stream; the listener stays up
    pub async fn stop(&self, server: &mut GameServer) -> Result<(), RelayError> {
        let log_address = self.log_address().await?;
        self.gateway
            .rcon_refreshing(server, &format!("logaddress_del {}", log_address))
            .await?;

        info!("Detached log relay from {}", server);
        self.inbound
            .events
            .publish(Notification::Detached(server_ref(server)));
        Ok(())
    }

    /// Binds and spawns the listener unless it is already running
    ///
    /// A caller arriving while another start is binding waits for it, so a
    /// failed bind is reported to every caller instead of only the first.
    async fn ensure_listening(&self, port: u16) -> Result<(), RelayError> {
        let _starting = self.listener.starting.lock().await;
        if self.listener.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let addr = SocketAddr::new(self.settings.bind_ip, port);
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| RelayError::Bind { addr, source })?;
        *self.listener.local_addr.lock() = socket.local_addr().ok();
        self.listener.running.store(true, Ordering::SeqCst);
        info!("Log relay listening on {}", addr);

        self.spawn_listener(socket);
        Ok(())
    }

    /// Runs the receive loop; once it ends the relay reports stopped and the
    /// next `start` binds a fresh socket
    fn spawn_listener(&self, source: impl DatagramSource) -> JoinHandle<()> {
        let inbound = self.inbound.clone();
        let listener = Arc::clone(&self.listener);
        tokio::spawn(async move {
            inbound.listen(source).await;
            *listener.local_addr.lock() = None;
            listener.running.store(false, Ordering::SeqCst);
        })
    }
}

fn server_ref(server: &GameServer) -> ServerRef {
    ServerRef {
        address: server.address,
        name: server.name.clone(),
    }
}

/// The receiving half, moved into the listener task
#[derive(Clone)]
struct Inbound {
    store: Arc<dyn ServerStore>,
    events: EventBus,
}

impl Inbound {
    async fn listen(&self, source: impl DatagramSource) {
        let mut buffer = [0u8; MAX_LOG_PACKET_SIZE];
        loop {
            match source.recv_from(&mut buffer).await {
                Ok((len, from)) => self.handle_datagram(&buffer[..len], from).await,
                Err(e) => {
                    error!("Log relay socket failed, listener stopped: {}", e);
                    return;
                }
            }
        }
    }

    async fn handle_datagram(&self, data: &[u8], from: SocketAddr) {
        let line = match decode_log_packet(data) {
            Ok(line) => line,
            Err(e) => {
                warn!("Dropping log datagram from {} ({}): {:02x?}", from, e, data);
                return;
            }
        };

        let source = self.attribute(from).await;
        debug!("[{}] {}", source, line.text);
        self.events.publish(Notification::LogLine(LogEvent {
            source,
            address: from,
            line: line.text,
        }));
    }

    /// Name of the server that sent from `from`, falling back to its IP
    ///
    /// Servers usually log from an ephemeral port, so after an exact address
    /// match the first server sharing the sender's IP is taken.
    async fn attribute(&self, from: SocketAddr) -> String {
        match self.store.find_by_address(from).await {
            Ok(Some(server)) => return server.name,
            Ok(None) => {}
            Err(e) => debug!("Store lookup for {} failed: {:#}", from, e),
        }

        match self.store.find_all().await {
            Ok(servers) => {
                if let Some(server) = servers
                    .into_iter()
                    .find(|server| server.address.ip() == from.ip())
                {
                    return server.name;
                }
            }
            Err(e) => debug!("Store lookup for {} failed: {:#}", from, e),
        }

        warn!("Log line from unknown sender {}", from);
        from.ip().to_string()
    }
}
