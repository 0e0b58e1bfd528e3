//! Typed notifications published by the monitor and the log relay

use protocol::GameVersion;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRef {
    pub address: SocketAddr,
    pub name: String,
}

/// One line pushed by a server's log stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    /// Display name of the attributed server, or the sender IP when unknown
    pub source: String,
    pub address: SocketAddr,
    pub line: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Straggler {
    pub address: SocketAddr,
    pub name: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Attached(ServerRef),
    Detached(ServerRef),
    LogLine(LogEvent),
    UpdateStarted {
        version: GameVersion,
    },
    UpdateCompleted {
        version: GameVersion,
        attempts: HashMap<SocketAddr, u32>,
    },
    UpdateDelayed {
        version: GameVersion,
        stragglers: Vec<Straggler>,
    },
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notification::Attached(server) => {
                write!(f, "log relay attached to {} ({})", server.name, server.address)
            }
            Notification::Detached(server) => {
                write!(f, "log relay detached from {} ({})", server.name, server.address)
            }
            Notification::LogLine(event) => write!(f, "[{}] {}", event.source, event.line),
            Notification::UpdateStarted { version } => {
                write!(f, "update to {} started", version)
            }
            Notification::UpdateCompleted { version, attempts } => {
                write!(f, "update to {} completed on {} servers", version, attempts.len())
            }
            Notification::UpdateDelayed {
                version,
                stragglers,
            } => {
                write!(f, "update to {} delayed on", version)?;
                for (i, straggler) in stragglers.iter().enumerate() {
                    let sep = if i == 0 { " " } else { ", " };
                    write!(
                        f,
                        "{}{} ({} attempts)",
                        sep, straggler.name, straggler.attempts
                    )?;
                }
                Ok(())
            }
        }
    }
}

/// Fan-out channel for [`Notification`]s
///
/// Publishing never blocks and never fails; with no subscribers a
/// notification is simply dropped. Slow subscribers lag rather than stall
/// the publisher.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Notification>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, notification: Notification) {
        let _ = self.sender.send(notification);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
