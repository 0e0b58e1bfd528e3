//! # Game Server Wire Protocols
//!
//! Pure encoders and decoders for the three wire formats a Source engine
//! dedicated server speaks to the fleet monitor. Nothing in this crate touches
//! a socket; the monitor owns all I/O and timing.
//!
//! ## Query (`query`)
//! The A2S UDP query protocol: `A2S_INFO` for name/map/version/occupancy and
//! `A2S_PLAYER` for the player list. Both support the challenge handshake that
//! newer servers require before answering.
//!
//! ## Remote Console (`rcon`)
//! Framing for the TCP remote console: little-endian length-prefixed packets
//! carrying an id, a type and a NUL-terminated body.
//!
//! ## Log Stream (`log_packet`)
//! Datagrams pushed by servers after `logaddress_add`: a 5-byte header
//! (`FF FF FF FF` plus a type byte) followed by one UTF-8 log line.
//!
//! ## Versions (`version`)
//! Engine builds are compared as integers (`1.38.7.9` becomes `13879`), the
//! same representation the Steam up-to-date check reports.

pub mod error;
pub mod log_packet;
pub mod query;
pub mod rcon;
pub mod version;

pub use error::ProtocolError;
pub use log_packet::{decode_log_packet, LogLine, MAX_LOG_PACKET_SIZE};
pub use query::{InfoResponse, PlayerEntry, QueryResponse, MAX_PACKET_SIZE};
pub use rcon::RconPacket;
pub use version::GameVersion;

/// Prefix shared by every single-packet query response and log datagram
pub const PACKET_HEADER: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFF];
