//! Log datagrams pushed by servers registered with `logaddress_add`

use crate::error::{ProtocolError, Result};
use crate::PACKET_HEADER;

/// Magic prefix plus the type byte
pub const LOG_HEADER_LEN: usize = 5;

/// Upper bound on a single log datagram
pub const MAX_LOG_PACKET_SIZE: usize = 1400;

/// Type byte of a plain log line (`'R'`)
pub const LOG_TYPE_PLAIN: u8 = 0x52;
/// Type byte of a line prefixed with `sv_logsecret` (`'S'`)
pub const LOG_TYPE_SECRET: u8 = 0x53;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    /// The fifth header byte
    pub kind: u8,
    pub text: String,
}

/// Validates the magic header and extracts the text payload
///
/// Any type byte is accepted so that engine variants with other markers are
/// not silently dropped; the byte is kept on the line for callers that care.
/// Invalid UTF-8 is replaced rather than rejected, and trailing terminators
/// (`\0`, `\n`, `\r`) are trimmed.
pub fn decode_log_packet(data: &[u8]) -> Result<LogLine> {
    if data.len() < LOG_HEADER_LEN || data[..4] != PACKET_HEADER {
        return Err(ProtocolError::BadHeader);
    }

    let text = String::from_utf8_lossy(&data[LOG_HEADER_LEN..]);
    let text = text.trim_end_matches(['\0', '\n', '\r']).to_string();

    Ok(LogLine {
        kind: data[4],
        text,
    })
}
