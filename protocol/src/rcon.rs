//! Remote console framing
//!
//! Every frame is `size:i32le | id:i32le | type:i32le | body\0 | \0`, where
//! `size` counts the bytes after itself.

use crate::error::{ProtocolError, Result};
use bytes::{Buf, BufMut};

pub const SERVERDATA_AUTH: i32 = 3;
pub const SERVERDATA_AUTH_RESPONSE: i32 = 2;
pub const SERVERDATA_EXECCOMMAND: i32 = 2;
pub const SERVERDATA_RESPONSE_VALUE: i32 = 0;

/// Id the server echoes in an auth response when the password was rejected
pub const AUTH_FAILED_ID: i32 = -1;

/// id + type + two terminators
const MIN_FRAME_SIZE: i32 = 10;
/// Servers split anything bigger than 4096 bytes of body across frames
const MAX_FRAME_SIZE: i32 = 4096 + MIN_FRAME_SIZE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RconPacket {
    pub id: i32,
    pub kind: i32,
    pub body: String,
}

impl RconPacket {
    pub fn auth(id: i32, password: &str) -> Self {
        Self {
            id,
            kind: SERVERDATA_AUTH,
            body: password.to_string(),
        }
    }

    pub fn command(id: i32, command: &str) -> Self {
        Self {
            id,
            kind: SERVERDATA_EXECCOMMAND,
            body: command.to_string(),
        }
    }

    /// Empty `RESPONSE_VALUE` the server mirrors back once it has flushed
    /// every frame of the previous command's output
    pub fn end_marker(id: i32) -> Self {
        Self {
            id,
            kind: SERVERDATA_RESPONSE_VALUE,
            body: String::new(),
        }
    }

    pub fn is_auth_response(&self) -> bool {
        self.kind == SERVERDATA_AUTH_RESPONSE
    }

    /// Serializes the packet including its size prefix
    pub fn encode(&self) -> Vec<u8> {
        let size = self.body.len() as i32 + MIN_FRAME_SIZE;
        let mut frame = Vec::with_capacity(size as usize + 4);
        frame.put_i32_le(size);
        frame.put_i32_le(self.id);
        frame.put_i32_le(self.kind);
        frame.put_slice(self.body.as_bytes());
        frame.put_u8(0);
        frame.put_u8(0);
        frame
    }

    /// Decodes the bytes that follow the size prefix
    pub fn decode(frame: &[u8]) -> Result<Self> {
        if frame.len() < MIN_FRAME_SIZE as usize {
            return Err(ProtocolError::Truncated {
                needed: MIN_FRAME_SIZE as usize - frame.len(),
            });
        }

        let mut buf = frame;
        let id = buf.get_i32_le();
        let kind = buf.get_i32_le();
        let end = buf
            .iter()
            .position(|&b| b == 0)
            .ok_or(ProtocolError::UnterminatedString)?;
        let body = String::from_utf8_lossy(&buf[..end]).into_owned();

        Ok(Self { id, kind, body })
    }
}

/// Validates a size prefix and returns how many bytes to read next
pub fn frame_len(prefix: [u8; 4]) -> Result<usize> {
    let size = i32::from_le_bytes(prefix);
    if !(MIN_FRAME_SIZE..=MAX_FRAME_SIZE).contains(&size) {
        return Err(ProtocolError::InvalidFrameSize(size));
    }
    Ok(size as usize)
}
