use thiserror::Error;

/// Decoding failures for every wire format in this crate
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("packet truncated: {needed} more bytes expected")]
    Truncated { needed: usize },

    #[error("missing 0xFFFFFFFF packet header")]
    BadHeader,

    #[error("split (multi-packet) responses are not supported")]
    SplitPacket,

    #[error("unexpected response type 0x{0:02x}")]
    UnexpectedType(u8),

    #[error("server kept answering with a new challenge")]
    ChallengeLoop,

    #[error("string field is not NUL-terminated")]
    UnterminatedString,

    #[error("invalid RCON frame size {0}")]
    InvalidFrameSize(i32),

    #[error("invalid version string {0:?}")]
    InvalidVersion(String),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
