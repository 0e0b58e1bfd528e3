//! A2S query protocol: request builders and response parsing

use crate::error::{ProtocolError, Result};
use crate::PACKET_HEADER;
use bytes::{Buf, BufMut};

/// Largest single-packet response a server sends before splitting
pub const MAX_PACKET_SIZE: usize = 1400;

const SPLIT_HEADER: [u8; 4] = [0xFE, 0xFF, 0xFF, 0xFF];
const INFO_PAYLOAD: &[u8] = b"Source Engine Query\0";

const A2S_INFO: u8 = 0x54;
const A2S_PLAYER: u8 = 0x55;
const S2C_CHALLENGE: u8 = 0x41;
const S2A_INFO: u8 = 0x49;
const S2A_PLAYER: u8 = 0x44;

// Extra data flag bits in A2S_INFO
const EDF_GAME_ID: u8 = 0x01;
const EDF_STEAM_ID: u8 = 0x10;
const EDF_KEYWORDS: u8 = 0x20;
const EDF_SOURCE_TV: u8 = 0x40;
const EDF_PORT: u8 = 0x80;

/// Challenge value that asks the server to issue a fresh challenge
pub const NO_CHALLENGE: i32 = -1;

/// Builds an `A2S_INFO` request, appending the challenge when the server demanded one
pub fn info_request(challenge: Option<i32>) -> Vec<u8> {
    let mut packet = Vec::with_capacity(29);
    packet.put_slice(&PACKET_HEADER);
    packet.put_u8(A2S_INFO);
    packet.put_slice(INFO_PAYLOAD);
    if let Some(challenge) = challenge {
        packet.put_i32_le(challenge);
    }
    packet
}

/// Builds an `A2S_PLAYER` request; pass [`NO_CHALLENGE`] to obtain a challenge first
pub fn player_request(challenge: i32) -> Vec<u8> {
    let mut packet = Vec::with_capacity(9);
    packet.put_slice(&PACKET_HEADER);
    packet.put_u8(A2S_PLAYER);
    packet.put_i32_le(challenge);
    packet
}

/// Server information reported by `A2S_INFO`
#[derive(Debug, Clone, PartialEq)]
pub struct InfoResponse {
    pub protocol: u8,
    pub name: String,
    pub map: String,
    pub folder: String,
    pub game: String,
    pub app_id: u16,
    pub players: u8,
    pub max_players: u8,
    pub bots: u8,
    pub server_type: char,
    pub environment: char,
    pub password_protected: bool,
    pub vac: bool,
    pub version: String,
    pub port: Option<u16>,
    pub steam_id: Option<u64>,
    pub tv_port: Option<u16>,
    pub tv_name: Option<String>,
    pub keywords: Option<String>,
    pub game_id: Option<u64>,
}

/// One row of the `A2S_PLAYER` response
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerEntry {
    pub index: u8,
    pub name: String,
    pub score: i32,
    /// Seconds connected
    pub duration: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryResponse {
    Challenge(i32),
    Info(InfoResponse),
    Players(Vec<PlayerEntry>),
}

/// Parses any single-packet query response
pub fn parse_response(data: &[u8]) -> Result<QueryResponse> {
    if data.len() >= 4 && data[..4] == SPLIT_HEADER {
        return Err(ProtocolError::SplitPacket);
    }
    if data.len() < 5 || data[..4] != PACKET_HEADER {
        return Err(ProtocolError::BadHeader);
    }

    let mut reader = Reader::new(&data[5..]);
    match data[4] {
        S2C_CHALLENGE => Ok(QueryResponse::Challenge(reader.i32()?)),
        S2A_INFO => parse_info(&mut reader).map(QueryResponse::Info),
        S2A_PLAYER => parse_players(&mut reader).map(QueryResponse::Players),
        other => Err(ProtocolError::UnexpectedType(other)),
    }
}

fn parse_info(reader: &mut Reader<'_>) -> Result<InfoResponse> {
    let mut info = InfoResponse {
        protocol: reader.u8()?,
        name: reader.string()?,
        map: reader.string()?,
        folder: reader.string()?,
        game: reader.string()?,
        app_id: reader.u16()?,
        players: reader.u8()?,
        max_players: reader.u8()?,
        bots: reader.u8()?,
        server_type: reader.u8()? as char,
        environment: reader.u8()? as char,
        password_protected: reader.u8()? != 0,
        vac: reader.u8()? != 0,
        version: reader.string()?,
        port: None,
        steam_id: None,
        tv_port: None,
        tv_name: None,
        keywords: None,
        game_id: None,
    };

    // Older servers stop before the extra data flag
    if reader.is_empty() {
        return Ok(info);
    }

    let flags = reader.u8()?;
    if flags & EDF_PORT != 0 {
        info.port = Some(reader.u16()?);
    }
    if flags & EDF_STEAM_ID != 0 {
        info.steam_id = Some(reader.u64()?);
    }
    if flags & EDF_SOURCE_TV != 0 {
        info.tv_port = Some(reader.u16()?);
        info.tv_name = Some(reader.string()?);
    }
    if flags & EDF_KEYWORDS != 0 {
        info.keywords = Some(reader.string()?);
    }
    if flags & EDF_GAME_ID != 0 {
        info.game_id = Some(reader.u64()?);
    }

    Ok(info)
}

fn parse_players(reader: &mut Reader<'_>) -> Result<Vec<PlayerEntry>> {
    let count = reader.u8()?;
    let mut players = Vec::with_capacity(count as usize);
    for _ in 0..count {
        players.push(PlayerEntry {
            index: reader.u8()?,
            name: reader.string()?,
            score: reader.i32()?,
            duration: reader.f32()?,
        });
    }
    Ok(players)
}

/// Bounds-checked little-endian reader; `Buf` itself panics on underflow
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn is_empty(&self) -> bool {
        !self.buf.has_remaining()
    }

    fn ensure(&self, len: usize) -> Result<()> {
        if self.buf.remaining() < len {
            return Err(ProtocolError::Truncated {
                needed: len - self.buf.remaining(),
            });
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self) -> Result<u16> {
        self.ensure(2)?;
        Ok(self.buf.get_u16_le())
    }

    fn i32(&mut self) -> Result<i32> {
        self.ensure(4)?;
        Ok(self.buf.get_i32_le())
    }

    fn u64(&mut self) -> Result<u64> {
        self.ensure(8)?;
        Ok(self.buf.get_u64_le())
    }

    fn f32(&mut self) -> Result<f32> {
        self.ensure(4)?;
        Ok(self.buf.get_f32_le())
    }

    fn string(&mut self) -> Result<String> {
        let end = self
            .buf
            .iter()
            .position(|&b| b == 0)
            .ok_or(ProtocolError::UnterminatedString)?;
        let value = String::from_utf8_lossy(&self.buf[..end]).into_owned();
        self.buf.advance(end + 1);
        Ok(value)
    }
}
