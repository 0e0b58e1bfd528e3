use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Engine build number, e.g. `1.38.7.9` is build `13879`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GameVersion(pub u32);

impl GameVersion {
    pub fn build(&self) -> u32 {
        self.0
    }

    pub fn is_behind(&self, target: GameVersion) -> bool {
        *self < target
    }
}

impl From<u32> for GameVersion {
    fn from(build: u32) -> Self {
        Self(build)
    }
}

impl FromStr for GameVersion {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: String = s.trim().chars().filter(|c| *c != '.').collect();
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(ProtocolError::InvalidVersion(s.to_string()));
        }
        digits
            .parse()
            .map(GameVersion)
            .map_err(|_| ProtocolError::InvalidVersion(s.to_string()))
    }
}

impl fmt::Display for GameVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
