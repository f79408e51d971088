use std::fmt;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

pub const MIN_ROOM_ID_LEN: usize = 4;
pub const MAX_ROOM_ID_LEN: usize = 6;

/// Alphabet for generated ids. 0, O, I and 1 are left out so an id read
/// aloud or off a phone screen cannot be mistyped.
pub const GENERATED_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Three-letter words without ambiguous glyphs, paired for memorable ids.
const WORDS: &[&str] = &[
    "BAY", "BEE", "CAT", "CUP", "DEW", "ELK", "EMU", "FAN", "FLY", "GEM", "GUM", "HAT", "HUM",
    "JAM", "JET", "KEG", "KEY", "LAP", "MAP", "NET", "PEN", "RAY", "RED", "SEA", "SKY", "SUN",
    "TEA", "VAN", "WAX", "YAK", "ZAP", "ZEN",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomIdError {
    #[error("room id is empty")]
    Empty,
    #[error("room id must be {MIN_ROOM_ID_LEN}-{MAX_ROOM_ID_LEN} chars, got {found}")]
    InvalidLength { found: usize },
    #[error("invalid character '{ch}' at position {index}")]
    InvalidCharacter { ch: char, index: usize },
}

/// Canonical (uppercase) room identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomId(String);

impl RoomId {
    /// Trims and uppercases `value`, then validates it against `[A-Z0-9]{4,6}`.
    pub fn parse(value: &str) -> Result<Self, RoomIdError> {
        let canonical = value.trim().to_ascii_uppercase();
        if canonical.is_empty() {
            return Err(RoomIdError::Empty);
        }
        for (index, ch) in canonical.chars().enumerate() {
            if !ch.is_ascii_uppercase() && !ch.is_ascii_digit() {
                return Err(RoomIdError::InvalidCharacter { ch, index });
            }
        }
        let found = canonical.len();
        if !(MIN_ROOM_ID_LEN..=MAX_ROOM_ID_LEN).contains(&found) {
            return Err(RoomIdError::InvalidLength { found });
        }
        Ok(Self(canonical))
    }

    pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let len = rng.gen_range(MIN_ROOM_ID_LEN..=MAX_ROOM_ID_LEN);
        let id = (0..len)
            .map(|_| char::from(GENERATED_ALPHABET[rng.gen_range(0..GENERATED_ALPHABET.len())]))
            .collect();
        Self(id)
    }

    pub fn generate_word_pair<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let first = WORDS.choose(rng).copied().unwrap_or("SUN");
        let second = WORDS.choose(rng).copied().unwrap_or("SKY");
        Self(format!("{first}{second}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for RoomId {
    type Err = RoomIdError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

impl Serialize for RoomId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for RoomId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        RoomId::parse(&raw).map_err(serde::de::Error::custom)
    }
}
