use crate::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Width of a log sequence number in bytes.
pub const LSN_LEN: usize = 10;

/// Position in the source's change log.
///
/// Ordering is byte-wise lexicographic, which matches the source's commit
/// order. [`Lsn::ZERO`] means "no checkpoint yet".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn([u8; LSN_LEN]);

impl Lsn {
    pub const ZERO: Lsn = Lsn([0; LSN_LEN]);

    pub const fn new(bytes: [u8; LSN_LEN]) -> Self {
        Lsn(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let array: [u8; LSN_LEN] = bytes.try_into().map_err(|_| {
            Error::InvalidLsn(format!(
                "expected {} bytes, got {}",
                LSN_LEN,
                bytes.len()
            ))
        })?;
        Ok(Lsn(array))
    }

    /// Builds an LSN whose trailing eight bytes hold `value` big-endian.
    pub fn from_u64(value: u64) -> Self {
        let mut bytes = [0u8; LSN_LEN];
        bytes[LSN_LEN - 8..].copy_from_slice(&value.to_be_bytes());
        Lsn(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        *self == Lsn::ZERO
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl FromStr for Lsn {
    type Err = Error;

    /// Parses lower- or upper-case hex with an optional `0x` prefix.
    /// An empty string is the zero LSN.
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        if digits.is_empty() {
            return Ok(Lsn::ZERO);
        }
        let bytes = hex::decode(digits).map_err(|e| Error::InvalidLsn(format!("{}: {}", s, e)))?;
        Lsn::from_slice(&bytes)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Lsn({})", self.to_hex())
    }
}

impl Serialize for Lsn {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Lsn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
