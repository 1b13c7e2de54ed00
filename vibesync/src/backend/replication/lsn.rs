//! PostgreSQL log sequence numbers.

use std::fmt::Display;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use super::Error;

/// A position in the write-ahead log. Two unsigned 32-bit
/// halves, written `high/low` in hex.
///
/// Ordering is numeric, never textual: `"a/0" > "9/ffffffff"`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(u64);

impl Lsn {
    /// Start of the WAL, `0/0`. First-ever clients connect with this.
    pub const ZERO: Lsn = Lsn(0);

    pub fn new(high: u32, low: u32) -> Self {
        Self(((high as u64) << 32) | low as u64)
    }

    /// Get LSN from the 64-bit representation.
    pub fn from_u64(lsn: u64) -> Self {
        Self(lsn)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn high(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn low(&self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn is_after(&self, other: Lsn) -> bool {
        self > &other
    }

    pub fn is_before(&self, other: Lsn) -> bool {
        self < &other
    }

    /// Next position. Used to resume a stream strictly after
    /// a confirmed point.
    pub fn next(&self) -> Lsn {
        Lsn(self.0.saturating_add(1))
    }

    /// Rewind by a byte offset, stopping at zero.
    pub fn saturating_sub(&self, bytes: u64) -> Lsn {
        Lsn(self.0.saturating_sub(bytes))
    }
}

impl FromStr for Lsn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('/');

        let high = parts.next().ok_or_else(|| Error::MalformedLsn(s.into()))?;
        let low = parts.next().ok_or_else(|| Error::MalformedLsn(s.into()))?;

        if parts.next().is_some() || high.is_empty() || low.is_empty() {
            return Err(Error::MalformedLsn(s.into()));
        }

        let high = u32::from_str_radix(high, 16).map_err(|_| Error::MalformedLsn(s.into()))?;
        let low = u32::from_str_radix(low, 16).map_err(|_| Error::MalformedLsn(s.into()))?;

        Ok(Self::new(high, low))
    }
}

impl Display for Lsn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:x}/{:x}", self.high(), self.low())
    }
}

impl Serialize for Lsn {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Lsn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Lsn::from_str(&s).map_err(de::Error::custom)
    }
}
