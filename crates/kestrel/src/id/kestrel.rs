use crate::{Error, Result};
use core::{fmt, str::FromStr};

/// A 64-bit Kestrel ID
///
/// - 1 bit reserved (always zero, so the value fits a signed 64-bit column)
/// - 41 bits timestamp (ms since [`KESTREL_EPOCH`])
/// - 10 bits logical shard ID
/// - 12 bits sequence
///
/// ```text
///  Bit Index:  63           63 62            22 21            12 11             0
///              +--------------+----------------+----------------+---------------+
///  Field:      | reserved (1) | timestamp (41) | shard ID (10)  | sequence (12) |
///              +--------------+----------------+----------------+---------------+
///              |<----------- MSB ---------- 64 bits ----------- LSB ----------->|
/// ```
///
/// IDs issued by one shard sort by creation time, then by sequence.
///
/// [`KESTREL_EPOCH`]: crate::KESTREL_EPOCH
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KestrelId {
    id: u64,
}

impl KestrelId {
    /// Bitmask for extracting the 41-bit timestamp field. Occupies bits 22
    /// through 62.
    pub const TIMESTAMP_MASK: u64 = (1 << 41) - 1;

    /// Bitmask for extracting the 10-bit shard ID field. Occupies bits 12
    /// through 21.
    pub const SHARD_ID_MASK: u64 = (1 << 10) - 1;

    /// Bitmask for extracting the 12-bit sequence field. Occupies bits 0
    /// through 11.
    pub const SEQUENCE_MASK: u64 = (1 << 12) - 1;

    /// Number of bits to shift the timestamp to its correct position (bit 22).
    pub const TIMESTAMP_SHIFT: u64 = 22;

    /// Number of bits to shift the shard ID to its correct position (bit 12).
    pub const SHARD_ID_SHIFT: u64 = 12;

    /// Number of bits to shift the sequence field (bit 0).
    pub const SEQUENCE_SHIFT: u64 = 0;

    /// The reserved most significant bit. Never set on a valid ID.
    pub const RESERVED_BIT: u64 = 1 << 63;

    /// Packs the three fields into an ID.
    ///
    /// Values wider than their field are masked, not rejected. The store
    /// already guarantees the shard ID and sequence ranges.
    pub const fn from(timestamp: u64, shard_id: u64, sequence: u64) -> Self {
        let timestamp = (timestamp & Self::TIMESTAMP_MASK) << Self::TIMESTAMP_SHIFT;
        let shard_id = (shard_id & Self::SHARD_ID_MASK) << Self::SHARD_ID_SHIFT;
        let sequence = (sequence & Self::SEQUENCE_MASK) << Self::SEQUENCE_SHIFT;
        Self {
            id: timestamp | shard_id | sequence,
        }
    }

    /// Wraps a raw value, rejecting values with the reserved bit set.
    pub const fn from_raw(raw: u64) -> Option<Self> {
        if raw & Self::RESERVED_BIT == 0 {
            Some(Self { id: raw })
        } else {
            None
        }
    }

    /// Extracts the timestamp (ms since the Kestrel epoch) from the packed ID.
    pub const fn timestamp(&self) -> u64 {
        (self.id >> Self::TIMESTAMP_SHIFT) & Self::TIMESTAMP_MASK
    }

    /// Extracts the logical shard ID from the packed ID.
    pub const fn shard_id(&self) -> u64 {
        (self.id >> Self::SHARD_ID_SHIFT) & Self::SHARD_ID_MASK
    }

    /// Extracts the sequence number from the packed ID.
    pub const fn sequence(&self) -> u64 {
        (self.id >> Self::SEQUENCE_SHIFT) & Self::SEQUENCE_MASK
    }

    /// Returns the maximum representable timestamp.
    pub const fn max_timestamp() -> u64 {
        Self::TIMESTAMP_MASK
    }

    /// Returns the maximum representable shard ID.
    pub const fn max_shard_id() -> u64 {
        Self::SHARD_ID_MASK
    }

    /// Returns the maximum representable sequence.
    pub const fn max_sequence() -> u64 {
        Self::SEQUENCE_MASK
    }

    /// Returns the raw unsigned value.
    pub const fn to_raw(&self) -> u64 {
        self.id
    }

    /// Returns the ID as the signed 64-bit integer most databases store.
    pub const fn to_i64(&self) -> i64 {
        // The reserved bit is always clear, so this never wraps.
        self.id as i64
    }

    /// Returns the ID as a zero-padded 19-digit string, which sorts
    /// lexicographically in the same order as the numeric value.
    pub fn to_padded_string(&self) -> String {
        format!("{:019}", self.id)
    }
}

impl fmt::Display for KestrelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl fmt::Debug for KestrelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KestrelId")
            .field("id", &self.id)
            .field("timestamp", &self.timestamp())
            .field("shard_id", &self.shard_id())
            .field("sequence", &self.sequence())
            .finish()
    }
}

impl FromStr for KestrelId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::InvalidId(format!("{s:?} is not a decimal integer")));
        }
        let raw: u64 = trimmed
            .parse()
            .map_err(|_| Error::InvalidId(format!("{s:?} does not fit in 64 bits")))?;
        Self::from_raw(raw)
            .ok_or_else(|| Error::InvalidId(format!("{s:?} has the reserved bit set")))
    }
}

impl From<KestrelId> for i64 {
    fn from(id: KestrelId) -> Self {
        id.to_i64()
    }
}

impl From<KestrelId> for u64 {
    fn from(id: KestrelId) -> Self {
        id.to_raw()
    }
}
