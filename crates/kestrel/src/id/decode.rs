use crate::{Error, KestrelId, Result, time::epoch_millis};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Largest integer an IEEE-754 double represents exactly (2^53 - 1).
pub const MAX_SAFE_INTEGER: u64 = (1 << 53) - 1;

/// Conversion into a [`KestrelId`] from the representations IDs travel in.
///
/// Implemented for native integers, wide integers (`u128`/`i128`), decimal
/// strings, and `f64` values within the safe-integer range. All of them decode
/// to the same fields for the same numeric value.
pub trait IntoKestrelId {
    /// Converts `self`, rejecting negative values, values with the reserved bit
    /// set, and values that do not fit in 64 bits.
    fn into_kestrel_id(self) -> Result<KestrelId>;
}

impl IntoKestrelId for KestrelId {
    fn into_kestrel_id(self) -> Result<KestrelId> {
        Ok(self)
    }
}

impl IntoKestrelId for u64 {
    fn into_kestrel_id(self) -> Result<KestrelId> {
        KestrelId::from_raw(self)
            .ok_or_else(|| Error::InvalidId(format!("{self} has the reserved bit set")))
    }
}

impl IntoKestrelId for i64 {
    fn into_kestrel_id(self) -> Result<KestrelId> {
        u64::try_from(self)
            .map_err(|_| Error::InvalidId(format!("{self} is negative")))?
            .into_kestrel_id()
    }
}

impl IntoKestrelId for u128 {
    fn into_kestrel_id(self) -> Result<KestrelId> {
        u64::try_from(self)
            .map_err(|_| Error::InvalidId(format!("{self} does not fit in 64 bits")))?
            .into_kestrel_id()
    }
}

impl IntoKestrelId for i128 {
    fn into_kestrel_id(self) -> Result<KestrelId> {
        u128::try_from(self)
            .map_err(|_| Error::InvalidId(format!("{self} is negative")))?
            .into_kestrel_id()
    }
}

impl IntoKestrelId for f64 {
    fn into_kestrel_id(self) -> Result<KestrelId> {
        if !self.is_finite() || self.fract() != 0.0 || self < 0.0 {
            return Err(Error::InvalidId(format!(
                "{self} is not a non-negative integer"
            )));
        }
        if self > MAX_SAFE_INTEGER as f64 {
            return Err(Error::InvalidId(format!(
                "{self} exceeds the safe integer range, pass it as a string"
            )));
        }
        (self as u64).into_kestrel_id()
    }
}

impl IntoKestrelId for &str {
    fn into_kestrel_id(self) -> Result<KestrelId> {
        self.parse()
    }
}

impl IntoKestrelId for &String {
    fn into_kestrel_id(self) -> Result<KestrelId> {
        self.as_str().parse()
    }
}

impl IntoKestrelId for String {
    fn into_kestrel_id(self) -> Result<KestrelId> {
        self.as_str().parse()
    }
}

/// The fields of a decoded [`KestrelId`].
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DecodedId {
    /// The ID itself.
    pub id: KestrelId,
    /// Milliseconds since the Kestrel epoch.
    pub timestamp: u64,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    /// Logical shard that issued the ID.
    pub shard_id: u16,
    /// Sequence within the millisecond and shard.
    pub sequence: u16,
    /// Wall-clock instant the ID was issued.
    pub created_at: SystemTime,
}

impl From<KestrelId> for DecodedId {
    fn from(id: KestrelId) -> Self {
        let timestamp = id.timestamp();
        let timestamp_ms = timestamp + epoch_millis();
        Self {
            id,
            timestamp,
            timestamp_ms,
            // Both fields are masked to 10 and 12 bits.
            shard_id: id.shard_id() as u16,
            sequence: id.sequence() as u16,
            created_at: UNIX_EPOCH + Duration::from_millis(timestamp_ms),
        }
    }
}

/// Decodes a single ID.
///
/// This is a pure function; it needs no connection and can be called from any
/// thread.
///
/// # Example
///
/// ```
/// let decoded = kestrel::decode("4194304172155").unwrap();
/// assert_eq!(decoded.timestamp, 1_000_000);
/// assert_eq!(decoded.shard_id, 42);
/// assert_eq!(decoded.sequence, 123);
/// assert_eq!(decoded.timestamp_ms, 1_451_567_800_000);
/// ```
///
/// # Errors
///
/// Returns [`Error::InvalidId`] if the input is not a valid ID.
pub fn decode(id: impl IntoKestrelId) -> Result<DecodedId> {
    id.into_kestrel_id().map(DecodedId::from)
}

/// Decodes every ID in `ids`, failing on the first invalid one.
///
/// # Errors
///
/// Returns [`Error::InvalidId`] if any input is not a valid ID.
pub fn decode_many<I>(ids: I) -> Result<Vec<DecodedId>>
where
    I: IntoIterator,
    I::Item: IntoKestrelId,
{
    ids.into_iter().map(decode).collect()
}
