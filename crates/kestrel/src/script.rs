//! The atomic allocation routine.
//!
//! One call reserves a contiguous block of sequence numbers for the shard the
//! store node belongs to and reports the node's clock. The same algorithm is
//! shipped to Redis as Lua ([`ALLOCATION_SCRIPT`]) and implemented natively in
//! [`run_allocation`] for the in-process store.

use crate::{KestrelId, store::StoreError, time::epoch_millis};
use core::time::Duration;
use std::{borrow::Cow, sync::LazyLock};

/// Highest sequence value. Reaching it triggers a wraparound.
pub const MAX_SEQUENCE: i64 = 4095;

/// Largest batch a single allocation may request.
pub const MAX_BATCH: u16 = 4096;

/// Highest valid shard ID. Zero is reserved.
pub const MAX_SHARD_ID: i64 = 1023;

/// How long allocation stays locked after a wraparound.
pub const LOCK_TTL: Duration = Duration::from_millis(500);

/// Error code returned while the allocation lock is held.
pub const LOCKED_CODE: &str = "ALLOCATOR_LOCKED";

/// Error code returned when the stored shard ID is missing or invalid.
pub const SHARD_RANGE_CODE: &str = "SHARD_ID_OUT_OF_RANGE";

/// Lua source of the allocation routine.
///
/// `KEYS`: lock, sequence counter, shard ID.
/// `ARGV`: max sequence, batch size, max shard ID, lock TTL in milliseconds.
pub const ALLOCATION_SCRIPT: &str = r#"
local lock_key = KEYS[1]
local sequence_key = KEYS[2]
local shard_id_key = KEYS[3]

local max_sequence = tonumber(ARGV[1])
local batch = tonumber(ARGV[2])
local max_shard_id = tonumber(ARGV[3])
local lock_ttl = tonumber(ARGV[4])

if redis.call('EXISTS', lock_key) == 1 then
  return redis.error_reply('ALLOCATOR_LOCKED sequence wraparound in progress')
end

local end_sequence = redis.call('INCRBY', sequence_key, batch)
local start_sequence = end_sequence - batch + 1

local shard_id = tonumber(redis.call('GET', shard_id_key)) or -1
if shard_id < 1 or shard_id > max_shard_id then
  return redis.error_reply('SHARD_ID_OUT_OF_RANGE shard id must be within [1, ' .. max_shard_id .. ']')
end

if end_sequence >= max_sequence then
  redis.call('SET', sequence_key, '-1')
  redis.call('PSETEX', lock_key, lock_ttl, 'lock')
  end_sequence = max_sequence
end

-- TIME must be the last call so the write set never depends on it.
local time = redis.call('TIME')

return {
  start_sequence,
  end_sequence,
  shard_id,
  tonumber(time[1]),
  tonumber(time[2])
}
"#;

/// A script and the SHA-1 hash nodes cache it under.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Script {
    source: Cow<'static, str>,
    sha: String,
}

impl Script {
    pub fn new(source: impl Into<Cow<'static, str>>) -> Self {
        let source = source.into();
        let sha = sha1_smol::Sha1::from(source.as_bytes()).digest().to_string();
        Self { source, sha }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Lowercase hex SHA-1 of the source, as `SCRIPT LOAD` reports it.
    pub fn sha(&self) -> &str {
        &self.sha
    }
}

static ALLOCATION: LazyLock<Script> = LazyLock::new(|| Script::new(ALLOCATION_SCRIPT));

/// The allocation script, hashed once per process.
pub fn allocation_script() -> &'static Script {
    &ALLOCATION
}

/// Store keys the allocation routine touches.
///
/// All three share a hash tag so a cluster places them in one slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeySet {
    pub lock: String,
    pub sequence: String,
    pub shard_id: String,
}

impl KeySet {
    pub fn with_tag(tag: &str) -> Self {
        Self {
            lock: format!("{{{tag}}}:generator-lock"),
            sequence: format!("{{{tag}}}:generator-sequence"),
            shard_id: format!("{{{tag}}}:logical-shard-id"),
        }
    }

    /// Keys in the order the script expects them.
    pub fn to_vec(&self) -> Vec<String> {
        vec![self.lock.clone(), self.sequence.clone(), self.shard_id.clone()]
    }
}

impl Default for KeySet {
    fn default() -> Self {
        Self::with_tag("kestrel")
    }
}

/// Script arguments for a batch of `batch` IDs.
pub fn allocation_args(batch: u16) -> [i64; 4] {
    [
        MAX_SEQUENCE,
        i64::from(batch),
        MAX_SHARD_ID,
        LOCK_TTL.as_millis() as i64,
    ]
}

/// The operations the allocation routine performs on a node's key space.
pub trait Keyspace {
    fn exists(&mut self, key: &str) -> Result<bool, StoreError>;
    fn incr_by(&mut self, key: &str, by: i64) -> Result<i64, StoreError>;
    fn get_int(&mut self, key: &str) -> Result<Option<i64>, StoreError>;
    fn set_int(&mut self, key: &str, value: i64, ttl: Option<Duration>)
    -> Result<(), StoreError>;
    /// Seconds and microseconds since the Unix epoch.
    fn time(&mut self) -> Result<(i64, i64), StoreError>;
}

/// Runs the allocation routine against `ks`.
///
/// The caller must hold whatever lock makes this atomic with respect to other
/// callers on the same key space.
pub fn run_allocation<K: Keyspace + ?Sized>(
    ks: &mut K,
    keys: &KeySet,
    args: &[i64],
) -> Result<Vec<i64>, StoreError> {
    let &[max_sequence, batch, max_shard_id, lock_ttl] = args else {
        return Err(StoreError::Response(format!(
            "ERR allocation expects 4 arguments, got {}",
            args.len()
        )));
    };

    if ks.exists(&keys.lock)? {
        return Err(StoreError::AllocatorLocked);
    }

    let mut end = ks.incr_by(&keys.sequence, batch)?;
    let start = end - batch + 1;

    let shard_id = ks.get_int(&keys.shard_id)?.unwrap_or(-1);
    if shard_id < 1 || shard_id > max_shard_id {
        return Err(StoreError::ShardIdOutOfRange);
    }

    if end >= max_sequence {
        ks.set_int(&keys.sequence, -1, None)?;
        let ttl = Duration::from_millis(u64::try_from(lock_ttl).unwrap_or_default());
        ks.set_int(&keys.lock, 1, Some(ttl))?;
        end = max_sequence;
    }

    let (seconds, micros) = ks.time()?;
    Ok(vec![start, end, shard_id, seconds, micros])
}

/// A block of sequence numbers reserved by one allocation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Allocation {
    pub start: i64,
    pub end: i64,
    pub shard_id: i64,
    pub seconds: i64,
    pub micros: i64,
}

impl Allocation {
    /// Store time in milliseconds since the Unix epoch.
    pub const fn timestamp_millis(&self) -> i64 {
        self.seconds * 1000 + self.micros / 1000
    }

    /// Store time in milliseconds since the Kestrel epoch.
    pub fn kestrel_timestamp(&self) -> u64 {
        u64::try_from(self.timestamp_millis())
            .unwrap_or_default()
            .saturating_sub(epoch_millis())
    }

    /// The reserved sequence numbers. Empty if the counter had already passed
    /// the ceiling.
    pub fn sequences(&self) -> core::ops::RangeInclusive<i64> {
        self.start.max(0)..=self.end
    }

    pub fn len(&self) -> usize {
        self.sequences().count()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences().is_empty()
    }

    /// Encodes one ID per reserved sequence, in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = KestrelId> + '_ {
        let timestamp = self.kestrel_timestamp();
        let shard_id = self.shard_id as u64;
        self.sequences()
            .map(move |sequence| KestrelId::from(timestamp, shard_id, sequence as u64))
    }
}

impl TryFrom<Vec<i64>> for Allocation {
    type Error = StoreError;

    fn try_from(reply: Vec<i64>) -> Result<Self, Self::Error> {
        let [start, end, shard_id, seconds, micros] = reply[..] else {
            return Err(StoreError::Response(format!(
                "allocation reply has {} elements, expected 5",
                reply.len()
            )));
        };
        Ok(Self {
            start,
            end,
            shard_id,
            seconds,
            micros,
        })
    }
}
