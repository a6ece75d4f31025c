use core::time::Duration;

/// Kestrel epoch: Thursday, December 31, 2015 13:00:00 UTC
///
/// Every identifier stores milliseconds elapsed since this instant, which
/// gives the 41-bit timestamp field roughly 69 years of range.
pub const KESTREL_EPOCH: Duration = Duration::from_millis(1_451_566_800_000);

/// Returns [`KESTREL_EPOCH`] as whole milliseconds since the Unix epoch.
pub const fn epoch_millis() -> u64 {
    KESTREL_EPOCH.as_millis() as u64
}
