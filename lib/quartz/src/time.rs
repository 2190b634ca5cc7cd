use lazy_static::lazy_static;
use std::time::{Instant, SystemTime};

pub const NANOS_PER_SEC: u64 = 1_000_000_000;
pub const NANOS_PER_MSEC: u64 = 1_000_000;

lazy_static! {
    static ref EPOCH: Instant = Instant::now();
}

/// Returns the number of nanoseconds elapsed on the monotonic clock since the first call
/// made in this process. All engine timestamps are expressed on this scale.
#[inline]
pub fn monotonic() -> u64 {
    EPOCH.elapsed().as_nanos() as u64
}

/// Pins the monotonic epoch. Called once at startup so that worker threads agree on the scale.
#[inline]
pub fn init() {
    lazy_static::initialize(&EPOCH);
}

/// The current unix timestamp in whole seconds.
#[inline]
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("System clock predates the unix epoch")
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_advances() {
        let a = monotonic();
        let b = monotonic();
        assert!(b >= a);
    }

    #[test]
    fn test_timestamp_sane() {
        // 2020-01-01 in unix seconds
        assert!(timestamp_secs() > 1_577_836_800);
    }
}
