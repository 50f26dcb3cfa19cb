//! Network-wide time used for record expiration.

use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the UNIX epoch, as a float.
///
/// Expiration times travel between peers, so they are expressed in wall
/// clock time rather than a process local monotonic clock.
pub type DhtTime = f64;

/// Current [DhtTime] according to this machine's clock.
pub fn get_dht_time() -> DhtTime {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs_f64())
        .unwrap_or(0.0)
}
