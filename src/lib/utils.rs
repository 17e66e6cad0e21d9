use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall clock as unix seconds.
///
/// Job ids embed their creation timestamp in the high 32 bits of the same
/// clock, so expiry math can compare the two directly.
pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
