use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the unix epoch, or 0 if the clock is before it.
pub fn create_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|since_the_epoch| since_the_epoch.as_millis() as u64)
        .unwrap_or(0)
}
