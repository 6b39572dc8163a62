use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch. All stored timestamps use this unit.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
