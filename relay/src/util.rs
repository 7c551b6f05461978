//! Small shared helpers with no better home

use std::convert::TryFrom;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn millisecond_ts() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| {
            u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
        })
        .unwrap_or(0)
}
