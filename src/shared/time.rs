//! Usage: Wall-clock helpers shared by the registry, store and remote clients.

use chrono::{DateTime, Duration, Utc};

pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

/// Returns `now`, nudged forward so it is strictly later than `previous`.
pub fn strictly_after(previous: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
    match previous {
        Some(prev) if now <= prev => prev + Duration::milliseconds(1),
        _ => now,
    }
}

/// Token expiry derived from an `expiresIn` seconds field; non-positive or out-of-range values mean unknown.
pub fn expiry_from_expires_in(expires_in: i64, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if expires_in <= 0 {
        return None;
    }
    Duration::try_seconds(expires_in).and_then(|d| now.checked_add_signed(d))
}
