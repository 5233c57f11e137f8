//! UUID v7 utilities for time-ordered identifiers.
//!
//! Jobs, workers and dead letters all use UUIDv7 so primary keys sort by
//! creation time and the embedded timestamp can be recovered for display.

use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

/// Generate a new UUIDv7 identifier.
///
/// # Example
///
/// ```
/// use keel_core::uuid_utils::new_v7;
///
/// let a = new_v7();
/// let b = new_v7();
/// assert!(b > a);
/// ```
#[inline]
pub fn new_v7() -> Uuid {
    Uuid::now_v7()
}

/// Creation time embedded in a UUIDv7, or `None` for other versions.
pub fn created_at(id: &Uuid) -> Option<DateTime<Utc>> {
    if id.get_version_num() != 7 {
        return None;
    }
    let (secs, nanos) = id.get_timestamp()?.to_unix();
    Utc.timestamp_opt(secs as i64, nanos).single()
}
