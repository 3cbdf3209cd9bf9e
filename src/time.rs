//! Shared timestamp and id helpers used across engines.

use ulid::Ulid;

/// Current wall-clock time as milliseconds since the Unix epoch.
///
/// Document and KV timestamps are stored and returned in milliseconds
/// throughout the storage core (`spec.md` §4.9 "timestamps in
/// milliseconds").
pub fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Mints a fresh, lexically-sortable unique identifier.
///
/// Used for document ids when the caller does not supply one, and for
/// session/OAuth-state tokens before hashing.
pub fn new_id() -> String {
    Ulid::new().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_millis_is_plausible() {
        let now = now_millis();
        // 2024-01-01T00:00:00Z in milliseconds, as a sanity floor.
        assert!(now > 1_704_067_200_000);
    }

    #[test]
    fn new_id_is_unique_and_sortable_length() {
        let a = new_id();
        let b = new_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 26);
        assert!(Ulid::from_string(&a).is_ok());
    }
}
