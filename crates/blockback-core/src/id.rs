//! Collision-resistant short identifiers.
//!
//! Node names, job ids, and image names share one process-wide namespace per
//! monitor session; ids are drawn from uuid v4 so independent backup chains
//! never collide.

use uuid::Uuid;

/// Generates a 12-hex-character random id.
#[must_use]
pub fn random_id() -> String {
    Uuid::new_v4().to_string().replace('-', "")[..12].to_string()
}

/// Generates a random id with a readable prefix, e.g. `target-3f2a81b4c09d`.
#[must_use]
pub fn prefixed_id(prefix: &str) -> String {
    format!("{prefix}-{}", random_id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_random_id_shape() {
        let id = random_id();
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_random_ids_do_not_collide() {
        let ids: HashSet<String> = (0..1000).map(|_| random_id()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_prefixed_id() {
        let id = prefixed_id("target");
        assert!(id.starts_with("target-"));
        assert_eq!(id.len(), "target-".len() + 12);
    }
}
