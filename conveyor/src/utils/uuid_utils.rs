//! Run identifier helpers.

use uuid::Uuid;

/// Generates a new run id (UUID v7, time-ordered).
#[must_use]
pub fn generate_run_id() -> Uuid {
    Uuid::now_v7()
}

/// Returns the trailing eight hex digits of an id, for resource names.
///
/// UUID v7 ids start with a timestamp, so the tail carries the randomness.
#[must_use]
pub fn short_id(id: &Uuid) -> String {
    let simple = id.simple().to_string();
    simple[simple.len() - 8..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_run_id_is_v7() {
        let id = generate_run_id();
        assert_eq!(id.get_version_num(), 7);
    }

    #[test]
    fn test_short_id() {
        let id = Uuid::parse_str("0190a1b2-c3d4-7e5f-8a9b-0c1d2e3f4a5b").unwrap();
        assert_eq!(short_id(&id), "2e3f4a5b");
    }
}
