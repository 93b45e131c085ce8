//! Storage key layout for upload sessions.

/// Everything that belongs to an in-flight session lives under this prefix.
pub fn session_prefix(session_id: &str) -> String {
    format!("uploads/{}/", session_id)
}

/// Zero-padded so lexical listing order matches chunk order.
pub fn chunk_key(session_id: &str, chunk_index: u32) -> String {
    format!("uploads/{}/chunks/{:010}", session_id, chunk_index)
}

/// Staging object written by one assembly attempt, before verification.
pub fn assembly_key(session_id: &str, assembly_id: &str) -> String {
    format!("uploads/{}/assembly-{}.partial", session_id, assembly_id)
}

/// Prefix holding published objects of a session.
pub fn final_prefix(session_id: &str) -> String {
    format!("objects/{}/", session_id)
}

/// Where the verified object is published.
pub fn final_key(session_id: &str, file_name: &str) -> String {
    format!("objects/{}/{}", session_id, file_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_keys_sort_in_index_order() {
        let mut keys = vec![chunk_key("s", 10), chunk_key("s", 2), chunk_key("s", 0)];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                "uploads/s/chunks/0000000000",
                "uploads/s/chunks/0000000002",
                "uploads/s/chunks/0000000010",
            ]
        );
    }

    #[test]
    fn test_session_scoped_keys_share_prefix() {
        let prefix = session_prefix("abc");
        assert!(chunk_key("abc", 7).starts_with(&prefix));
        assert!(assembly_key("abc", "a1").starts_with(&prefix));
        assert!(!final_key("abc", "movie.mkv").starts_with(&prefix));
        assert!(final_key("abc", "movie.mkv").starts_with(&final_prefix("abc")));
    }
}
