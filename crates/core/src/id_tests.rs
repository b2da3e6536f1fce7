use super::*;
use std::collections::HashSet;

#[test]
fn generate_is_12_hex_chars() {
    let id = SessionId::generate();
    assert_eq!(id.as_str().len(), SESSION_ID_LEN);
    assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
}

#[test]
fn generate_is_unique() {
    let ids: HashSet<String> =
        (0..1000).map(|_| SessionId::generate().0).collect();
    assert_eq!(ids.len(), 1000);
}

#[test]
fn session_id_display_and_str() {
    let id = SessionId::new("abc123def456");
    assert_eq!(id.to_string(), "abc123def456");
    assert_eq!(id.as_str(), "abc123def456");
    assert_eq!(id, "abc123def456");
}

#[test]
fn session_id_serde_is_transparent() {
    let id = SessionId::new("cafe00cafe00");
    let json = serde_json::to_string(&id).unwrap();
    assert_eq!(json, "\"cafe00cafe00\"");
    let parsed: SessionId = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, id);
}

#[test]
fn short_truncates() {
    assert_eq!(short("abcdef", 3), "abc");
    assert_eq!(short("ab", 3), "ab");
}
