use super::*;
use crate::chunk::ChunkKind;

#[test]
fn registry_event_kind_tags() {
    let event = RegistryEvent::Cancelled { id: SessionId::new("abc123abc123") };
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["kind"], "cancelled");
    assert_eq!(json["id"], "abc123abc123");
}

#[test]
fn updated_patch_is_flattened() {
    let event = RegistryEvent::Updated {
        id: SessionId::new("abc123abc123"),
        patch: SessionPatch::status(SessionStatus::Running),
    };
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["kind"], "updated");
    assert_eq!(json["status"], "running");
    assert!(json.get("error").is_none());

    let parsed: RegistryEvent = serde_json::from_value(json).unwrap();
    assert_eq!(parsed, event);
}

#[test]
fn unknown_registry_kind_is_custom() {
    let parsed: RegistryEvent =
        serde_json::from_str(r#"{"kind":"something_new","extra":1}"#).unwrap();
    assert_eq!(parsed, RegistryEvent::Custom);
    assert_eq!(parsed.session_id(), None);
}

#[test]
fn session_event_round_trip() {
    let event = SessionEvent::Output { chunk: OutputChunk::new(ChunkKind::Text, "hi", 9) };
    let json = serde_json::to_string(&event).unwrap();
    assert!(json.contains("\"kind\":\"output\""));
    let parsed: SessionEvent = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, event);
}

#[test]
fn daemon_started_carries_pid_and_nonce() {
    let event = SessionEvent::DaemonStarted { pid: 1234, nonce: "deadbeef".into() };
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["kind"], "daemon_started");
    assert_eq!(json["pid"], 1234);
    assert_eq!(json["nonce"], "deadbeef");
}

#[test]
fn unknown_session_kind_is_custom() {
    let parsed: SessionEvent = serde_json::from_str(r#"{"kind":"later_addition"}"#).unwrap();
    assert_eq!(parsed, SessionEvent::Custom);
}
