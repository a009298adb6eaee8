use quadracode::envelope::{mailbox_key, Envelope, MAILBOX_PREFIX};
use serde_json::{json, Map};
use std::collections::HashMap;

fn envelope(sender: &str, recipient: &str, message: &str, payload: serde_json::Value) -> Envelope {
    let mut envelope = Envelope::new(sender, recipient, message, Map::new());
    envelope.payload = payload.as_object().cloned().unwrap_or_default();
    envelope
}

#[test]
fn round_trip_over_representative_envelopes() {
    let samples = vec![
        envelope("human", "orchestrator", "Hello", json!({})),
        envelope("orchestrator", "agent-1", "", json!({"chat_id": "t1"})),
        envelope(
            "agent-1",
            "orchestrator",
            "done",
            json!({
                "thread_id": "t1",
                "reply_to": ["orchestrator", "agent-2"],
                "autonomous": {
                    "deliver_to_human": true,
                    "escalate": false,
                    "recovery_attempts": ["retry"],
                },
                "messages": [{"role": "ai", "content": "done"}],
            }),
        ),
        envelope("human", "orchestrator", "héllo wörld 🚀", json!({"note": "ünïcode"})),
    ];

    for sample in samples {
        let fields = sample.to_fields();
        let decoded = Envelope::from_fields(&fields).unwrap();
        assert_eq!(decoded, sample);
    }
}

#[test]
fn all_five_canonical_fields_are_always_present() {
    let envelope = envelope("human", "orchestrator", "", json!({}));
    let fields = envelope.to_fields();
    for key in &["sender", "recipient", "message", "timestamp", "payload"] {
        assert!(fields.contains_key(*key), "missing field {}", key);
    }
    assert_eq!(fields["message"], "");
    assert_eq!(fields["payload"], "{}");
}

#[test]
fn absent_optional_fields_decode_to_defaults() {
    let mut fields = HashMap::new();
    fields.insert("sender".to_string(), "human".to_string());
    fields.insert("recipient".to_string(), "orchestrator".to_string());

    let decoded = Envelope::from_fields(&fields).unwrap();
    assert_eq!(decoded.message, "");
    assert_eq!(decoded.timestamp, "");
    assert!(decoded.payload.is_empty());
    assert!(decoded.extra.is_empty());
}

#[test]
fn timestamps_are_whole_second_utc() {
    let envelope = envelope("human", "orchestrator", "hi", json!({}));
    // e.g. 2026-08-01T12:34:56Z, no fractional seconds, Z suffix.
    assert!(envelope.timestamp.ends_with('Z'));
    assert!(!envelope.timestamp.contains('.'));
    assert_eq!(envelope.timestamp.len(), "2026-08-01T12:34:56Z".len());
}

#[test]
fn mailbox_keys_use_the_deployment_prefix() {
    assert!(mailbox_key("human").starts_with(MAILBOX_PREFIX));
    assert_eq!(mailbox_key("human"), "qc:mailbox/human");
    assert_eq!(mailbox_key("agent-7"), "qc:mailbox/agent-7");
}
