//! Envelope and mailbox wire protocol.
//!
//! Every participant in a quadracode fleet communicates exclusively by
//! appending [`Envelope`]s to per-recipient mailbox streams. This module owns
//! the on-wire representation: the five canonical stream fields, the mailbox
//! key derivation, and the `<ms>-<seq>` entry identifiers assigned by the
//! log store.
//!
//! # Wire format
//!
//! An envelope is a flat `string -> string` map with five canonical keys that
//! are always present (empty strings permitted, never absent keys):
//!
//! | Field | Content |
//! |-------|---------|
//! | `sender` | identity of the producer (required, non-empty) |
//! | `recipient` | identity of the consumer (required, non-empty) |
//! | `message` | human-visible text, may be empty |
//! | `timestamp` | ISO-8601 UTC at whole-second resolution |
//! | `payload` | JSON-encoded object carrying structured context |
//!
//! Unknown fields round-trip untouched through [`Envelope::extra`] so that
//! collaborators can attach opaque metadata at the stream layer.
//!
//! # Example
//!
//! ```rust
//! use quadracode::envelope::{mailbox_key, Envelope};
//!
//! let envelope = Envelope::new("human", "orchestrator", "Hello", Default::default());
//! let fields = envelope.to_fields();
//! assert_eq!(fields["sender"], "human");
//! assert_eq!(Envelope::from_fields(&fields).unwrap(), envelope);
//! assert_eq!(mailbox_key("orchestrator"), "qc:mailbox/orchestrator");
//! ```

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::str::FromStr;

/// Identity the orchestrator ultimately reports back to.
pub const HUMAN_RECIPIENT: &str = "human";

/// Identity of the supervisor proxy that stands in for the human in
/// autonomous deployments.
pub const HUMAN_CLONE_RECIPIENT: &str = "human-clone";

/// Identity of the orchestrator runtime.
pub const ORCHESTRATOR_RECIPIENT: &str = "orchestrator";

/// Deployment-wide prefix for mailbox stream keys.
pub const MAILBOX_PREFIX: &str = "qc:mailbox/";

/// Derive the mailbox stream key for a recipient identity.
///
/// This is the sole derivation point for mailbox keys in the crate; store
/// implementations and the messaging client both route through it.
pub fn mailbox_key(recipient: &str) -> String {
    format!("{}{}", MAILBOX_PREFIX, recipient)
}

/// Errors produced while decoding wire data.
#[derive(Debug, Clone)]
pub enum EnvelopeError {
    /// Required fields missing/empty or `payload` not a JSON object.
    Malformed(String),
    /// An entry id that does not match the `<ms>-<seq>` shape.
    EntryId(String),
}

impl fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvelopeError::Malformed(msg) => write!(f, "malformed envelope: {}", msg),
            EnvelopeError::EntryId(raw) => write!(f, "invalid entry id: {}", raw),
        }
    }
}

impl Error for EnvelopeError {}

/// Server-assigned identifier of a mailbox entry.
///
/// Rendered as `<ms>-<seq>` (millisecond timestamp, dash, sequence). The
/// derived ordering compares `ms` then `seq` numerically, which matches the
/// append order guaranteed by the log store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId {
    /// Millisecond wall-clock component.
    pub ms: u64,
    /// Sequence number disambiguating entries within one millisecond.
    pub seq: u64,
}

impl EntryId {
    /// Build an entry id from its two numeric components.
    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = EnvelopeError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let mut parts = raw.splitn(2, '-');
        let ms = parts
            .next()
            .and_then(|p| p.parse::<u64>().ok())
            .ok_or_else(|| EnvelopeError::EntryId(raw.to_string()))?;
        let seq = parts
            .next()
            .and_then(|p| p.parse::<u64>().ok())
            .ok_or_else(|| EnvelopeError::EntryId(raw.to_string()))?;
        Ok(EntryId { ms, seq })
    }
}

/// The unit of work exchanged between runtimes.
///
/// Envelopes are immutable once published: a producer appends one to the
/// recipient's mailbox, the consumer processes it and deletes the entry.
/// The structured [`payload`](Envelope::payload) carries the conversation
/// identifiers, routing overrides, and any opaque collaborator metadata that
/// must survive the round trip.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Identity of the producer.
    pub sender: String,
    /// Identity of the intended consumer; also derives the mailbox key.
    pub recipient: String,
    /// Human-visible text; empty when the payload carries the entire state.
    pub message: String,
    /// ISO-8601 UTC timestamp at whole-second resolution.
    pub timestamp: String,
    /// Structured context (thread ids, reply paths, autonomous directives, ...).
    pub payload: Map<String, Value>,
    /// Unknown wire fields preserved verbatim for passthrough.
    pub extra: HashMap<String, String>,
}

const FIELD_SENDER: &str = "sender";
const FIELD_RECIPIENT: &str = "recipient";
const FIELD_MESSAGE: &str = "message";
const FIELD_TIMESTAMP: &str = "timestamp";
const FIELD_PAYLOAD: &str = "payload";

impl Envelope {
    /// Create an envelope stamped with the current UTC time.
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        message: impl Into<String>,
        payload: Map<String, Value>,
    ) -> Self {
        Self {
            sender: sender.into(),
            recipient: recipient.into(),
            message: message.into(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            payload,
            extra: HashMap::new(),
        }
    }

    /// Serialize into the flat stream-fields representation.
    ///
    /// All five canonical keys are always present; the payload is JSON-encoded
    /// into a single field (`{}` for an empty map). Passthrough fields are
    /// emitted as-is but can never shadow a canonical key.
    pub fn to_fields(&self) -> HashMap<String, String> {
        let mut fields: HashMap<String, String> = self
            .extra
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        fields.insert(FIELD_SENDER.to_string(), self.sender.clone());
        fields.insert(FIELD_RECIPIENT.to_string(), self.recipient.clone());
        fields.insert(FIELD_MESSAGE.to_string(), self.message.clone());
        fields.insert(FIELD_TIMESTAMP.to_string(), self.timestamp.clone());
        fields.insert(
            FIELD_PAYLOAD.to_string(),
            Value::Object(self.payload.clone()).to_string(),
        );
        fields
    }

    /// Decode from the flat stream-fields representation.
    ///
    /// Fails with [`EnvelopeError::Malformed`] when `sender` or `recipient` is
    /// missing/empty, or when a non-empty `payload` field is not a JSON
    /// object. Absent optional fields decode to their defaults (empty string,
    /// empty map); unknown fields land in [`Envelope::extra`].
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self, EnvelopeError> {
        let sender = fields.get(FIELD_SENDER).cloned().unwrap_or_default();
        if sender.is_empty() {
            return Err(EnvelopeError::Malformed("missing sender".to_string()));
        }
        let recipient = fields.get(FIELD_RECIPIENT).cloned().unwrap_or_default();
        if recipient.is_empty() {
            return Err(EnvelopeError::Malformed("missing recipient".to_string()));
        }

        let payload = match fields.get(FIELD_PAYLOAD) {
            None => Map::new(),
            Some(raw) if raw.is_empty() => Map::new(),
            Some(raw) => match serde_json::from_str::<Value>(raw) {
                Ok(Value::Object(map)) => map,
                Ok(other) => {
                    return Err(EnvelopeError::Malformed(format!(
                        "payload is not a JSON object: {}",
                        other
                    )))
                }
                Err(err) => {
                    return Err(EnvelopeError::Malformed(format!(
                        "payload is not valid JSON: {}",
                        err
                    )))
                }
            },
        };

        let extra = fields
            .iter()
            .filter(|(key, _)| {
                !matches!(
                    key.as_str(),
                    FIELD_SENDER | FIELD_RECIPIENT | FIELD_MESSAGE | FIELD_TIMESTAMP
                        | FIELD_PAYLOAD
                )
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(Self {
            sender,
            recipient,
            message: fields.get(FIELD_MESSAGE).cloned().unwrap_or_default(),
            timestamp: fields.get(FIELD_TIMESTAMP).cloned().unwrap_or_default(),
            payload,
            extra,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn entry_id_parses_and_orders_numerically() {
        let a: EntryId = "1700000000000-0".parse().unwrap();
        let b: EntryId = "1700000000000-2".parse().unwrap();
        let c: EntryId = "1700000000001-0".parse().unwrap();
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a.to_string(), "1700000000000-0");

        // Numeric, not lexicographic: "9" < "10" on the ms axis.
        let small: EntryId = "9-0".parse().unwrap();
        let big: EntryId = "10-0".parse().unwrap();
        assert!(small < big);
    }

    #[test]
    fn entry_id_rejects_garbage() {
        assert!("".parse::<EntryId>().is_err());
        assert!("abc".parse::<EntryId>().is_err());
        assert!("12".parse::<EntryId>().is_err());
        assert!("12-x".parse::<EntryId>().is_err());
    }

    #[test]
    fn mailbox_key_prefixes_recipient() {
        assert_eq!(mailbox_key("agent-1"), "qc:mailbox/agent-1");
    }

    #[test]
    fn from_fields_requires_sender_and_recipient() {
        let mut fields = HashMap::new();
        fields.insert("recipient".to_string(), "orchestrator".to_string());
        assert!(Envelope::from_fields(&fields).is_err());

        fields.insert("sender".to_string(), "human".to_string());
        assert!(Envelope::from_fields(&fields).is_ok());
    }

    #[test]
    fn from_fields_rejects_non_object_payload() {
        let mut fields = HashMap::new();
        fields.insert("sender".to_string(), "human".to_string());
        fields.insert("recipient".to_string(), "orchestrator".to_string());

        fields.insert("payload".to_string(), "not json".to_string());
        assert!(Envelope::from_fields(&fields).is_err());

        fields.insert("payload".to_string(), "[1, 2]".to_string());
        assert!(Envelope::from_fields(&fields).is_err());

        fields.insert("payload".to_string(), "{}".to_string());
        assert!(Envelope::from_fields(&fields).is_ok());
    }

    #[test]
    fn unknown_fields_pass_through() {
        let mut envelope = Envelope::new("human", "orchestrator", "hi", Map::new());
        envelope
            .extra
            .insert("trace_id".to_string(), "abc123".to_string());

        let fields = envelope.to_fields();
        assert_eq!(fields["trace_id"], "abc123");

        let decoded = Envelope::from_fields(&fields).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn payload_round_trips() {
        let payload = json!({
            "chat_id": "thread-7",
            "autonomous": {"deliver_to_human": false, "escalate": true},
            "opaque": [1, 2, {"nested": true}],
        });
        let mut envelope = Envelope::new("orchestrator", "agent-1", "", Map::new());
        envelope.payload = payload.as_object().unwrap().clone();

        let decoded = Envelope::from_fields(&envelope.to_fields()).unwrap();
        assert_eq!(decoded, envelope);
    }
}
