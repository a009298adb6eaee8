//! Runtime profiles and recipient routing policies.
//!
//! A [`RuntimeProfile`] fixes a runtime's role: its name, default identity,
//! base system prompt, and its [`RecipientPolicy`], which encodes the trust
//! topology of the fleet. A policy is a pure function from
//! `(envelope, payload)` to the ordered list of outbound recipients; a new
//! profile is a new policy implementation, not a subclass.
//!
//! Three policies are defined:
//!
//! - [`OrchestratorPolicy`]: routes to the declared reply path exclusively,
//!   and always loops the human back in once non-human work is complete.
//! - [`AutonomousPolicy`]: the orchestrator under autonomous mode, where the
//!   human is contacted only when the payload's `autonomous` directive asks
//!   for delivery or escalation, with a fallback to the human when the list
//!   would otherwise come out empty.
//! - [`AgentPolicy`]: agents answer their caller, never address the human
//!   directly, and always keep the orchestrator in the loop.
//!
//! Autonomous mode is a construction-time branch inside the orchestrator
//! profile factory, probed from the environment at [`load_profile`] time, so
//! the profile record stays immutable afterwards.

use serde_json::{Map, Value};
use std::error::Error;
use std::fmt;
use std::sync::Arc;

use super::envelope::{Envelope, HUMAN_RECIPIENT, ORCHESTRATOR_RECIPIENT};
use super::prompts::BASE_PROMPT;

const AUTONOMOUS_MODE_VALUES: [&str; 2] = ["autonomous", "human_obsolete"];
const AUTONOMOUS_FLAG_VALUES: [&str; 4] = ["1", "true", "yes", "on"];
const AUTONOMOUS_ENV_VARS: [&str; 3] = [
    "QUADRACODE_MODE",
    "QUADRACODE_AUTONOMOUS_MODE",
    "HUMAN_OBSOLETE_MODE",
];

/// Errors produced by profile resolution.
#[derive(Debug, Clone)]
pub enum ProfileError {
    /// The requested profile name is not defined.
    Unknown(String),
}

impl fmt::Display for ProfileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProfileError::Unknown(name) => write!(f, "unknown runtime profile: {}", name),
        }
    }
}

impl Error for ProfileError {}

/// Routing directive carried in `payload.autonomous`.
///
/// Only [`deliver_to_human`](AutonomousDirective::deliver_to_human) and
/// [`escalate`](AutonomousDirective::escalate) influence recipient selection;
/// the remaining fields are informational and pass through untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AutonomousDirective {
    /// The work product should be delivered to the human.
    pub deliver_to_human: bool,
    /// The runtime is stuck and needs a human decision.
    pub escalate: bool,
    /// Suggested recipient, informational.
    pub recipient: Option<String>,
    /// Why delivery/escalation was requested, informational.
    pub reason: Option<String>,
    /// Recovery strategies already attempted, informational.
    pub recovery_attempts: Vec<String>,
}

impl AutonomousDirective {
    /// Parse the directive from a payload, leniently.
    ///
    /// Returns `None` when `payload.autonomous` is absent or not an object.
    /// Flags accept booleans as well as truthy strings/numbers, since remote
    /// producers do not always preserve JSON types.
    pub fn from_payload(payload: &Map<String, Value>) -> Option<Self> {
        let directive = payload.get("autonomous")?.as_object()?;
        Some(Self {
            deliver_to_human: directive
                .get("deliver_to_human")
                .map(truthy)
                .unwrap_or(false),
            escalate: directive.get("escalate").map(truthy).unwrap_or(false),
            recipient: directive
                .get("recipient")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            reason: directive
                .get("reason")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            recovery_attempts: directive
                .get("recovery_attempts")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        })
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(flag) => *flag,
        Value::String(s) => {
            let normalized = s.trim().to_ascii_lowercase();
            AUTONOMOUS_FLAG_VALUES.contains(&normalized.as_str())
        }
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        _ => false,
    }
}

/// A pure routing decision: inbound envelope and payload in, ordered
/// recipient list out.
pub trait RecipientPolicy: Send + Sync {
    /// Resolve the outbound recipient list.
    fn resolve(&self, envelope: &Envelope, payload: &Map<String, Value>) -> Vec<String>;
}

/// Seed the recipient list shared by every policy: the declared `reply_to`
/// targets, else (optionally) the sender, else the policy fallback,
/// de-duplicated preserving first-seen order.
fn seed_recipients(
    envelope: &Envelope,
    payload: &Map<String, Value>,
    include_sender: bool,
    fallback: Option<&str>,
) -> Vec<String> {
    let mut recipients: Vec<String> = Vec::new();
    match payload.get("reply_to") {
        Some(Value::String(target)) if !target.is_empty() => recipients.push(target.clone()),
        Some(Value::Array(targets)) => {
            for target in targets {
                if let Value::String(target) = target {
                    if !target.is_empty() {
                        recipients.push(target.clone());
                    }
                }
            }
        }
        _ => {}
    }

    if recipients.is_empty() && include_sender && !envelope.sender.is_empty() {
        recipients.push(envelope.sender.clone());
    }
    if recipients.is_empty() {
        if let Some(fallback) = fallback {
            recipients.push(fallback.to_string());
        }
    }
    dedup_preserving_order(recipients)
}

fn dedup_preserving_order(recipients: Vec<String>) -> Vec<String> {
    let mut seen = Vec::with_capacity(recipients.len());
    for recipient in recipients {
        if !seen.contains(&recipient) {
            seen.push(recipient);
        }
    }
    seen
}

fn has_reply_to(payload: &Map<String, Value>) -> bool {
    match payload.get("reply_to") {
        Some(Value::String(target)) => !target.is_empty(),
        Some(Value::Array(targets)) => !targets.is_empty(),
        _ => false,
    }
}

/// Default orchestrator routing.
pub struct OrchestratorPolicy;

impl RecipientPolicy for OrchestratorPolicy {
    fn resolve(&self, envelope: &Envelope, payload: &Map<String, Value>) -> Vec<String> {
        let mut recipients =
            seed_recipients(envelope, payload, false, Some(HUMAN_RECIPIENT));

        // Declared reply paths are exclusive: they never also hit the human.
        if has_reply_to(payload) {
            recipients.retain(|r| r != HUMAN_RECIPIENT);
        }

        // Loop the human back in once non-human work is complete.
        if envelope.sender != HUMAN_RECIPIENT
            && !recipients.iter().any(|r| r == HUMAN_RECIPIENT)
        {
            recipients.push(HUMAN_RECIPIENT.to_string());
        }
        recipients
    }
}

/// Orchestrator routing under autonomous mode.
pub struct AutonomousPolicy;

impl RecipientPolicy for AutonomousPolicy {
    fn resolve(&self, envelope: &Envelope, payload: &Map<String, Value>) -> Vec<String> {
        let seeded = seed_recipients(envelope, payload, false, Some(HUMAN_RECIPIENT));

        let directive = AutonomousDirective::from_payload(payload).unwrap_or_default();
        let include_human = directive.deliver_to_human || directive.escalate;

        let non_human: Vec<String> = seeded
            .iter()
            .filter(|r| r.as_str() != HUMAN_RECIPIENT)
            .cloned()
            .collect();

        let mut recipients = if !non_human.is_empty() {
            let mut list = non_human;
            if include_human {
                list.push(HUMAN_RECIPIENT.to_string());
            }
            list
        } else if include_human {
            vec![HUMAN_RECIPIENT.to_string()]
        } else {
            // No non-human recipients and no request to contact the human.
            // Fall back to the human anyway so the message is never dropped.
            vec![HUMAN_RECIPIENT.to_string()]
        };

        recipients = dedup_preserving_order(recipients);
        recipients
    }
}

/// Agent routing: answer the caller, never the human, always copy the
/// orchestrator.
pub struct AgentPolicy;

impl RecipientPolicy for AgentPolicy {
    fn resolve(&self, envelope: &Envelope, payload: &Map<String, Value>) -> Vec<String> {
        let mut recipients =
            seed_recipients(envelope, payload, true, Some(ORCHESTRATOR_RECIPIENT));
        recipients.retain(|r| r != HUMAN_RECIPIENT);
        if !recipients.iter().any(|r| r == ORCHESTRATOR_RECIPIENT) {
            recipients.push(ORCHESTRATOR_RECIPIENT.to_string());
        }
        recipients
    }
}

/// An immutable runtime role.
#[derive(Clone)]
pub struct RuntimeProfile {
    /// Profile name (`"orchestrator"` or `"agent"`).
    pub name: String,
    /// Identity claimed when `QUADRACODE_ID` is unset.
    pub default_identity: String,
    /// Base system prompt handed to the reasoning graph.
    pub system_prompt: String,
    policy: Arc<dyn RecipientPolicy>,
}

impl RuntimeProfile {
    /// Assemble a profile from its parts.
    pub fn new(
        name: impl Into<String>,
        default_identity: impl Into<String>,
        system_prompt: impl Into<String>,
        policy: Arc<dyn RecipientPolicy>,
    ) -> Self {
        Self {
            name: name.into(),
            default_identity: default_identity.into(),
            system_prompt: system_prompt.into(),
            policy,
        }
    }

    /// Resolve the outbound recipients for an inbound envelope.
    pub fn resolve_recipients(
        &self,
        envelope: &Envelope,
        payload: &Map<String, Value>,
    ) -> Vec<String> {
        self.policy.resolve(envelope, payload)
    }
}

/// Whether the environment selects the autonomous orchestrator policy.
///
/// `QUADRACODE_MODE` triggers on `autonomous`/`human_obsolete` (and the
/// generic truthy flags); `QUADRACODE_AUTONOMOUS_MODE` and
/// `HUMAN_OBSOLETE_MODE` trigger on `1`/`true`/`yes`/`on`. All
/// case-insensitive.
pub fn is_autonomous_mode_enabled() -> bool {
    autonomous_mode_from(|name| std::env::var(name).ok())
}

fn autonomous_mode_from(get: impl Fn(&str) -> Option<String>) -> bool {
    for env_var in AUTONOMOUS_ENV_VARS.iter().copied() {
        let value = match get(env_var) {
            Some(value) => value,
            None => continue,
        };
        let normalized = value.trim().to_ascii_lowercase();
        if env_var == "QUADRACODE_MODE" && AUTONOMOUS_MODE_VALUES.contains(&normalized.as_str()) {
            return true;
        }
        if AUTONOMOUS_FLAG_VALUES.contains(&normalized.as_str()) {
            return true;
        }
    }
    false
}

/// The orchestrator profile, with the policy variant chosen explicitly.
pub fn orchestrator_profile(autonomous: bool) -> RuntimeProfile {
    let policy: Arc<dyn RecipientPolicy> = if autonomous {
        Arc::new(AutonomousPolicy)
    } else {
        Arc::new(OrchestratorPolicy)
    };
    RuntimeProfile::new(
        "orchestrator",
        ORCHESTRATOR_RECIPIENT,
        BASE_PROMPT,
        policy,
    )
}

/// The agent profile.
pub fn agent_profile() -> RuntimeProfile {
    RuntimeProfile::new("agent", "agent", BASE_PROMPT, Arc::new(AgentPolicy))
}

/// Load a profile by name, probing autonomous mode at call time.
pub fn load_profile(name: &str) -> Result<RuntimeProfile, ProfileError> {
    match name {
        "orchestrator" => Ok(orchestrator_profile(is_autonomous_mode_enabled())),
        "agent" => Ok(agent_profile()),
        other => Err(ProfileError::Unknown(other.to_string())),
    }
}
