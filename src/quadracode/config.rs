//! Environment configuration for the runtime process.
//!
//! All knobs the core reads from the environment are named here, together
//! with the lenient parsing helpers the registry integration and the entry
//! point share. Deployment defaults live next to the names so operators have
//! one place to look.

use std::time::Duration;

/// Identity override for this process.
pub const IDENTITY_ENV_VAR: &str = "QUADRACODE_ID";

/// Profile selector for the entry point (`orchestrator` or `agent`).
pub const PROFILE_ENV_VAR: &str = "QUADRACODE_PROFILE";

/// Endpoint of the stream-store service the binary's mailboxes live in.
pub const STREAM_URL_ENV_VAR: &str = "QUADRACODE_STREAM_URL";

/// Endpoint of the agent-registry service.
pub const REGISTRY_URL_ENV_VAR: &str = "QUADRACODE_REGISTRY_URL";

/// Registry endpoint used when [`REGISTRY_URL_ENV_VAR`] is unset.
pub const DEFAULT_REGISTRY_URL: &str = "http://localhost:8124";

/// Toggle for agent auto-registration (truthy by default).
pub const AUTOREGISTER_ENV_VAR: &str = "QUADRACODE_AGENT_AUTOREGISTER";

/// Hostname advertised to the registry.
pub const AGENT_HOST_ENV_VAR: &str = "QUADRACODE_AGENT_HOST";

/// Port advertised to the registry.
pub const AGENT_PORT_ENV_VAR: &str = "QUADRACODE_AGENT_PORT";

/// Heartbeat cadence in seconds.
pub const HEARTBEAT_INTERVAL_ENV_VAR: &str = "QUADRACODE_AGENT_HEARTBEAT_INTERVAL";

/// Default advertised port.
pub const DEFAULT_AGENT_PORT: u16 = 8123;

/// Default heartbeat cadence.
pub const DEFAULT_HEARTBEAT_SECS: u64 = 15;

/// Lower bound enforced on the heartbeat cadence.
pub const MIN_HEARTBEAT_SECS: u64 = 5;

/// Default mailbox poll cadence.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default mailbox read batch size.
pub const DEFAULT_BATCH_SIZE: usize = 5;

/// Read a boolean flag from the environment.
///
/// Unset returns `default`; any value other than `0`/`false`/`no`/`off`
/// (case-insensitive) counts as true.
pub fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Err(_) => default,
        Ok(raw) => {
            let normalized = raw.trim().to_ascii_lowercase();
            !matches!(normalized.as_str(), "0" | "false" | "no" | "off")
        }
    }
}

/// Read an integer from the environment, keeping `default` (and warning) on
/// unset or unparseable values.
pub fn env_u64(name: &str, default: u64) -> u64 {
    match std::env::var(name) {
        Err(_) => default,
        Ok(raw) => match raw.trim().parse::<u64>() {
            Ok(value) => value,
            Err(_) => {
                log::warn!("invalid integer for {}={}; using {}", name, raw, default);
                default
            }
        },
    }
}
