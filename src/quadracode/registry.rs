//! Agent registration and heartbeat lifecycle.
//!
//! Runtimes under an agent profile announce themselves to the fleet's
//! registry service and keep the record warm with periodic heartbeats. The
//! registry is an opaque, tool-like endpoint: every operation answers with a
//! free-form string, and failure is detected by sniffing the response rather
//! than by status codes: an empty answer or one starting with
//! `registry request failed` / `unable to reach` (case-insensitive, trimmed)
//! counts as an error.
//!
//! Registration is best-effort and never fatal: a failed register marks the
//! integration un-registered and the next heartbeat wake retries the
//! register call. On graceful shutdown the heartbeat task is cancelled and
//! the record is removed.

use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use super::config::{
    env_flag, env_u64, AGENT_HOST_ENV_VAR, AGENT_PORT_ENV_VAR, AUTOREGISTER_ENV_VAR,
    DEFAULT_AGENT_PORT, DEFAULT_HEARTBEAT_SECS, DEFAULT_REGISTRY_URL,
    HEARTBEAT_INTERVAL_ENV_VAR, MIN_HEARTBEAT_SECS, REGISTRY_URL_ENV_VAR,
};

/// Client for the registry's three operations.
///
/// Every call returns the service's free-form answer; transport failures are
/// reported *as* an answer (an `unable to reach ...` string) so the error
/// sniffing in [`looks_like_error`] applies uniformly.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Announce an agent at `host:port`.
    async fn register_agent(&self, agent_id: &str, host: &str, port: u16) -> String;

    /// Refresh the agent's record.
    async fn heartbeat(&self, agent_id: &str, status: &str) -> String;

    /// Remove the agent's record.
    async fn unregister_agent(&self, agent_id: &str) -> String;
}

/// Whether a registry answer denotes failure.
pub fn looks_like_error(response: &str) -> bool {
    let lowered = response.trim().to_ascii_lowercase();
    if lowered.is_empty() {
        return true;
    }
    lowered.starts_with("registry request failed") || lowered.starts_with("unable to reach")
}

/// HTTP client for the registry service.
///
/// Posts `{operation, agent_id, ...}` to `{base_url}/{operation}` and returns
/// the response body verbatim.
pub struct HttpRegistryClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpRegistryClient {
    /// Client for the given registry endpoint.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http: reqwest::Client::new(),
        }
    }

    /// Client for the endpoint named by `QUADRACODE_REGISTRY_URL`.
    pub fn from_environment() -> Self {
        let base_url = std::env::var(REGISTRY_URL_ENV_VAR)
            .ok()
            .filter(|url| !url.is_empty())
            .unwrap_or_else(|| DEFAULT_REGISTRY_URL.to_string());
        Self::new(base_url)
    }

    async fn call(&self, operation: &str, body: serde_json::Value) -> String {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), operation);
        match self.http.post(&url).json(&body).send().await {
            Ok(response) => match response.text().await {
                Ok(text) => text,
                Err(err) => format!("unable to reach agent registry: {}", err),
            },
            Err(err) => format!("unable to reach agent registry: {}", err),
        }
    }
}

#[async_trait]
impl RegistryClient for HttpRegistryClient {
    async fn register_agent(&self, agent_id: &str, host: &str, port: u16) -> String {
        self.call(
            "register_agent",
            json!({
                "operation": "register_agent",
                "agent_id": agent_id,
                "host": host,
                "port": port,
            }),
        )
        .await
    }

    async fn heartbeat(&self, agent_id: &str, status: &str) -> String {
        self.call(
            "heartbeat",
            json!({
                "operation": "heartbeat",
                "agent_id": agent_id,
                "status": status,
            }),
        )
        .await
    }

    async fn unregister_agent(&self, agent_id: &str) -> String {
        self.call(
            "unregister_agent",
            json!({
                "operation": "unregister_agent",
                "agent_id": agent_id,
            }),
        )
        .await
    }
}

struct Inner {
    agent_id: String,
    host: String,
    port: u16,
    registered: AtomicBool,
    client: Arc<dyn RegistryClient>,
}

impl Inner {
    async fn register(&self) -> bool {
        let response = self
            .client
            .register_agent(&self.agent_id, &self.host, self.port)
            .await;
        if looks_like_error(&response) {
            log::warn!("agent registry registration error: {}", response);
            self.registered.store(false, Ordering::SeqCst);
            return false;
        }
        log::info!(
            "registered agent {} with registry ({}:{})",
            self.agent_id,
            self.host,
            self.port
        );
        self.registered.store(true, Ordering::SeqCst);
        true
    }

    async fn heartbeat(&self) -> bool {
        let response = self.client.heartbeat(&self.agent_id, "healthy").await;
        if looks_like_error(&response) {
            log::warn!("agent heartbeat failed: {}", response);
            return false;
        }
        log::debug!("heartbeat acknowledged for agent {}", self.agent_id);
        true
    }

    async fn unregister(&self) {
        let response = self.client.unregister_agent(&self.agent_id).await;
        if looks_like_error(&response) {
            log::warn!("agent unregister failed: {}", response);
        } else {
            log::info!("unregistered agent {} from registry", self.agent_id);
        }
        self.registered.store(false, Ordering::SeqCst);
    }
}

/// Owns the registration state and the background heartbeat task.
pub struct AgentRegistryIntegration {
    inner: Arc<Inner>,
    interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AgentRegistryIntegration {
    /// Build an integration with explicit parameters.
    ///
    /// The heartbeat interval is clamped to at least
    /// [`MIN_HEARTBEAT_SECS`](super::config::MIN_HEARTBEAT_SECS) seconds.
    pub fn new(
        agent_id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        interval_secs: u64,
        client: Arc<dyn RegistryClient>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                agent_id: agent_id.into(),
                host: host.into(),
                port,
                registered: AtomicBool::new(false),
                client,
            }),
            interval: Duration::from_secs(interval_secs.max(MIN_HEARTBEAT_SECS)),
            task: Mutex::new(None),
        }
    }

    /// Build from the environment, or `None` when the profile is not an
    /// agent or auto-registration is disabled.
    pub fn from_environment(
        profile_name: &str,
        agent_id: &str,
        client: Arc<dyn RegistryClient>,
    ) -> Option<Self> {
        if profile_name != "agent" {
            return None;
        }
        if !env_flag(AUTOREGISTER_ENV_VAR, true) {
            log::info!("agent auto-registration disabled via environment");
            return None;
        }

        let host = std::env::var(AGENT_HOST_ENV_VAR)
            .or_else(|_| std::env::var("AGENT_HOST"))
            .or_else(|_| std::env::var("HOSTNAME"))
            .ok()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| agent_id.to_string());
        let port = env_u64(AGENT_PORT_ENV_VAR, u64::from(DEFAULT_AGENT_PORT)) as u16;
        let interval = env_u64(HEARTBEAT_INTERVAL_ENV_VAR, DEFAULT_HEARTBEAT_SECS);
        Some(Self::new(agent_id, host, port, interval, client))
    }

    /// Whether the agent currently holds a live registration.
    pub fn is_registered(&self) -> bool {
        self.inner.registered.load(Ordering::SeqCst)
    }

    /// The effective heartbeat cadence after clamping.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Register (best-effort) and start the heartbeat task.
    pub async fn start(&self) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }
        if !self.inner.register().await {
            log::warn!("initial agent registry registration failed; will retry in heartbeat loop");
        }
        let inner = Arc::clone(&self.inner);
        let interval = self.interval;
        *task = Some(tokio::spawn(async move {
            loop {
                sleep(interval).await;
                if !inner.registered.load(Ordering::SeqCst) {
                    inner.register().await;
                } else if !inner.heartbeat().await {
                    inner.registered.store(false, Ordering::SeqCst);
                }
            }
        }));
    }

    /// Cancel the heartbeat task and unregister if currently registered.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }
        if self.inner.registered.load(Ordering::SeqCst) {
            self.inner.unregister().await;
        }
    }
}
