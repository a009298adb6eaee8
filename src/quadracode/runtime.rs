//! The runtime loop: profile → identity → poll → dispatch → publish →
//! acknowledge.
//!
//! One [`RuntimeRunner`] per process. It claims an identity, polls its own
//! mailbox in entry-id order, hands each inbound envelope to the reasoning
//! graph under a thread-scoped checkpoint config, publishes the graph's
//! answer to the recipients the profile's routing policy computes, and
//! acknowledges the entry by deleting it.
//!
//! Failure containment is deliberate: any error while processing one entry
//! is logged and the entry is still deleted: the alternative, a
//! head-of-line block on a poison entry, can only be cleared by a human.
//! Delete-after-publish is not transactional; a crash between the two
//! replays the entry, so downstream consumers are required to be idempotent
//! with respect to `(sender, recipient, payload.thread_id,
//! payload.timestamp)`.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use quadracode::model::EchoModel;
//! use quadracode::profiles::load_profile;
//! use quadracode::runtime::{create_runtime, run_forever};
//! use quadracode::store::MemoryLogStore;
//!
//! # async {
//! let profile = load_profile("orchestrator").unwrap();
//! let runner = create_runtime(profile)
//!     .with_model(Arc::new(EchoModel::new()))
//!     .with_store(Arc::new(MemoryLogStore::new()))
//!     .build()
//!     .unwrap();
//! run_forever(Arc::new(runner)).await.unwrap();
//! # };
//! ```

use serde_json::Value;
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::sleep;

use super::chat::{last_message_content, messages_from_values, messages_to_values, ChatMessage};
use super::checkpointer::Checkpointer;
use super::config::{DEFAULT_BATCH_SIZE, DEFAULT_POLL_INTERVAL, IDENTITY_ENV_VAR};
use super::envelope::{Envelope, EntryId};
use super::graph::{
    build_graph, DispatchHook, GraphConfig, GraphError, ReasoningGraph, RuntimeState,
    ToolObserver,
};
use super::messaging::{MessagingClient, MessagingError};
use super::model::ModelClient;
use super::profiles::RuntimeProfile;
use super::registry::{AgentRegistryIntegration, HttpRegistryClient, RegistryClient};
use super::store::LogStore;
use super::tools::RuntimeTool;

/// Payload keys stripped before the inbound payload becomes the response
/// payload.
const STRIPPED_PAYLOAD_KEYS: [&str; 3] = ["reply_to", "messages", "state"];

/// Payload keys consulted, in order, when extracting the thread id.
const THREAD_ID_KEYS: [&str; 4] = ["chat_id", "thread_id", "session_id", "ticket_id"];

/// Fatal runtime errors. Everything else is contained inside the loop.
#[derive(Debug)]
pub enum RuntimeError {
    /// The resolved identity is blank.
    MissingIdentity,
    /// No model was bound before `build()`.
    MissingModel,
    /// Graph construction failed.
    Graph(GraphError),
    /// The mailbox read in `poll_once` failed after retries.
    Messaging(MessagingError),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::MissingIdentity => write!(f, "runtime identity resolved to empty"),
            RuntimeError::MissingModel => write!(f, "no model bound to the runtime"),
            RuntimeError::Graph(err) => write!(f, "{}", err),
            RuntimeError::Messaging(err) => write!(f, "{}", err),
        }
    }
}

impl Error for RuntimeError {}

/// Counters observable through [`RuntimeRunner::metrics`] and the
/// metric-publish hook.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuntimeMetrics {
    /// Entries dispatched successfully.
    pub processed: u64,
    /// Outbound envelopes published.
    pub published: u64,
    /// Entries that failed processing (still acknowledged).
    pub failed: u64,
    /// Malformed entries skipped by the messaging client.
    pub skipped_malformed: u64,
}

/// Hook invoked with a metrics snapshot after every handled entry.
pub type MetricsHook = Arc<dyn Fn(RuntimeMetrics) + Send + Sync>;

/// Start building a runtime for a profile.
pub fn create_runtime(profile: RuntimeProfile) -> RuntimeBuilder {
    RuntimeBuilder {
        profile,
        model: None,
        tools: Vec::new(),
        store: None,
        checkpointer: None,
        registry_client: None,
        poll_interval: DEFAULT_POLL_INTERVAL,
        batch_size: DEFAULT_BATCH_SIZE,
        graph_deadline: None,
        pre_dispatch: None,
        post_dispatch: None,
        tool_observer: None,
        metrics_hook: None,
    }
}

/// Builder for [`RuntimeRunner`].
pub struct RuntimeBuilder {
    profile: RuntimeProfile,
    model: Option<Arc<dyn ModelClient>>,
    tools: Vec<Arc<dyn RuntimeTool>>,
    store: Option<Arc<dyn LogStore>>,
    checkpointer: Option<Arc<dyn Checkpointer>>,
    registry_client: Option<Arc<dyn RegistryClient>>,
    poll_interval: Duration,
    batch_size: usize,
    graph_deadline: Option<Duration>,
    pre_dispatch: Option<DispatchHook>,
    post_dispatch: Option<DispatchHook>,
    tool_observer: Option<ToolObserver>,
    metrics_hook: Option<MetricsHook>,
}

impl RuntimeBuilder {
    /// Bind the reasoning model. Required.
    pub fn with_model(mut self, model: Arc<dyn ModelClient>) -> Self {
        self.model = Some(model);
        self
    }

    /// Bind the tool set exposed to the graph.
    pub fn with_tools(mut self, tools: Vec<Arc<dyn RuntimeTool>>) -> Self {
        self.tools = tools;
        self
    }

    /// Bind the log store the mailboxes live in. Defaults to an in-process
    /// [`MemoryLogStore`](super::store::MemoryLogStore).
    pub fn with_store(mut self, store: Arc<dyn LogStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use a specific thread checkpointer.
    pub fn with_checkpointer(mut self, checkpointer: Arc<dyn Checkpointer>) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    /// Use a specific registry client for agent registration.
    pub fn with_registry_client(mut self, client: Arc<dyn RegistryClient>) -> Self {
        self.registry_client = Some(client);
        self
    }

    /// Override the mailbox poll cadence (default 1 s).
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Override the read batch size (default 5).
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the overall graph invocation deadline.
    pub fn with_graph_deadline(mut self, deadline: Duration) -> Self {
        self.graph_deadline = Some(deadline);
        self
    }

    /// Install a pre-dispatch hook on the graph.
    pub fn with_pre_dispatch(mut self, hook: DispatchHook) -> Self {
        self.pre_dispatch = Some(hook);
        self
    }

    /// Install a post-dispatch hook on the graph.
    pub fn with_post_dispatch(mut self, hook: DispatchHook) -> Self {
        self.post_dispatch = Some(hook);
        self
    }

    /// Observe tool results as the graph appends them.
    pub fn with_tool_observer(mut self, observer: ToolObserver) -> Self {
        self.tool_observer = Some(observer);
        self
    }

    /// Receive a metrics snapshot after every handled entry.
    pub fn with_metrics_hook(mut self, hook: MetricsHook) -> Self {
        self.metrics_hook = Some(hook);
        self
    }

    /// Resolve identity, compile the graph, and assemble the runner.
    pub fn build(self) -> Result<RuntimeRunner, RuntimeError> {
        let identity = std::env::var(IDENTITY_ENV_VAR)
            .ok()
            .unwrap_or_else(|| self.profile.default_identity.clone());
        if identity.trim().is_empty() {
            return Err(RuntimeError::MissingIdentity);
        }

        let model = self.model.ok_or(RuntimeError::MissingModel)?;
        let mut graph = build_graph(self.profile.system_prompt.clone())
            .with_model(model)
            .with_tools(self.tools);
        if let Some(checkpointer) = self.checkpointer {
            graph = graph.with_checkpointer(checkpointer);
        }
        if let Some(deadline) = self.graph_deadline {
            graph = graph.with_deadline(deadline);
        }
        if let Some(hook) = self.pre_dispatch {
            graph = graph.with_pre_dispatch(hook);
        }
        if let Some(hook) = self.post_dispatch {
            graph = graph.with_post_dispatch(hook);
        }
        if let Some(observer) = self.tool_observer {
            graph = graph.with_tool_observer(observer);
        }
        let graph = Arc::new(graph.build().map_err(RuntimeError::Graph)?);

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(super::store::MemoryLogStore::new()));
        let messaging = Arc::new(MessagingClient::new(store));

        let registry_client = self
            .registry_client
            .unwrap_or_else(|| Arc::new(HttpRegistryClient::from_environment()));
        let registry =
            AgentRegistryIntegration::from_environment(&self.profile.name, &identity, registry_client);

        Ok(RuntimeRunner {
            profile: self.profile,
            identity,
            poll_interval: self.poll_interval,
            batch_size: self.batch_size,
            graph,
            messaging,
            registry,
            stop_flag: AtomicBool::new(false),
            stop_notify: Notify::new(),
            processed: AtomicU64::new(0),
            published: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            metrics_hook: self.metrics_hook,
        })
    }
}

/// One process's runtime: identity, poll loop, dispatch, registry lifecycle.
pub struct RuntimeRunner {
    profile: RuntimeProfile,
    identity: String,
    poll_interval: Duration,
    batch_size: usize,
    graph: Arc<ReasoningGraph>,
    messaging: Arc<MessagingClient>,
    registry: Option<AgentRegistryIntegration>,
    stop_flag: AtomicBool,
    stop_notify: Notify,
    processed: AtomicU64,
    published: AtomicU64,
    failed: AtomicU64,
    metrics_hook: Option<MetricsHook>,
}

impl RuntimeRunner {
    /// The identity whose mailbox this runtime polls.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// The profile this runtime adopted.
    pub fn profile(&self) -> &RuntimeProfile {
        &self.profile
    }

    /// The shared messaging client.
    pub fn messaging(&self) -> &Arc<MessagingClient> {
        &self.messaging
    }

    /// The compiled reasoning graph.
    pub fn graph(&self) -> &Arc<ReasoningGraph> {
        &self.graph
    }

    /// Snapshot of the runtime counters.
    pub fn metrics(&self) -> RuntimeMetrics {
        RuntimeMetrics {
            processed: self.processed.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped_malformed: self.messaging.skipped_malformed(),
        }
    }

    /// Ask the poll loop to exit after the current iteration.
    pub fn request_stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        self.stop_notify.notify_one();
    }

    /// Run the poll loop until [`request_stop`](Self::request_stop).
    ///
    /// Starts the registry integration first (best-effort) and tears it down
    /// on the way out.
    pub async fn start(&self) -> Result<(), RuntimeError> {
        if let Some(registry) = &self.registry {
            registry.start().await;
        }
        log::info!(
            "runtime {} ({} profile) polling every {:?}",
            self.identity,
            self.profile.name,
            self.poll_interval
        );

        while !self.stop_flag.load(Ordering::SeqCst) {
            match self.messaging.read(&self.identity, self.batch_size).await {
                Ok(entries) if entries.is_empty() => self.idle_sleep().await,
                Ok(entries) => {
                    for (entry_id, envelope) in entries {
                        self.handle_entry(entry_id, envelope).await;
                    }
                }
                Err(err) => {
                    log::error!("mailbox read for {} failed: {}", self.identity, err);
                    self.idle_sleep().await;
                }
            }
        }

        if let Some(registry) = &self.registry {
            registry.shutdown().await;
        }
        log::info!("runtime {} stopped", self.identity);
        Ok(())
    }

    /// Read and process a single batch. Returns how many entries were
    /// handled. This is the deterministic surface the integration tests
    /// drive; `start` is a loop around the same path.
    pub async fn poll_once(&self) -> Result<usize, RuntimeError> {
        let entries = self
            .messaging
            .read(&self.identity, self.batch_size)
            .await
            .map_err(RuntimeError::Messaging)?;
        let count = entries.len();
        for (entry_id, envelope) in entries {
            self.handle_entry(entry_id, envelope).await;
        }
        Ok(count)
    }

    async fn idle_sleep(&self) {
        tokio::select! {
            _ = sleep(self.poll_interval) => {}
            _ = self.stop_notify.notified() => {}
        }
    }

    /// Dispatch one entry, publish the responses, and acknowledge.
    ///
    /// The entry is deleted even when processing or publication failed:
    /// at-least-once delivery makes redelivery safe, while a poison entry
    /// left in place would block the mailbox forever.
    async fn handle_entry(&self, entry_id: EntryId, envelope: Envelope) {
        match self.process_envelope(&envelope).await {
            Ok(responses) => {
                for response in &responses {
                    match self.messaging.publish(&response.recipient, response).await {
                        Ok(_) => {
                            self.published.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(err) => {
                            log::error!(
                                "failed to publish response to {}: {}",
                                response.recipient,
                                err
                            );
                        }
                    }
                }
                self.processed.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                log::error!("Runtime error for message {}: {}", entry_id, err);
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
        }

        if let Err(err) = self.messaging.delete(&self.identity, entry_id).await {
            log::error!("failed to acknowledge entry {}: {}", entry_id, err);
        }

        if let Some(hook) = &self.metrics_hook {
            hook(self.metrics());
        }
    }

    async fn process_envelope(
        &self,
        envelope: &Envelope,
    ) -> Result<Vec<Envelope>, Box<dyn Error + Send + Sync>> {
        let payload = envelope.payload.clone();
        let thread_id = extract_thread_id(&payload, envelope, &self.identity);
        let config = GraphConfig::new(thread_id.clone());

        let has_checkpoint = self.graph.has_thread(&thread_id).await;
        let mut messages: Vec<ChatMessage> = Vec::new();
        if !has_checkpoint {
            messages.extend(history_from(&payload));
        }
        if !envelope.message.is_empty() {
            messages.push(ChatMessage::human(envelope.message.clone()));
        } else if has_checkpoint {
            // The checkpointer already holds the history; an empty body may
            // still carry the actual turn in payload.messages.
            if let Some(turn) = last_payload_turn(&payload) {
                messages.push(turn);
            }
        }

        let state = RuntimeState::with_messages(messages);
        let outcome = self
            .graph
            .invoke(state, &config)
            .await
            .map_err(|err| Box::new(err) as Box<dyn Error + Send + Sync>)?;
        let output = outcome.new_messages;

        let mut response_payload = payload.clone();
        for key in &STRIPPED_PAYLOAD_KEYS {
            response_payload.remove(*key);
        }
        response_payload.insert(
            "messages".to_string(),
            Value::Array(messages_to_values(&output)),
        );
        response_payload.insert("chat_id".to_string(), Value::String(thread_id.clone()));
        response_payload.insert("thread_id".to_string(), Value::String(thread_id));

        let response_body = last_message_content(&output);
        let recipients = self.profile.resolve_recipients(envelope, &payload);

        Ok(recipients
            .into_iter()
            .map(|recipient| {
                Envelope::new(
                    self.identity.clone(),
                    recipient,
                    response_body.clone(),
                    response_payload.clone(),
                )
            })
            .collect())
    }
}

/// Run a built runtime until a termination signal arrives.
pub async fn run_forever(runner: Arc<RuntimeRunner>) -> Result<(), RuntimeError> {
    let watcher = Arc::clone(&runner);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("termination signal received; shutting down");
            watcher.request_stop();
        }
    });
    runner.start().await
}

/// Extract the conversation thread id from an inbound envelope.
///
/// Precedence: `chat_id`, `thread_id`, `session_id`, `ticket_id` from the
/// payload, then the sender, then this runtime's identity. First non-empty
/// wins.
fn extract_thread_id(
    payload: &serde_json::Map<String, Value>,
    envelope: &Envelope,
    identity: &str,
) -> String {
    for key in &THREAD_ID_KEYS {
        match payload.get(*key) {
            Some(Value::String(raw)) if !raw.trim().is_empty() => return raw.clone(),
            Some(Value::Number(raw)) => return raw.to_string(),
            _ => {}
        }
    }
    if !envelope.sender.trim().is_empty() {
        return envelope.sender.clone();
    }
    identity.to_string()
}

/// Prior history carried in the payload, for threads with no checkpoint yet.
///
/// Prefers `payload.state.messages`, falls back to `payload.messages`, and
/// finally to empty. A list that fails to decode is treated as absent.
fn history_from(payload: &serde_json::Map<String, Value>) -> Vec<ChatMessage> {
    if let Some(Value::Object(state)) = payload.get("state") {
        if let Some(Value::Array(values)) = state.get("messages") {
            if let Ok(messages) = messages_from_values(values) {
                return messages;
            }
        }
    }
    if let Some(Value::Array(values)) = payload.get("messages") {
        if let Ok(messages) = messages_from_values(values) {
            return messages;
        }
    }
    Vec::new()
}

fn last_payload_turn(payload: &serde_json::Map<String, Value>) -> Option<ChatMessage> {
    let values = payload.get("messages")?.as_array()?;
    let last = values.last()?;
    serde_json::from_value::<ChatMessage>(last.clone()).ok()
}
