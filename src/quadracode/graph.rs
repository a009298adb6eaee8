//! The per-thread reasoning graph.
//!
//! Each conversation thread is driven by a tiny state machine with two real
//! nodes and a conditional edge, plus a checkpointer that persists the
//! thread's message list between invocations:
//!
//! ```text
//! START ──> driver ──(assistant turn has tool_calls)──> tools
//!             ^                                           │
//!             └───────────────────────────────────────────┘
//!             │
//!             └──(no tool_calls, cap, deadline, or model error)──> END
//! ```
//!
//! The `driver` node frames the message list with a composed system turn,
//! invokes the bound [`ModelClient`](crate::quadracode::model::ModelClient),
//! and appends the assistant turn. The `tools` node resolves each pending
//! tool call through the bound tool set and appends one tool turn per call.
//! The tools→driver loop is capped (default
//! [`DEFAULT_MAX_TOOL_CYCLES`]); exceeding the cap forces an END with an
//! error turn appended, as does running past the overall deadline.
//!
//! Graph-produced messages are *appended* to the persisted list: an
//! invocation never replaces history, and two invocations for the same
//! thread id are serialised by a per-thread lock held across the
//! checkpointer's get/put.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use quadracode::graph::{build_graph, GraphConfig, RuntimeState};
//! use quadracode::chat::ChatMessage;
//! use quadracode::model::EchoModel;
//!
//! # async {
//! let graph = build_graph("You are the orchestrator.")
//!     .with_model(Arc::new(EchoModel::new()))
//!     .build()
//!     .unwrap();
//!
//! let state = RuntimeState::with_messages(vec![ChatMessage::human("Hello")]);
//! let config = GraphConfig::new("thread-1");
//! let outcome = graph.invoke(state, &config).await.unwrap();
//! println!("{}", outcome.new_messages.last().unwrap().content);
//! # };
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::timeout;

use super::chat::{ChatMessage, Role};
use super::checkpointer::{Checkpointer, CheckpointError, MemoryCheckpointer};
use super::model::{ModelClient, ModelError, ToolDefinition};
use super::tools::RuntimeTool;

/// Bound on tools→driver cycles within one invocation.
pub const DEFAULT_MAX_TOOL_CYCLES: usize = 32;

/// Optional instruction preamble attached to a thread's state by hooks.
///
/// Rendered into the composed system turn, section by section, after the
/// profile's base prompt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptOutline {
    /// Free-form instruction preamble.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    /// One focus item or a bulleted focus block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focus: Option<Focus>,
    /// Rendered as `Suggested context order: a, b, c`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ordered_segments: Vec<String>,
}

/// Focus section of a [`PromptOutline`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Focus {
    /// A single focus line: `Focus: <item>`.
    One(String),
    /// A bulleted block headed by `Focus:`.
    Many(Vec<String>),
}

/// Metadata of one active skill, surfaced to the model in the system turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillMetadata {
    /// Skill identifier.
    pub name: String,
    /// One-line description; omitted from the rendering when empty.
    #[serde(default)]
    pub description: String,
    /// Free-form tags rendered as `(tags: a, b)`.
    #[serde(default)]
    pub tags: Vec<String>,
}

/// The state a graph invocation operates on.
#[derive(Clone, Default)]
pub struct RuntimeState {
    /// The message list. On input: the new turns of this invocation (the
    /// checkpointer supplies history). Inside hooks: the merged thread list.
    pub messages: Vec<ChatMessage>,
    /// Optional prompt outline, typically attached by a pre-dispatch hook.
    pub outline: Option<PromptOutline>,
    /// Active skill metadata; the last six entries are rendered.
    pub active_skills: Vec<SkillMetadata>,
}

impl RuntimeState {
    /// State carrying only a message list.
    pub fn with_messages(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            outline: None,
            active_skills: Vec::new(),
        }
    }
}

/// Per-invocation configuration.
#[derive(Debug, Clone)]
pub struct GraphConfig {
    /// The conversation thread this invocation belongs to.
    pub thread_id: String,
}

impl GraphConfig {
    /// Configuration for the given thread id.
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
        }
    }
}

/// Result of one graph invocation: only the messages this invocation added.
#[derive(Debug, Clone)]
pub struct GraphOutcome {
    /// Assistant and tool turns appended by this invocation (plus anything a
    /// post-dispatch hook appended).
    pub new_messages: Vec<ChatMessage>,
}

/// Hook that may rewrite the state before or after the node loop.
///
/// Hooks must preserve the append-only invariant of the message list.
pub type DispatchHook = Arc<dyn Fn(RuntimeState) -> RuntimeState + Send + Sync>;

/// Observer invoked with `(tool_name, content)` after every tool invocation.
pub type ToolObserver = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Errors surfaced by graph construction or invocation.
#[derive(Debug)]
pub enum GraphError {
    /// `build()` was called without a bound model.
    MissingModel,
    /// The checkpointer failed to load or persist the thread.
    Checkpoint(CheckpointError),
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphError::MissingModel => write!(f, "no model bound to the graph"),
            GraphError::Checkpoint(err) => write!(f, "{}", err),
        }
    }
}

impl Error for GraphError {}

impl From<CheckpointError> for GraphError {
    fn from(err: CheckpointError) -> Self {
        GraphError::Checkpoint(err)
    }
}

/// Start building a graph around a profile's base system prompt.
pub fn build_graph(system_prompt: impl Into<String>) -> GraphBuilder {
    GraphBuilder {
        system_prompt: system_prompt.into(),
        model: None,
        tools: Vec::new(),
        checkpointer: None,
        pre_dispatch: None,
        post_dispatch: None,
        tool_observer: None,
        max_tool_cycles: DEFAULT_MAX_TOOL_CYCLES,
        deadline: None,
    }
}

/// Builder for [`ReasoningGraph`].
pub struct GraphBuilder {
    system_prompt: String,
    model: Option<Arc<dyn ModelClient>>,
    tools: Vec<Arc<dyn RuntimeTool>>,
    checkpointer: Option<Arc<dyn Checkpointer>>,
    pre_dispatch: Option<DispatchHook>,
    post_dispatch: Option<DispatchHook>,
    tool_observer: Option<ToolObserver>,
    max_tool_cycles: usize,
    deadline: Option<Duration>,
}

impl GraphBuilder {
    /// Bind the model the driver node invokes. Required.
    pub fn with_model(mut self, model: Arc<dyn ModelClient>) -> Self {
        self.model = Some(model);
        self
    }

    /// Bind the full tool set.
    pub fn with_tools(mut self, tools: Vec<Arc<dyn RuntimeTool>>) -> Self {
        self.tools = tools;
        self
    }

    /// Add one tool to the set.
    pub fn with_tool(mut self, tool: Arc<dyn RuntimeTool>) -> Self {
        self.tools.push(tool);
        self
    }

    /// Use a specific checkpointer. Defaults to [`MemoryCheckpointer`].
    pub fn with_checkpointer(mut self, checkpointer: Arc<dyn Checkpointer>) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    /// Install a hook that rewrites the state before the node loop runs.
    pub fn with_pre_dispatch(mut self, hook: DispatchHook) -> Self {
        self.pre_dispatch = Some(hook);
        self
    }

    /// Install a hook that rewrites the state after the node loop ends.
    pub fn with_post_dispatch(mut self, hook: DispatchHook) -> Self {
        self.post_dispatch = Some(hook);
        self
    }

    /// Observe every tool result as it is appended.
    pub fn with_tool_observer(mut self, observer: ToolObserver) -> Self {
        self.tool_observer = Some(observer);
        self
    }

    /// Override the tools→driver cycle cap.
    pub fn with_max_tool_cycles(mut self, cap: usize) -> Self {
        self.max_tool_cycles = cap;
        self
    }

    /// Set the overall invocation deadline.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Finish the build.
    pub fn build(self) -> Result<ReasoningGraph, GraphError> {
        let model = self.model.ok_or(GraphError::MissingModel)?;
        let mut tools = HashMap::new();
        let mut definitions = Vec::new();
        for tool in self.tools {
            let definition = tool.definition();
            definitions.push(definition.clone());
            tools.insert(definition.name, tool);
        }
        Ok(ReasoningGraph {
            system_prompt: self.system_prompt,
            model,
            tools,
            definitions,
            checkpointer: self
                .checkpointer
                .unwrap_or_else(|| Arc::new(MemoryCheckpointer::new())),
            locks: Mutex::new(HashMap::new()),
            pre_dispatch: self.pre_dispatch,
            post_dispatch: self.post_dispatch,
            tool_observer: self.tool_observer,
            max_tool_cycles: self.max_tool_cycles,
            deadline: self.deadline,
        })
    }
}

/// The compiled driver↔tools state machine for one profile.
pub struct ReasoningGraph {
    system_prompt: String,
    model: Arc<dyn ModelClient>,
    tools: HashMap<String, Arc<dyn RuntimeTool>>,
    definitions: Vec<ToolDefinition>,
    checkpointer: Arc<dyn Checkpointer>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    pre_dispatch: Option<DispatchHook>,
    post_dispatch: Option<DispatchHook>,
    tool_observer: Option<ToolObserver>,
    max_tool_cycles: usize,
    deadline: Option<Duration>,
}

impl ReasoningGraph {
    /// Whether a checkpoint exists for the thread.
    pub async fn has_thread(&self, thread_id: &str) -> bool {
        match self.checkpointer.get(thread_id).await {
            Ok(state) => state.is_some(),
            Err(err) => {
                log::debug!("checkpoint probe for {} failed: {}", thread_id, err);
                false
            }
        }
    }

    /// The checkpointer backing this graph.
    pub fn checkpointer(&self) -> &Arc<dyn Checkpointer> {
        &self.checkpointer
    }

    /// Run the graph to completion for one inbound state.
    ///
    /// Merges the persisted thread history with `input.messages`, loops
    /// driver↔tools until the assistant stops calling tools (or the cap /
    /// deadline forces an END), persists the full list, and returns only the
    /// messages this invocation added. Invocations for the same thread id are
    /// serialised; different threads run in parallel.
    pub async fn invoke(
        &self,
        input: RuntimeState,
        config: &GraphConfig,
    ) -> Result<GraphOutcome, GraphError> {
        let lock = self.thread_lock(&config.thread_id).await;
        let _guard = lock.lock().await;

        let prior = self
            .checkpointer
            .get(&config.thread_id)
            .await?
            .unwrap_or_default();

        let mut state = input;
        let mut merged = prior;
        merged.append(&mut state.messages);
        state.messages = merged;

        if let Some(pre) = &self.pre_dispatch {
            state = pre(state);
        }

        let system_prompt = self.compose_system_prompt(&state);
        frame_system_turn(&mut state.messages, system_prompt.clone());
        let baseline = state.messages.len();

        let started = Instant::now();
        let end = self.deadline.map(|d| started + d);
        let mut cycles = 0usize;

        loop {
            frame_system_turn(&mut state.messages, system_prompt.clone());

            let result = self.call_model(&state.messages, end).await;
            let assistant = match result {
                Ok(turn) => turn,
                Err(err) => {
                    log::error!("driver node failed for {}: {}", config.thread_id, err);
                    state.messages.push(ChatMessage::ai(format!("error: {}", err)));
                    break;
                }
            };

            let pending: Vec<_> = assistant.tool_calls.clone();
            state.messages.push(assistant);
            if pending.is_empty() {
                break;
            }

            cycles += 1;
            if cycles > self.max_tool_cycles {
                log::error!(
                    "thread {} exceeded the tool cycle cap of {}",
                    config.thread_id,
                    self.max_tool_cycles
                );
                state.messages.push(ChatMessage::ai(format!(
                    "error: tool cycle limit of {} exceeded",
                    self.max_tool_cycles
                )));
                break;
            }

            for call in pending {
                let content = match self.tools.get(&call.name) {
                    None => format!("error: unknown tool {}", call.name),
                    Some(tool) => match tool.invoke(call.args.clone()).await {
                        Ok(content) => content,
                        Err(err) => format!("error: {}", err),
                    },
                };
                if let Some(observer) = &self.tool_observer {
                    observer(&call.name, &content);
                }
                state
                    .messages
                    .push(ChatMessage::tool(call.name, call.id, content));
            }
        }

        if let Some(post) = &self.post_dispatch {
            state = post(state);
        }

        self.checkpointer
            .put(&config.thread_id, &state.messages)
            .await?;

        let new_messages = state.messages[baseline.min(state.messages.len())..].to_vec();
        Ok(GraphOutcome { new_messages })
    }

    async fn call_model(
        &self,
        messages: &[ChatMessage],
        end: Option<Instant>,
    ) -> Result<ChatMessage, ModelError> {
        match end {
            None => self.model.send_message(messages, &self.definitions).await,
            Some(end) => {
                let remaining = end.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(ModelError::Timeout("graph deadline exhausted".to_string()));
                }
                match timeout(remaining, self.model.send_message(messages, &self.definitions))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ModelError::Timeout(format!(
                        "no response within {:?}",
                        remaining
                    ))),
                }
            }
        }
    }

    async fn thread_lock(&self, thread_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(thread_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn compose_system_prompt(&self, state: &RuntimeState) -> String {
        let mut sections: Vec<String> = vec![self.system_prompt.clone()];

        if let Some(outline) = &state.outline {
            if let Some(system) = &outline.system {
                if !system.is_empty() {
                    sections.push(system.clone());
                }
            }
            match &outline.focus {
                Some(Focus::One(item)) if !item.is_empty() => {
                    sections.push(format!("Focus: {}", item));
                }
                Some(Focus::Many(items)) if !items.is_empty() => {
                    let bullets: Vec<String> =
                        items.iter().map(|item| format!("- {}", item)).collect();
                    sections.push(format!("Focus:\n{}", bullets.join("\n")));
                }
                _ => {}
            }
            if !outline.ordered_segments.is_empty() {
                sections.push(format!(
                    "Suggested context order: {}",
                    outline.ordered_segments.join(", ")
                ));
            }
        }

        if !state.active_skills.is_empty() {
            let start = state.active_skills.len().saturating_sub(6);
            let lines: Vec<String> = state.active_skills[start..]
                .iter()
                .map(|meta| {
                    let tags = if meta.tags.is_empty() {
                        String::new()
                    } else {
                        format!(" (tags: {})", meta.tags.join(", "))
                    };
                    if meta.description.is_empty() {
                        format!("- {}{}", meta.name, tags)
                    } else {
                        format!("- {}{}: {}", meta.name, tags, meta.description)
                    }
                })
                .collect();
            sections.push(format!("Available skills:\n{}", lines.join("\n")));
        }

        sections.retain(|section| !section.is_empty());
        sections.join("\n\n")
    }
}

/// Replace a leading system turn with the composed prompt, or prepend one.
fn frame_system_turn(messages: &mut Vec<ChatMessage>, prompt: String) {
    match messages.first() {
        Some(first) if first.role == Role::System => messages[0] = ChatMessage::system(prompt),
        _ => messages.insert(0, ChatMessage::system(prompt)),
    }
}
