use async_trait::async_trait;
use quadracode::chat::{ChatMessage, Role};
use quadracode::checkpointer::{Checkpointer, MemoryCheckpointer};
use quadracode::graph::{
    build_graph, Focus, GraphConfig, PromptOutline, RuntimeState, SkillMetadata,
};
use quadracode::model::{ModelClient, ModelError, ToolCall, ToolDefinition};
use quadracode::tools::{RuntimeTool, ToolError};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Model that replays a fixed script and records every message list it saw.
struct ScriptedModel {
    script: Mutex<VecDeque<ChatMessage>>,
    seen: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedModel {
    fn new(script: Vec<ChatMessage>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn seen(&self) -> Vec<Vec<ChatMessage>> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn send_message(
        &self,
        messages: &[ChatMessage],
        _tools: &[ToolDefinition],
    ) -> Result<ChatMessage, ModelError> {
        self.seen.lock().unwrap().push(messages.to_vec());
        Ok(self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| ChatMessage::ai("done")))
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

/// Model that always asks for one more `echo` call.
struct LoopingModel;

#[async_trait]
impl ModelClient for LoopingModel {
    async fn send_message(
        &self,
        _messages: &[ChatMessage],
        _tools: &[ToolDefinition],
    ) -> Result<ChatMessage, ModelError> {
        Ok(ChatMessage::ai_with_tool_calls("", vec![echo_call("again")]))
    }

    fn model_name(&self) -> &str {
        "looping"
    }
}

struct SlowModel {
    delay: Duration,
}

#[async_trait]
impl ModelClient for SlowModel {
    async fn send_message(
        &self,
        _messages: &[ChatMessage],
        _tools: &[ToolDefinition],
    ) -> Result<ChatMessage, ModelError> {
        tokio::time::sleep(self.delay).await;
        Ok(ChatMessage::ai("too late"))
    }

    fn model_name(&self) -> &str {
        "slow"
    }
}

struct FailingModel;

#[async_trait]
impl ModelClient for FailingModel {
    async fn send_message(
        &self,
        _messages: &[ChatMessage],
        _tools: &[ToolDefinition],
    ) -> Result<ChatMessage, ModelError> {
        Err(ModelError::Provider("upstream 500".to_string()))
    }

    fn model_name(&self) -> &str {
        "failing"
    }
}

/// Tool that returns its `text` argument.
struct EchoTool;

#[async_trait]
impl RuntimeTool for EchoTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "echo".to_string(),
            description: "Echo the text argument back.".to_string(),
            parameters_schema: json!({
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"]
            }),
        }
    }

    async fn invoke(&self, args: Value) -> Result<String, ToolError> {
        args.get("text")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ToolError::InvalidParameters("text is required".to_string()))
    }
}

fn echo_call(text: &str) -> ToolCall {
    ToolCall {
        id: format!("call-{}", text),
        name: "echo".to_string(),
        args: json!({ "text": text }),
    }
}

fn roles(messages: &[ChatMessage]) -> Vec<Role> {
    messages.iter().map(|m| m.role).collect()
}

#[tokio::test]
async fn tool_loop_terminates_and_persists_the_full_turn_sequence() {
    let model = ScriptedModel::new(vec![
        ChatMessage::ai_with_tool_calls("", vec![echo_call("one")]),
        ChatMessage::ai_with_tool_calls("", vec![echo_call("two")]),
        ChatMessage::ai_with_tool_calls("", vec![echo_call("three")]),
        ChatMessage::ai("all done"),
    ]);
    let checkpointer = Arc::new(MemoryCheckpointer::new());
    let graph = build_graph("base prompt")
        .with_model(model.clone())
        .with_tool(Arc::new(EchoTool))
        .with_checkpointer(checkpointer.clone())
        .build()
        .unwrap();

    let state = RuntimeState::with_messages(vec![ChatMessage::human("echo three times")]);
    let outcome = graph
        .invoke(state, &GraphConfig::new("t1"))
        .await
        .unwrap();

    // New messages: three assistant+tool_call rounds, three tool results,
    // one closing assistant turn.
    assert_eq!(outcome.new_messages.len(), 7);
    assert_eq!(outcome.new_messages.last().unwrap().content, "all done");

    let persisted = checkpointer.get("t1").await.unwrap().unwrap();
    assert_eq!(
        roles(&persisted),
        vec![
            Role::System,
            Role::Human,
            Role::Ai,
            Role::Tool,
            Role::Ai,
            Role::Tool,
            Role::Ai,
            Role::Tool,
            Role::Ai,
        ]
    );
    assert_eq!(persisted[3].content, "one");
    assert_eq!(persisted[5].content, "two");
    assert_eq!(persisted[7].content, "three");
    assert_eq!(persisted[3].tool_call_id.as_deref(), Some("call-one"));
}

#[tokio::test]
async fn unknown_tool_calls_surface_as_error_turns() {
    let model = ScriptedModel::new(vec![
        ChatMessage::ai_with_tool_calls(
            "",
            vec![ToolCall {
                id: "call-1".to_string(),
                name: "bogus".to_string(),
                args: json!({}),
            }],
        ),
        ChatMessage::ai("recovered"),
    ]);
    let graph = build_graph("base")
        .with_model(model)
        .with_tool(Arc::new(EchoTool))
        .build()
        .unwrap();

    let outcome = graph
        .invoke(
            RuntimeState::with_messages(vec![ChatMessage::human("go")]),
            &GraphConfig::new("t1"),
        )
        .await
        .unwrap();

    let tool_turn = &outcome.new_messages[1];
    assert_eq!(tool_turn.role, Role::Tool);
    assert_eq!(tool_turn.content, "error: unknown tool bogus");
    // Control returned to the driver afterwards.
    assert_eq!(outcome.new_messages.last().unwrap().content, "recovered");
}

#[tokio::test]
async fn failing_tools_do_not_abort_the_invocation() {
    let model = ScriptedModel::new(vec![
        ChatMessage::ai_with_tool_calls(
            "",
            vec![ToolCall {
                id: "call-1".to_string(),
                name: "echo".to_string(),
                args: json!({"wrong": "shape"}),
            }],
        ),
        ChatMessage::ai("noted"),
    ]);
    let graph = build_graph("base")
        .with_model(model)
        .with_tool(Arc::new(EchoTool))
        .build()
        .unwrap();

    let outcome = graph
        .invoke(
            RuntimeState::with_messages(vec![ChatMessage::human("go")]),
            &GraphConfig::new("t1"),
        )
        .await
        .unwrap();

    assert!(outcome.new_messages[1].content.starts_with("error:"));
    assert_eq!(outcome.new_messages.last().unwrap().content, "noted");
}

#[tokio::test]
async fn cycle_cap_forces_an_end_with_an_error_turn() {
    let graph = build_graph("base")
        .with_model(Arc::new(LoopingModel))
        .with_tool(Arc::new(EchoTool))
        .with_max_tool_cycles(3)
        .build()
        .unwrap();

    let outcome = graph
        .invoke(
            RuntimeState::with_messages(vec![ChatMessage::human("loop forever")]),
            &GraphConfig::new("t1"),
        )
        .await
        .unwrap();

    let last = outcome.new_messages.last().unwrap();
    assert_eq!(last.role, Role::Ai);
    assert_eq!(last.content, "error: tool cycle limit of 3 exceeded");

    // Exactly three tool rounds ran before the cap tripped.
    let tool_turns = outcome
        .new_messages
        .iter()
        .filter(|m| m.role == Role::Tool)
        .count();
    assert_eq!(tool_turns, 3);
}

#[tokio::test]
async fn second_invocation_sees_prior_history() {
    let model = ScriptedModel::new(vec![
        ChatMessage::ai("first answer"),
        ChatMessage::ai("second answer"),
    ]);
    let graph = build_graph("base")
        .with_model(model.clone())
        .build()
        .unwrap();
    let config = GraphConfig::new("t1");

    graph
        .invoke(
            RuntimeState::with_messages(vec![ChatMessage::human("first")]),
            &config,
        )
        .await
        .unwrap();
    let outcome = graph
        .invoke(
            RuntimeState::with_messages(vec![ChatMessage::human("second")]),
            &config,
        )
        .await
        .unwrap();

    // The second result contains only the new assistant turn.
    assert_eq!(outcome.new_messages.len(), 1);
    assert_eq!(outcome.new_messages[0].content, "second answer");

    // But the model saw the whole thread: system, first, first answer, second.
    let seen = model.seen();
    let second_view = &seen[1];
    let contents: Vec<&str> = second_view.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(
        contents,
        vec!["base", "first", "first answer", "second"]
    );
}

#[tokio::test]
async fn framing_composes_outline_and_skill_sections() {
    let model = ScriptedModel::new(vec![ChatMessage::ai("ok")]);
    let graph = build_graph("base prompt")
        .with_model(model.clone())
        .with_pre_dispatch(Arc::new(|mut state: RuntimeState| {
            state.outline = Some(PromptOutline {
                system: Some("Follow the playbook.".to_string()),
                focus: Some(Focus::Many(vec!["tests".to_string(), "docs".to_string()])),
                ordered_segments: vec!["goal".to_string(), "context".to_string()],
            });
            state.active_skills = (1..=7)
                .map(|n| SkillMetadata {
                    name: format!("skill-{}", n),
                    description: format!("does thing {}", n),
                    tags: vec!["core".to_string()],
                })
                .collect();
            state
        }))
        .build()
        .unwrap();

    graph
        .invoke(
            RuntimeState::with_messages(vec![ChatMessage::human("go")]),
            &GraphConfig::new("t1"),
        )
        .await
        .unwrap();

    let seen = model.seen();
    let system = &seen[0][0];
    assert_eq!(system.role, Role::System);

    let sections: Vec<&str> = system.content.split("\n\n").collect();
    assert_eq!(sections[0], "base prompt");
    assert_eq!(sections[1], "Follow the playbook.");
    assert_eq!(sections[2], "Focus:\n- tests\n- docs");
    assert_eq!(sections[3], "Suggested context order: goal, context");
    // Only the last six skills are rendered.
    assert!(!sections[4].contains("skill-1:"));
    assert!(sections[4].starts_with("Available skills:\n- skill-2 (tags: core): does thing 2"));
    assert!(sections[4].ends_with("- skill-7 (tags: core): does thing 7"));
}

#[tokio::test]
async fn single_focus_renders_inline() {
    let model = ScriptedModel::new(vec![ChatMessage::ai("ok")]);
    let graph = build_graph("base")
        .with_model(model.clone())
        .with_pre_dispatch(Arc::new(|mut state: RuntimeState| {
            state.outline = Some(PromptOutline {
                system: None,
                focus: Some(Focus::One("ship it".to_string())),
                ordered_segments: Vec::new(),
            });
            state
        }))
        .build()
        .unwrap();

    graph
        .invoke(
            RuntimeState::with_messages(vec![ChatMessage::human("go")]),
            &GraphConfig::new("t1"),
        )
        .await
        .unwrap();

    assert_eq!(model.seen()[0][0].content, "base\n\nFocus: ship it");
}

#[tokio::test]
async fn an_existing_system_turn_is_replaced_not_duplicated() {
    let model = ScriptedModel::new(vec![ChatMessage::ai("ok")]);
    let graph = build_graph("the real prompt")
        .with_model(model.clone())
        .build()
        .unwrap();

    let state = RuntimeState::with_messages(vec![
        ChatMessage::system("stale prompt from an imported history"),
        ChatMessage::human("go"),
    ]);
    graph
        .invoke(state, &GraphConfig::new("t1"))
        .await
        .unwrap();

    let seen = model.seen();
    let system_turns: Vec<_> = seen[0]
        .iter()
        .filter(|m| m.role == Role::System)
        .collect();
    assert_eq!(system_turns.len(), 1);
    assert_eq!(system_turns[0].content, "the real prompt");
}

#[tokio::test]
async fn deadline_appends_an_error_turn_and_still_persists() {
    let checkpointer = Arc::new(MemoryCheckpointer::new());
    let graph = build_graph("base")
        .with_model(Arc::new(SlowModel {
            delay: Duration::from_millis(250),
        }))
        .with_checkpointer(checkpointer.clone())
        .with_deadline(Duration::from_millis(50))
        .build()
        .unwrap();

    let outcome = graph
        .invoke(
            RuntimeState::with_messages(vec![ChatMessage::human("hurry")]),
            &GraphConfig::new("t1"),
        )
        .await
        .unwrap();

    let last = outcome.new_messages.last().unwrap();
    assert_eq!(last.role, Role::Ai);
    assert!(last.content.starts_with("error: model call timed out"));

    // The error marker is part of the persisted thread.
    let persisted = checkpointer.get("t1").await.unwrap().unwrap();
    assert_eq!(persisted.last().unwrap().content, last.content);
}

#[tokio::test]
async fn model_errors_append_an_error_turn() {
    let graph = build_graph("base")
        .with_model(Arc::new(FailingModel))
        .build()
        .unwrap();

    let outcome = graph
        .invoke(
            RuntimeState::with_messages(vec![ChatMessage::human("go")]),
            &GraphConfig::new("t1"),
        )
        .await
        .unwrap();

    assert_eq!(outcome.new_messages.len(), 1);
    assert!(outcome.new_messages[0]
        .content
        .starts_with("error: model call failed"));
}

#[tokio::test]
async fn tool_observer_sees_every_result() {
    let observed: Arc<Mutex<Vec<(String, String)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = observed.clone();

    let model = ScriptedModel::new(vec![
        ChatMessage::ai_with_tool_calls("", vec![echo_call("one"), echo_call("two")]),
        ChatMessage::ai("done"),
    ]);
    let graph = build_graph("base")
        .with_model(model)
        .with_tool(Arc::new(EchoTool))
        .with_tool_observer(Arc::new(move |name: &str, content: &str| {
            sink.lock()
                .unwrap()
                .push((name.to_string(), content.to_string()));
        }))
        .build()
        .unwrap();

    graph
        .invoke(
            RuntimeState::with_messages(vec![ChatMessage::human("go")]),
            &GraphConfig::new("t1"),
        )
        .await
        .unwrap();

    let observed = observed.lock().unwrap();
    assert_eq!(observed.len(), 2);
    assert_eq!(observed[0], ("echo".to_string(), "one".to_string()));
    assert_eq!(observed[1], ("echo".to_string(), "two".to_string()));
}

#[tokio::test]
async fn concurrent_invocations_on_one_thread_serialize() {
    let model = ScriptedModel::new(vec![
        ChatMessage::ai("answer a"),
        ChatMessage::ai("answer b"),
    ]);
    let checkpointer = Arc::new(MemoryCheckpointer::new());
    let graph = Arc::new(
        build_graph("base")
            .with_model(model)
            .with_checkpointer(checkpointer.clone())
            .build()
            .unwrap(),
    );

    let g1 = graph.clone();
    let g2 = graph.clone();
    let a = tokio::spawn(async move {
        g1.invoke(
            RuntimeState::with_messages(vec![ChatMessage::human("a")]),
            &GraphConfig::new("t1"),
        )
        .await
        .unwrap()
    });
    let b = tokio::spawn(async move {
        g2.invoke(
            RuntimeState::with_messages(vec![ChatMessage::human("b")]),
            &GraphConfig::new("t1"),
        )
        .await
        .unwrap()
    });
    a.await.unwrap();
    b.await.unwrap();

    // Both invocations landed: system + 2 human + 2 assistant turns, no lost
    // update.
    let persisted = checkpointer.get("t1").await.unwrap().unwrap();
    assert_eq!(persisted.len(), 5);
    let humans = persisted.iter().filter(|m| m.role == Role::Human).count();
    assert_eq!(humans, 2);
}
