//! 会话端到端场景：脚本化模型 + 内存 / SQLite 检查点存储

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::mpsc;

use waypoint::checkpoint::{CheckpointStore, MemoryCheckpointStore, SqliteCheckpointStore};
use waypoint::config::AgentSection;
use waypoint::llm::ScriptedGateway;
use waypoint::memory::{AssistantMessage, Message, ToolRequest};
use waypoint::react::AgentEvent;
use waypoint::core::ToolError;
use waypoint::memory::Role;
use waypoint::tools::{builtin_registry, Tool};
use waypoint::{Agent, AgentError, NextAction};

fn agent_with(gateway: Arc<ScriptedGateway>, store: Arc<dyn CheckpointStore>) -> Agent {
    Agent::with_parts(
        gateway,
        store,
        builtin_registry().unwrap(),
        &AgentSection::default(),
    )
}

fn calc_call(id: &str, expression: &str) -> ToolRequest {
    ToolRequest::new(id, "calculator_tool", json!({ "expression": expression }))
}

#[tokio::test]
async fn tool_turn_writes_four_checkpoints() {
    let gateway = Arc::new(
        ScriptedGateway::new()
            .reply_tool_call("call_1", "calculator_tool", json!({"expression": "2 + 3"}))
            .reply_text("2 + 3 = 5"),
    );
    let agent = agent_with(gateway.clone(), Arc::new(MemoryCheckpointStore::new()));

    let outcome = agent.send("What is 2 + 3?", Some("calc"), None).await.unwrap();

    assert_eq!(outcome.answer, "2 + 3 = 5");
    let messages = &outcome.state.messages;
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[0], Message::user("What is 2 + 3?"));
    match &messages[2] {
        Message::Tool(result) => {
            assert_eq!(result.request_id, "call_1");
            assert_eq!(result.content, "5");
            assert!(!result.is_error);
        }
        other => panic!("expected tool result, got {other:?}"),
    }

    let summaries = agent.checkpoints("calc").await.unwrap();
    let shape: Vec<(u64, NextAction, usize)> = summaries
        .iter()
        .map(|s| (s.sequence_number, s.next_action, s.message_count))
        .collect();
    assert_eq!(
        shape,
        vec![
            (0, NextAction::RunModel, 1),
            (1, NextAction::RunTools, 2),
            (2, NextAction::RunModel, 3),
            (3, NextAction::Done, 4),
        ]
    );
    assert_eq!(gateway.call_count(), 2);
}

#[tokio::test]
async fn replay_from_run_tools_skips_the_model() {
    let gateway = Arc::new(
        ScriptedGateway::new()
            // 第一轮：先调用工具，再回答
            .reply_tool_call("call_1", "calculator_tool", json!({"expression": "6 * 7"}))
            .reply_text("42")
            // 第二轮：纯文本
            .reply_text("You asked about 6 * 7.")
            // replay 时工具执行后的那次模型调用
            .reply_text("Replayed: 42"),
    );
    let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
    let agent = agent_with(gateway.clone(), store.clone());

    agent.send("6 * 7?", Some("s"), None).await.unwrap();
    agent.send("What did I ask?", Some("s"), None).await.unwrap();
    assert_eq!(gateway.call_count(), 3);

    let before = agent.checkpoints("s").await.unwrap();
    let run_tools = before
        .iter()
        .find(|s| s.next_action == NextAction::RunTools)
        .unwrap()
        .sequence_number;
    let original = store.at("s", run_tools).await.unwrap().unwrap();

    let outcome = agent.replay("s", run_tools, None).await.unwrap();
    assert_eq!(outcome.answer, "Replayed: 42");

    // 工具先于模型执行：replay 的模型调用已能看到工具结果
    let calls = gateway.calls();
    assert_eq!(calls.len(), 4);
    let seen = &calls[3].transcript;
    assert_eq!(seen.len(), 3);
    assert!(matches!(&seen[2], Message::Tool(r) if r.content == "42"));

    // 旧检查点不变，新谱系接在最新序号之后
    let after = agent.checkpoints("s").await.unwrap();
    assert_eq!(&after[..before.len()], &before[..]);
    assert_eq!(store.at("s", run_tools).await.unwrap().unwrap(), original);
    let replay_head = &after[before.len()];
    assert_eq!(replay_head.sequence_number, before.len() as u64);
    assert_eq!(replay_head.next_action, NextAction::RunTools);
    assert_eq!(after.last().unwrap().next_action, NextAction::Done);

    // history 反映 replay 后的最新状态
    let history = agent.history("s").await.unwrap();
    assert_eq!(history, outcome.state.messages);
}

#[tokio::test]
async fn list_sessions_tracks_new_sessions() {
    let gateway = Arc::new(ScriptedGateway::echo());
    let agent = agent_with(gateway, Arc::new(MemoryCheckpointStore::new()));

    assert!(agent.list_sessions().await.unwrap().is_empty());

    let outcome = agent.send("hello", None, None).await.unwrap();
    assert_eq!(outcome.answer, "Echo: hello");

    let sessions = agent.list_sessions().await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert!(sessions.contains(&outcome.session_id));
}

#[tokio::test]
async fn failing_and_succeeding_tools_keep_request_order() {
    let gateway = Arc::new(
        ScriptedGateway::new()
            .reply(AssistantMessage::with_tool_requests(
                "",
                vec![calc_call("bad", "1 / 0"), calc_call("good", "2 + 3")],
            ))
            .reply_text("One failed, one worked."),
    );
    let agent = agent_with(gateway, Arc::new(MemoryCheckpointStore::new()));

    let outcome = agent.send("divide", Some("mixed"), None).await.unwrap();

    let results: Vec<(String, bool)> = outcome
        .state
        .messages
        .iter()
        .filter_map(|m| match m {
            Message::Tool(r) => Some((r.request_id.clone(), r.is_error)),
            _ => None,
        })
        .collect();
    assert_eq!(
        results,
        vec![("bad".to_string(), true), ("good".to_string(), false)]
    );
    match &outcome.state.messages[2] {
        Message::Tool(r) => assert!(r.content.starts_with("Error:")),
        other => panic!("expected tool result, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_tool_is_reported_to_the_model() {
    let gateway = Arc::new(
        ScriptedGateway::new()
            .reply_tool_call("x1", "no_such_tool", json!({}))
            .reply_text("Sorry."),
    );
    let agent = agent_with(gateway.clone(), Arc::new(MemoryCheckpointStore::new()));

    let outcome = agent.send("try it", Some("u"), None).await.unwrap();
    assert_eq!(outcome.answer, "Sorry.");
    match &gateway.calls()[1].transcript[2] {
        Message::Tool(r) => {
            assert!(r.is_error);
            assert_eq!(r.content, "Error: Unknown tool: no_such_tool");
        }
        other => panic!("expected tool result, got {other:?}"),
    }
}

#[tokio::test]
async fn history_is_a_pure_read() {
    let agent = agent_with(
        Arc::new(ScriptedGateway::echo()),
        Arc::new(MemoryCheckpointStore::new()),
    );
    agent.send("one", Some("h"), None).await.unwrap();

    let first = agent.history("h").await.unwrap();
    let second = agent.history("h").await.unwrap();
    assert_eq!(first, second);
    assert_eq!(agent.checkpoints("h").await.unwrap().len(), 2);
}

#[tokio::test]
async fn unknown_session_is_reported() {
    let agent = agent_with(
        Arc::new(ScriptedGateway::echo()),
        Arc::new(MemoryCheckpointStore::new()),
    );
    assert!(matches!(
        agent.history("ghost").await,
        Err(AgentError::SessionNotFound(_))
    ));
    assert!(matches!(
        agent.replay("ghost", 0, None).await,
        Err(AgentError::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn sqlite_session_survives_restart() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("checkpoints.db");

    let session_id = {
        let store = SqliteCheckpointStore::open(&db, 2).await.unwrap();
        let agent = agent_with(
            Arc::new(ScriptedGateway::new().reply_text("first answer")),
            Arc::new(store),
        );
        agent.send("first", None, None).await.unwrap().session_id
    };

    let store = SqliteCheckpointStore::open(&db, 2).await.unwrap();
    let gateway = Arc::new(ScriptedGateway::new().reply_text("second answer"));
    let agent = agent_with(gateway.clone(), Arc::new(store));

    let outcome = agent.send("second", Some(&session_id), None).await.unwrap();
    assert_eq!(outcome.state.messages.len(), 4);
    assert_eq!(gateway.calls()[0].transcript.len(), 3);
    assert_eq!(
        agent
            .checkpoints(&session_id)
            .await
            .unwrap()
            .last()
            .unwrap()
            .sequence_number,
        3
    );
}

#[tokio::test]
async fn events_report_progress() {
    let gateway = Arc::new(
        ScriptedGateway::new()
            .with_streaming(true)
            .reply_tool_call("c1", "calculator_tool", json!({"expression": "1 + 1"}))
            .reply_text("two it is"),
    );
    let agent = agent_with(gateway, Arc::new(MemoryCheckpointStore::new()));
    let (tx, mut rx) = mpsc::unbounded_channel();

    agent.send("1 + 1?", Some("ev"), Some(&tx)).await.unwrap();
    drop(tx);

    let mut deltas = String::new();
    let mut checkpointed = Vec::new();
    let mut tools = Vec::new();
    while let Some(event) = rx.recv().await {
        match event {
            AgentEvent::ModelDelta { text } => deltas.push_str(&text),
            AgentEvent::Checkpointed {
                sequence_number, ..
            } => checkpointed.push(sequence_number),
            AgentEvent::ToolFinished { tool, is_error, .. } => tools.push((tool, is_error)),
            _ => {}
        }
    }
    assert_eq!(deltas, "two it is");
    assert_eq!(checkpointed, vec![0, 1, 2, 3]);
    assert_eq!(tools, vec![("calculator_tool".to_string(), false)]);
}

/// 执行时间较长的工具，用于在 RunTools 阶段取消
struct SlowTool;

#[async_trait]
impl Tool for SlowTool {
    fn name(&self) -> &str {
        "slow_tool"
    }

    fn description(&self) -> &str {
        "Sleeps before answering"
    }

    async fn execute(&self, _args: serde_json::Value) -> Result<String, ToolError> {
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok("done".to_string())
    }
}

#[tokio::test]
async fn concurrent_sends_to_one_session_are_serialized() {
    let gateway = Arc::new(ScriptedGateway::echo().with_delay(Duration::from_millis(50)));
    let agent = agent_with(gateway.clone(), Arc::new(MemoryCheckpointStore::new()));

    let (first, second) = tokio::join!(
        agent.send("first", Some("shared"), None),
        agent.send("second", Some("shared"), None)
    );
    first.unwrap();
    second.unwrap();

    // 两轮互不交错：每轮的起始与 Done 检查点相邻，序号连续
    let shape: Vec<(u64, NextAction, usize)> = agent
        .checkpoints("shared")
        .await
        .unwrap()
        .iter()
        .map(|s| (s.sequence_number, s.next_action, s.message_count))
        .collect();
    assert_eq!(
        shape,
        vec![
            (0, NextAction::RunModel, 1),
            (1, NextAction::Done, 2),
            (2, NextAction::RunModel, 3),
            (3, NextAction::Done, 4),
        ]
    );

    let roles: Vec<Role> = agent
        .history("shared")
        .await
        .unwrap()
        .iter()
        .map(Message::role)
        .collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant, Role::User, Role::Assistant]);

    // 后一轮的模型调用看得到前一轮的完整对话
    let calls = gateway.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].transcript.len(), 3);
}

#[tokio::test]
async fn cancel_during_tools_leaves_a_resumable_checkpoint() {
    let gateway = Arc::new(
        ScriptedGateway::new()
            .reply_tool_call("call_1", "slow_tool", json!({}))
            .reply_text("finished"),
    );
    let mut registry = builtin_registry().unwrap();
    registry.register(SlowTool).unwrap();
    let agent = Agent::with_parts(
        gateway.clone(),
        Arc::new(MemoryCheckpointStore::new()),
        registry,
        &AgentSection::default(),
    );

    let (result, _) = tokio::join!(agent.send("go", Some("s"), None), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        agent.cancel();
    });
    assert!(matches!(result, Err(AgentError::Cancelled)));

    // 取消的工具批次不写检查点，最新状态仍是待执行的工具请求
    let summaries = agent.checkpoints("s").await.unwrap();
    let actions: Vec<NextAction> = summaries.iter().map(|s| s.next_action).collect();
    assert_eq!(actions, vec![NextAction::RunModel, NextAction::RunTools]);

    // 待执行工具时不能追加新消息，只能 replay
    let err = agent.send("next", Some("s"), None).await.unwrap_err();
    assert!(matches!(err, AgentError::InvalidState(_)));

    let outcome = agent.replay("s", 1, None).await.unwrap();
    assert_eq!(outcome.answer, "finished");
    assert!(matches!(&outcome.state.messages[2], Message::Tool(r) if r.content == "done"));
    assert_eq!(gateway.call_count(), 2);
}
