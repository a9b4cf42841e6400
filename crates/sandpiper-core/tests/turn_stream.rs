//! Event ordering, failure handling and cancellation of streamed turns.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tracing::Level;

use common::{code, datasets, text, GatedModel, HangingStore, UnavailableStore};
use sandpiper_core::turn::{ModelClient, TurnEvent, TurnStream};
use sandpiper_core::{ChatService, EngineConfig, ScriptedModelClient};
use sandpiper_state::{
    ConversationId, ConversationStore, MemoryConversationStore, TableStore, TurnStatus,
};

struct Harness {
    service: ChatService,
    conversations: Arc<MemoryConversationStore>,
}

fn harness(store: Arc<dyn TableStore>, model: Arc<dyn ModelClient>, config: EngineConfig) -> Harness {
    let conversations = Arc::new(MemoryConversationStore::new());
    let service = ChatService::new(store, conversations.clone(), model, config);
    Harness {
        service,
        conversations,
    }
}

async fn drain(mut stream: TurnStream) -> Vec<TurnEvent> {
    let mut events = Vec::new();
    while let Some(event) = stream.recv().await {
        events.push(event);
    }
    events
}

fn kinds(events: &[TurnEvent]) -> Vec<&'static str> {
    events.iter().map(TurnEvent::kind).collect()
}

fn statuses(events: &[TurnEvent]) -> Vec<&str> {
    events
        .iter()
        .filter_map(|e| match e {
            TurnEvent::Status(s) => Some(s.as_str()),
            _ => None,
        })
        .collect()
}

fn conversation_of(events: &[TurnEvent]) -> ConversationId {
    match &events[0] {
        TurnEvent::Init { conversation_id } => ConversationId(conversation_id.clone()),
        other => panic!("first event must be init, got {other:?}"),
    }
}

#[tokio::test]
async fn test_first_events_arrive_before_model_responds() {
    sandpiper_core::init_tracing(false, Level::DEBUG);
    let model = Arc::new(GatedModel::new(vec![text("hello")]));
    let gate = Arc::clone(&model.gate);
    let h = harness(Arc::new(datasets()), model, EngineConfig::default());

    let mut stream = h.service.start_turn(None, "hi").await.unwrap();
    assert!(matches!(stream.recv().await, Some(TurnEvent::Init { .. })));
    assert_eq!(
        stream.recv().await,
        Some(TurnEvent::Status("Starting analysis...".into()))
    );

    gate.notify_one();
    assert_eq!(
        stream.recv().await,
        Some(TurnEvent::Status("Agent is thinking...".into()))
    );
    assert_eq!(stream.recv().await, Some(TurnEvent::Text("hello".into())));
    stream.cancel_and_wait().await;
}

#[tokio::test]
async fn test_scripted_turn_event_order() {
    let model = Arc::new(ScriptedModelClient::new(vec![vec![
        text("Let me count the fire types."),
        code("c1", "count('pokemon', where={'type1': 'fire'})"),
        text("There are 2."),
    ]]));
    let h = harness(Arc::new(datasets()), model.clone(), EngineConfig::default());

    let events = drain(h.service.start_turn(None, "How many fire pokemon?").await.unwrap()).await;

    assert_eq!(
        kinds(&events),
        vec!["init", "status", "status", "text", "code", "status", "artifact", "status", "text", "done"]
    );
    assert_eq!(
        statuses(&events),
        vec![
            "Starting analysis...",
            "Agent is thinking...",
            "Running code in sandbox...",
            "Analyzing results..."
        ]
    );

    let TurnEvent::Artifact(artifact) = &events[6] else { unreachable!() };
    assert_eq!(artifact.result_kind, "scalar");
    assert_eq!(artifact.result, Some(serde_json::json!(2)));

    let TurnEvent::Done { artifact_ids, timing } = events.last().unwrap() else {
        unreachable!()
    };
    assert_eq!(artifact_ids, &vec![artifact.id.clone()]);
    assert_eq!(timing.executions, 1);
    assert_eq!(timing.model_steps, 4);

    let results = model.tool_results();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0, "c1");
    assert!(results[0].1.contains("Value: 2"));

    let id = conversation_of(&events);
    let turns = h.conversations.list_turns(&id).await.unwrap();
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].status, TurnStatus::Completed);
    assert_eq!(h.conversations.list_artifacts(&id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_faulted_execution_lets_model_retry() {
    let model = Arc::new(ScriptedModelClient::new(vec![vec![
        code("c1", "rows = fetch('titanic')\nrows[0]['age'] / 0"),
        code("c2", "count('titanic')"),
    ]]));
    let h = harness(Arc::new(datasets()), model.clone(), EngineConfig::default());

    let events = drain(h.service.start_turn(None, "q").await.unwrap()).await;

    assert_eq!(
        statuses(&events),
        vec![
            "Starting analysis...",
            "Agent is thinking...",
            "Running code in sandbox...",
            "Code failed, agent may retry...",
            "Running code in sandbox...",
            "Analyzing results..."
        ]
    );
    let artifacts: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            TurnEvent::Artifact(a) => Some(a),
            _ => None,
        })
        .collect();
    assert_eq!(artifacts.len(), 2);
    assert!(artifacts[0].error.as_deref().unwrap().contains("ZeroDivisionError"));
    assert_eq!(artifacts[1].result, Some(serde_json::json!(8)));
    assert!(events.last().unwrap().is_terminal());
    assert!(model.tool_results()[0].1.starts_with("Error: "));
}

#[tokio::test]
async fn test_runaway_program_times_out_and_turn_finishes() {
    let model = Arc::new(ScriptedModelClient::new(vec![vec![
        code("c1", "n = 0\nwhile True:\n    n += 1"),
        text("That took too long."),
    ]]));
    let mut config = EngineConfig::default();
    config.limits.max_duration_ms = 50;
    let h = harness(Arc::new(datasets()), model, config);

    let events = tokio::time::timeout(
        Duration::from_secs(10),
        drain(h.service.start_turn(None, "loop").await.unwrap()),
    )
    .await
    .expect("turn should finish");

    let artifact = events
        .iter()
        .find_map(|e| match e {
            TurnEvent::Artifact(a) => Some(a),
            _ => None,
        })
        .unwrap();
    assert_eq!(
        artifact.error.as_deref(),
        Some("Resource limit exceeded: time limit exceeded")
    );
    assert_eq!(artifact.result_kind, "absent");
    assert_eq!(kinds(&events)[events.len() - 2..], ["text", "done"]);
}

#[tokio::test]
async fn test_store_outage_aborts_turn() {
    let model = Arc::new(ScriptedModelClient::new(vec![vec![
        code("c1", "tables()"),
        text("never shown"),
    ]]));
    let h = harness(Arc::new(UnavailableStore), model.clone(), EngineConfig::default());

    let events = drain(h.service.start_turn(None, "q").await.unwrap()).await;

    assert_eq!(
        kinds(&events),
        vec!["init", "status", "status", "code", "status", "artifact", "error", "done"]
    );
    let TurnEvent::Error(message) = &events[6] else { unreachable!() };
    assert!(message.starts_with("data store unavailable"));
    assert!(model.tool_results().is_empty());

    let id = conversation_of(&events);
    let turns = h.conversations.list_turns(&id).await.unwrap();
    assert_eq!(turns[0].status, TurnStatus::Failed);
    assert_eq!(turns[0].artifact_ids.len(), 1);
}

#[tokio::test]
async fn test_unresponsive_store_still_ends_turn_with_done() {
    let model = Arc::new(ScriptedModelClient::new(vec![vec![
        code("c1", "count('titanic')"),
        text("never shown"),
    ]]));
    let config = EngineConfig {
        max_dispatch_ms: 50,
        ..EngineConfig::default()
    };
    let h = harness(Arc::new(HangingStore), model.clone(), config);

    let stream = h.service.start_turn(None, "how many passengers?").await.unwrap();
    let events = tokio::time::timeout(Duration::from_secs(5), drain(stream))
        .await
        .expect("turn must finish");

    assert_eq!(events.last().map(TurnEvent::kind), Some("done"));
    let message = events
        .iter()
        .find_map(|e| match e {
            TurnEvent::Error(m) => Some(m.as_str()),
            _ => None,
        })
        .expect("error event");
    assert!(message.contains("count() timed out after 50 ms"), "{message}");
    assert!(model.tool_results().is_empty());

    let id = conversation_of(&events);
    let turns = h.conversations.list_turns(&id).await.unwrap();
    assert_eq!(turns[0].status, TurnStatus::Failed);
}

#[tokio::test]
async fn test_model_outage_reports_error_then_done() {
    let model = Arc::new(ScriptedModelClient::new(Vec::new()));
    let h = harness(Arc::new(datasets()), model, EngineConfig::default());

    let events = drain(h.service.start_turn(None, "q").await.unwrap()).await;

    assert_eq!(kinds(&events), vec!["init", "status", "error", "done"]);
    assert_eq!(
        events[2],
        TurnEvent::Error("model unavailable: no scripted turn left".into())
    );
}

#[tokio::test]
async fn test_step_limit_ends_turn() {
    let model = Arc::new(ScriptedModelClient::new(vec![vec![
        text("one"),
        text("two"),
        text("three"),
    ]]));
    let config = EngineConfig {
        max_model_steps: 2,
        ..EngineConfig::default()
    };
    let h = harness(Arc::new(datasets()), model, config);

    let events = drain(h.service.start_turn(None, "q").await.unwrap()).await;

    assert_eq!(
        kinds(&events),
        vec!["init", "status", "status", "text", "text", "status", "done"]
    );
    assert_eq!(
        events[5],
        TurnEvent::Status("Reached the step limit, finishing up...".into())
    );
}

#[tokio::test]
async fn test_cancel_mid_turn_stops_events_and_keeps_artifacts() {
    let model = Arc::new(GatedModel::new(vec![code("c1", "count('pokemon')")]));
    model.gate.notify_one();
    let h = harness(Arc::new(datasets()), model, EngineConfig::default());

    let mut stream = h.service.start_turn(None, "q").await.unwrap();
    let mut seen = Vec::new();
    while let Some(event) = stream.recv().await {
        let analyzing = event == TurnEvent::Status("Analyzing results...".into());
        seen.push(event);
        if analyzing {
            break;
        }
    }
    let id = conversation_of(&seen);

    stream.cancel();
    assert_eq!(stream.recv().await, None);

    let turns = h.conversations.list_turns(&id).await.unwrap();
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].status, TurnStatus::Cancelled);
    let artifacts = h.conversations.list_artifacts(&id).await.unwrap();
    assert_eq!(artifacts.len(), 1);
    assert_eq!(turns[0].artifact_ids, vec![artifacts[0].id.clone()]);

    let messages = h.conversations.get_messages(&id).await.unwrap();
    assert_eq!(messages.len(), 1);
}

#[tokio::test]
async fn test_dropping_stream_cancels_turn() {
    let model = Arc::new(GatedModel::new(Vec::new()));
    let started = Arc::clone(&model.started);
    let h = harness(Arc::new(datasets()), model, EngineConfig::default());

    let stream = h.service.start_turn(None, "q").await.unwrap();
    started.notified().await;
    let token = stream.cancellation_token();
    drop(stream);
    assert!(token.is_cancelled());
}
