//! Conversation-level behaviour: history, titles, detail views and replay.

mod common;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use common::{code, datasets, text};
use sandpiper_core::domain::UpstreamFault;
use sandpiper_core::turn::{ModelBlock, ModelClient, ModelTurnProducer, TurnEvent, TurnStream};
use sandpiper_core::{ChatService, CoreError, EngineConfig, ScriptedModelClient};
use sandpiper_state::{
    ConversationId, ConversationStore, MemoryConversationStore, MessageRole, StorageError,
    DEFAULT_CONVERSATION_TITLE,
};

async fn drain(mut stream: TurnStream) -> Vec<TurnEvent> {
    let mut events = Vec::new();
    while let Some(event) = stream.recv().await {
        events.push(event);
    }
    events
}

fn conversation_of(events: &[TurnEvent]) -> ConversationId {
    match &events[0] {
        TurnEvent::Init { conversation_id } => ConversationId(conversation_id.clone()),
        other => panic!("first event must be init, got {other:?}"),
    }
}

fn artifact_id(events: &[TurnEvent]) -> String {
    events
        .iter()
        .find_map(|e| match e {
            TurnEvent::Artifact(a) => Some(a.id.clone()),
            _ => None,
        })
        .expect("turn produced an artifact")
}

fn build_service(model: Arc<dyn ModelClient>) -> (ChatService, Arc<MemoryConversationStore>) {
    let conversations = Arc::new(MemoryConversationStore::new());
    let service = ChatService::new(
        Arc::new(datasets()),
        conversations.clone(),
        model,
        EngineConfig::default(),
    );
    (service, conversations)
}

#[tokio::test]
async fn test_follow_up_prompt_carries_history() {
    let model = Arc::new(ScriptedModelClient::new(vec![
        vec![text("There are 5 pokemon.")],
        vec![text("Two of them.")],
    ]));
    let (service, conversations) = build_service(model.clone());

    let first = drain(service.start_turn(None, "How many pokemon?").await.unwrap()).await;
    let id = conversation_of(&first);
    drain(service.start_turn(Some(id.clone()), "Which are fire?").await.unwrap()).await;

    let prompts = model.prompts();
    assert_eq!(prompts[0], "How many pokemon?");
    assert_eq!(
        prompts[1],
        "User: How many pokemon?\n\nAssistant: There are 5 pokemon.\n\nUser: Which are fire?"
    );

    let messages = conversations.get_messages(&id).await.unwrap();
    let roles: Vec<_> = messages.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![
            MessageRole::User,
            MessageRole::Assistant,
            MessageRole::User,
            MessageRole::Assistant
        ]
    );
    assert_eq!(messages[3].content, "Two of them.");

    let record = conversations.get_conversation(&id).await.unwrap();
    assert_eq!(record.title, "How many pokemon?");
}

#[tokio::test]
async fn test_long_first_message_is_truncated_into_title() {
    let model = Arc::new(ScriptedModelClient::new(vec![vec![text("ok")]]));
    let (service, _) = build_service(model);

    let message = "a".repeat(100);
    let events = drain(service.start_turn(None, &message).await.unwrap()).await;
    let id = conversation_of(&events);

    let listed = service.list_conversations().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, id);
    assert_eq!(listed[0].title, format!("{}...", "a".repeat(77)));
    assert_ne!(listed[0].title, DEFAULT_CONVERSATION_TITLE);
}

#[tokio::test]
async fn test_unknown_conversation_is_rejected() {
    let model = Arc::new(ScriptedModelClient::new(Vec::new()));
    let (service, _) = build_service(model);

    let result = service
        .start_turn(Some(ConversationId("nope".into())), "hi")
        .await;
    assert!(matches!(
        result,
        Err(CoreError::Storage(StorageError::ConversationNotFound { .. }))
    ));
}

#[tokio::test]
async fn test_detail_view_strips_snapshots() {
    let model = Arc::new(ScriptedModelClient::new(vec![vec![code(
        "c1",
        "fetch('pokemon', columns=['name'], limit=2)",
    )]]));
    let (service, conversations) = build_service(model);

    let events = drain(service.start_turn(None, "names").await.unwrap()).await;
    let id = conversation_of(&events);
    let aid = artifact_id(&events);

    let stored = conversations.get_artifact(&aid).await.unwrap();
    assert!(stored.program_snapshot.is_some());

    let detail = service.get_conversation(&id).await.unwrap();
    assert_eq!(detail.messages.len(), 1);
    assert_eq!(detail.turns.len(), 1);
    assert_eq!(detail.turns[0].artifact_ids, vec![aid.clone()]);
    assert_eq!(detail.artifacts.len(), 1);
    assert!(detail.artifacts[0].program_snapshot.is_none());
    assert_eq!(detail.artifacts[0].snapshot_digest, stored.snapshot_digest);
    assert_eq!(detail.artifacts[0].result_kind, "table");

    let single = service.get_artifact(&aid).await.unwrap();
    assert!(single.program_snapshot.is_none());
    assert_eq!(single.result, Some(json!([{"name": "Bulbasaur"}, {"name": "Charmander"}])));
}

#[tokio::test]
async fn test_replay_reruns_stored_program() {
    let model = Arc::new(ScriptedModelClient::new(vec![vec![code(
        "c1",
        "print('counting')\ncount('pokemon')",
    )]]));
    let (service, conversations) = build_service(model);

    let events = drain(service.start_turn(None, "count").await.unwrap()).await;
    let id = conversation_of(&events);
    let aid = artifact_id(&events);

    let replayed = service.replay(&aid).await.unwrap();
    assert_eq!(replayed.artifact_id, aid);
    assert_eq!(replayed.result, Some(json!(5)));
    assert_eq!(replayed.result_kind, "scalar");
    assert_eq!(replayed.stdout, "counting\n");
    assert!(replayed.error.is_none());

    // Replay never adds artifacts.
    assert_eq!(conversations.list_artifacts(&id).await.unwrap().len(), 1);

    let mut tampered = conversations.get_artifact(&aid).await.unwrap();
    tampered.id = "tampered".into();
    tampered.snapshot_digest = Some("00".into());
    conversations.append_artifact(tampered).await.unwrap();
    assert!(matches!(
        service.replay("tampered").await,
        Err(CoreError::DigestMismatch { .. })
    ));

    let mut bare = conversations.get_artifact(&aid).await.unwrap();
    bare.id = "bare".into();
    bare.program_snapshot = None;
    bare.snapshot_digest = None;
    conversations.append_artifact(bare).await.unwrap();
    assert_eq!(service.replay("bare").await.unwrap().result, Some(json!(5)));

    assert!(matches!(
        service.replay("missing").await,
        Err(CoreError::Storage(StorageError::ArtifactNotFound { .. }))
    ));
}

/// Model whose second turn loads whatever artifact id the test hands it.
struct LoadingModel {
    uid: Arc<Mutex<String>>,
    replies: Arc<Mutex<Vec<String>>>,
    turns: Mutex<usize>,
}

#[async_trait]
impl ModelClient for LoadingModel {
    async fn start_turn(&self, _prompt: &str) -> Result<Box<dyn ModelTurnProducer>, UpstreamFault> {
        let mut turns = self.turns.lock().unwrap();
        *turns += 1;
        let blocks = if *turns == 1 {
            vec![code("c1", "fetch('titanic', columns=['name', 'age'], order_by='age DESC', limit=3)")]
        } else {
            vec![
                ModelBlock::LoadResult {
                    id: "l1".into(),
                    uid: self.uid.lock().unwrap().clone(),
                },
                ModelBlock::LoadResult {
                    id: "l2".into(),
                    uid: "no-such-artifact".into(),
                },
            ]
        };
        Ok(Box::new(LoadingTurn {
            blocks: blocks.into(),
            replies: Arc::clone(&self.replies),
        }))
    }
}

struct LoadingTurn {
    blocks: VecDeque<ModelBlock>,
    replies: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl ModelTurnProducer for LoadingTurn {
    async fn next_block(&mut self) -> Result<ModelBlock, UpstreamFault> {
        Ok(self.blocks.pop_front().unwrap_or(ModelBlock::End))
    }

    async fn submit_tool_result(&mut self, _call_id: &str, content: String) -> Result<(), UpstreamFault> {
        self.replies.lock().unwrap().push(content);
        Ok(())
    }
}

#[tokio::test]
async fn test_load_result_renders_earlier_artifact() {
    let uid = Arc::new(Mutex::new(String::new()));
    let replies = Arc::new(Mutex::new(Vec::new()));
    let model = Arc::new(LoadingModel {
        uid: Arc::clone(&uid),
        replies: Arc::clone(&replies),
        turns: Mutex::new(0),
    });
    let (service, _) = build_service(model);

    let first = drain(service.start_turn(None, "oldest").await.unwrap()).await;
    let id = conversation_of(&first);
    *uid.lock().unwrap() = artifact_id(&first);

    let second = drain(service.start_turn(Some(id), "show them").await.unwrap()).await;
    let statuses: Vec<_> = second
        .iter()
        .filter_map(|e| match e {
            TurnEvent::Status(s) => Some(s.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(
        statuses,
        vec![
            "Starting analysis...",
            "Agent is thinking...",
            "Loading result data...",
            "Loading result data..."
        ]
    );

    let replies = replies.lock().unwrap();
    assert_eq!(replies.len(), 3);
    assert_eq!(
        replies[1],
        "name | age\n--- | ---\nCumings | 38\nFutrelle | 35\nAllen | 35"
    );
    assert_eq!(replies[2], "Error: No result found for UID no-such-artifact");
}
