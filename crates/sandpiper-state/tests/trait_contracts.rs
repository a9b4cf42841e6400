//! Trait contract tests for ConversationStore.
//!
//! Each contract is written once against `&dyn ConversationStore` and run
//! against both the in-memory fake and the SurrealDB implementation.

use chrono::Utc;
use sandpiper_state::storage_traits::*;
use sandpiper_state::{MemoryConversationStore, StorageError, SurrealConversationStore};

fn sample_artifact(cid: &ConversationId, turn: &str, seq: u64) -> ArtifactRecord {
    ArtifactRecord {
        id: uuid::Uuid::new_v4().to_string(),
        conversation_id: cid.clone(),
        turn_id: turn.to_string(),
        seq,
        code: "count(\"titanic\")".to_string(),
        result: Some(serde_json::json!(891)),
        result_kind: "scalar".to_string(),
        error: None,
        stdout: String::new(),
        timing: serde_json::json!({"compile_ms": 0, "run_ms": 1}),
        program_snapshot: Some(vec![0, 1, 2, 255]),
        snapshot_digest: Some("abc".to_string()),
        created_at: Utc::now(),
    }
}

async fn create_and_get(store: &dyn ConversationStore) {
    let conv = store.create_conversation("first").await.unwrap();
    let fetched = store.get_conversation(&conv.id).await.unwrap();
    assert_eq!(fetched.id, conv.id);
    assert_eq!(fetched.title, "first");
}

async fn missing_conversation(store: &dyn ConversationStore) {
    let err = store
        .get_conversation(&ConversationId("nope".into()))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::ConversationNotFound { .. }));

    let err = store
        .add_message(&ConversationId("nope".into()), MessageRole::User, "hi")
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::ConversationNotFound { .. }));
}

async fn messages_in_order(store: &dyn ConversationStore) {
    let conv = store.create_conversation("chat").await.unwrap();
    store
        .add_message(&conv.id, MessageRole::User, "how many rows?")
        .await
        .unwrap();
    store
        .add_message(&conv.id, MessageRole::Assistant, "891")
        .await
        .unwrap();
    store
        .add_message(&conv.id, MessageRole::User, "thanks")
        .await
        .unwrap();

    let messages = store.get_messages(&conv.id).await.unwrap();
    let contents: Vec<_> = messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["how many rows?", "891", "thanks"]);
    assert_eq!(messages[1].role, MessageRole::Assistant);
}

async fn title_update(store: &dyn ConversationStore) {
    let conv = store
        .create_conversation(DEFAULT_CONVERSATION_TITLE)
        .await
        .unwrap();
    store.update_title(&conv.id, "Survival by class").await.unwrap();
    let fetched = store.get_conversation(&conv.id).await.unwrap();
    assert_eq!(fetched.title, "Survival by class");
}

async fn artifacts_round_trip(store: &dyn ConversationStore) {
    let conv = store.create_conversation("a").await.unwrap();
    let first = sample_artifact(&conv.id, "turn-1", 0);
    let second = sample_artifact(&conv.id, "turn-1", 1);
    store.append_artifact(first.clone()).await.unwrap();
    store.append_artifact(second.clone()).await.unwrap();

    let fetched = store.get_artifact(&first.id).await.unwrap();
    assert_eq!(fetched.code, first.code);
    assert_eq!(fetched.result, first.result);
    assert_eq!(fetched.program_snapshot, first.program_snapshot);

    let listed = store.list_artifacts(&conv.id).await.unwrap();
    let ids: Vec<_> = listed.iter().map(|a| a.id.clone()).collect();
    assert_eq!(ids, vec![first.id, second.id]);
}

async fn artifact_missing(store: &dyn ConversationStore) {
    let err = store.get_artifact("missing").await.unwrap_err();
    assert!(matches!(err, StorageError::ArtifactNotFound { .. }));
}

async fn artifact_requires_conversation(store: &dyn ConversationStore) {
    let orphan = sample_artifact(&ConversationId("ghost".into()), "t", 0);
    let err = store.append_artifact(orphan).await.unwrap_err();
    assert!(matches!(err, StorageError::ConversationNotFound { .. }));
}

async fn turns_round_trip(store: &dyn ConversationStore) {
    let conv = store.create_conversation("t").await.unwrap();
    let turn = TurnRecord {
        turn_id: "turn-1".into(),
        conversation_id: conv.id.clone(),
        status: TurnStatus::Completed,
        artifact_ids: vec!["a1".into()],
        timing: serde_json::json!({"total_ms": 12, "turns": 1}),
        created_at: Utc::now(),
    };
    store.append_turn(turn).await.unwrap();

    let turns = store.list_turns(&conv.id).await.unwrap();
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].status, TurnStatus::Completed);
    assert_eq!(turns[0].timing["total_ms"], 12);
}

async fn list_most_recent_first(store: &dyn ConversationStore) {
    let older = store.create_conversation("older").await.unwrap();
    let newer = store.create_conversation("newer").await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    store
        .add_message(&older.id, MessageRole::User, "bump")
        .await
        .unwrap();

    let listed = store.list_conversations().await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].id, older.id);
    assert_eq!(listed[1].id, newer.id);
}

macro_rules! contract_suite {
    ($module:ident, $make:expr) => {
        mod $module {
            use super::*;

            #[tokio::test]
            async fn create_and_get_conversation() {
                create_and_get(&$make).await;
            }

            #[tokio::test]
            async fn missing_conversation_is_not_found() {
                missing_conversation(&$make).await;
            }

            #[tokio::test]
            async fn messages_come_back_in_creation_order() {
                messages_in_order(&$make).await;
            }

            #[tokio::test]
            async fn update_title_persists() {
                title_update(&$make).await;
            }

            #[tokio::test]
            async fn artifacts_round_trip_in_order() {
                artifacts_round_trip(&$make).await;
            }

            #[tokio::test]
            async fn missing_artifact_is_not_found() {
                artifact_missing(&$make).await;
            }

            #[tokio::test]
            async fn artifact_needs_existing_conversation() {
                artifact_requires_conversation(&$make).await;
            }

            #[tokio::test]
            async fn turn_records_round_trip() {
                turns_round_trip(&$make).await;
            }

            #[tokio::test]
            async fn conversations_listed_most_recent_first() {
                list_most_recent_first(&$make).await;
            }
        }
    };
}

contract_suite!(memory_store, MemoryConversationStore::new());
contract_suite!(
    surreal_store,
    SurrealConversationStore::in_memory()
        .await
        .expect("in_memory() failed")
);
