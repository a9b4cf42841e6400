//! Sandboxed programs reaching data only through the four bounded operations.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use common::{datasets, RecordingStore, UnavailableStore};
use sandpiper_core::domain::{ClassifiedResult, ResultKind, UpstreamFault};
use sandpiper_core::lang::Limits;
use sandpiper_core::sandbox::{Dispatcher, Executor, FetchPolicy};
use sandpiper_state::TableStore;

fn executor(store: Arc<dyn TableStore>) -> Executor {
    let dispatcher = Arc::new(Dispatcher::new(store, FetchPolicy::default()));
    Executor::new(dispatcher, Limits::default())
}

#[tokio::test]
async fn test_fetch_returns_projected_filtered_rows() {
    sandpiper_core::init_tracing(false, Level::DEBUG);
    let store = Arc::new(RecordingStore::new(datasets()));
    let exec = executor(store.clone());

    let code = "fetch('titanic', columns=['age', 'survived'], where={'survived': 1}, limit=5)";
    let report = exec.execute(code, &CancellationToken::new()).await;

    assert!(report.upstream.is_none());
    assert!(report.artifact.error.is_none());
    assert_eq!(report.artifact.result_kind(), ResultKind::Table);
    let ClassifiedResult::Table { columns, rows } = &report.artifact.result else {
        panic!("expected table, got {:?}", report.artifact.result);
    };
    assert_eq!(columns, &vec!["age".to_string(), "survived".to_string()]);
    assert_eq!(rows.len(), 5);
    for row in rows {
        assert_eq!(row.len(), 2);
        assert_eq!(row.get("survived"), Some(&json!(1)));
    }
    assert_eq!(rows[0].get("age"), Some(&json!(38)));

    assert_eq!(store.describes.load(Ordering::SeqCst), 1);
    assert_eq!(store.fetches.load(Ordering::SeqCst), 1);
    let calls = &report.artifact.timing.calls;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].summary.kind, "rows");
    assert_eq!(calls[0].summary.rows, Some(5));
}

#[tokio::test]
async fn test_count_with_equality_filter_is_scalar() {
    let exec = executor(Arc::new(datasets()));
    let report = exec
        .execute("count('pokemon', where={'type1': 'fire'})", &CancellationToken::new())
        .await;

    assert_eq!(report.artifact.result, ClassifiedResult::Scalar(json!(2)));
    assert_eq!(report.artifact.result_kind(), ResultKind::Scalar);
}

#[tokio::test]
async fn test_comparator_filter_never_reaches_store() {
    let store = Arc::new(RecordingStore::new(datasets()));
    let exec = executor(store.clone());

    let report = exec
        .execute("fetch('titanic', where={'age': {'>': 30}})", &CancellationToken::new())
        .await;

    assert_eq!(store.total(), 0);
    assert!(report.artifact.error.is_none());
    let ClassifiedResult::KeyValue(map) = &report.artifact.result else {
        panic!("expected error mapping, got {:?}", report.artifact.result);
    };
    assert_eq!(map.get("error_kind"), Some(&json!("validation")));
    assert!(map["error"].as_str().unwrap().contains("age"));
    assert_eq!(report.artifact.timing.calls[0].summary.kind, "rejected");
}

#[tokio::test]
async fn test_program_can_branch_on_rejection() {
    let store = Arc::new(RecordingStore::new(datasets()));
    let exec = executor(store.clone());

    let code = r#"
rows = fetch('titanic', columns=['height'])
if isinstance(rows, dict) and 'error' in rows:
    rows = fetch('titanic', columns=['name'], limit=2)
[r['name'] for r in rows]
"#;
    let report = exec.execute(code, &CancellationToken::new()).await;

    assert!(report.artifact.error.is_none(), "{:?}", report.artifact.error);
    assert_eq!(
        report.artifact.result,
        ClassifiedResult::Other(json!(["Braund", "Cumings"]))
    );
    assert_eq!(store.fetches.load(Ordering::SeqCst), 1);
    assert_eq!(store.describes.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_unavailable_store_is_upstream_fault() {
    let exec = executor(Arc::new(UnavailableStore));
    let report = exec
        .execute("print('listing')\ntables()", &CancellationToken::new())
        .await;

    assert!(matches!(report.upstream, Some(UpstreamFault::Store(_))));
    assert!(report.artifact.is_faulted());
    assert_eq!(report.artifact.stdout, "listing\n");
    assert!(!report.cancelled);
}

#[tokio::test]
async fn test_fetch_limit_above_cap_is_rejected() {
    let store = Arc::new(RecordingStore::new(datasets()));
    let dispatcher = Arc::new(Dispatcher::new(store.clone(), FetchPolicy::new(3)));
    let exec = Executor::new(dispatcher, Limits::default());

    let report = exec
        .execute("fetch('pokemon', limit=4)", &CancellationToken::new())
        .await;
    assert_eq!(report.artifact.result_kind(), ResultKind::KeyValue);
    assert_eq!(store.total(), 0);

    let report = exec
        .execute("len(fetch('pokemon'))", &CancellationToken::new())
        .await;
    assert_eq!(report.artifact.result, ClassifiedResult::Scalar(json!(3)));
}

#[tokio::test]
async fn test_datasets_loaded_from_directory() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("people.json"),
        r#"[{"name": "Ada", "age": 36}, {"name": "Alan", "age": 41}]"#,
    )
    .unwrap();
    std::fs::write(
        dir.path().join("visits.ndjson"),
        "{\"person\": \"Ada\", \"city\": \"London\"}\n{\"person\": \"Alan\", \"city\": \"Manchester\"}\n",
    )
    .unwrap();

    let store = sandpiper_state::loader::load_dir(dir.path()).unwrap();
    let exec = executor(Arc::new(store));
    let report = exec
        .execute(
            "{'tables': tables(), 'people': count('people'), 'schema': [c['column_name'] for c in describe('visits')]}",
            &CancellationToken::new(),
        )
        .await;

    let ClassifiedResult::KeyValue(map) = &report.artifact.result else {
        panic!("expected mapping, got {:?}", report.artifact.result);
    };
    assert_eq!(map["tables"], json!(["people", "visits"]));
    assert_eq!(map["people"], json!(2));
    assert_eq!(map["schema"], json!(["person", "city"]));
}
