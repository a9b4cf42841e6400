//! Shared fixtures for sandpiper-core integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::Notify;

use sandpiper_core::domain::UpstreamFault;
use sandpiper_core::turn::{ModelBlock, ModelClient, ModelTurnProducer};
use sandpiper_state::{
    loader::table_from_objects, ColumnInfo, EqualityFilter, FetchQuery, MemoryTableStore, Row,
    StorageError, StorageResult, TableStore,
};

fn objects(rows: Value) -> Vec<Map<String, Value>> {
    rows.as_array()
        .unwrap()
        .iter()
        .map(|r| r.as_object().unwrap().clone())
        .collect()
}

/// `titanic` (8 rows, 6 survivors) and `pokemon` (5 rows, 2 fire types).
pub fn datasets() -> MemoryTableStore {
    let titanic = table_from_objects(
        "titanic",
        objects(json!([
            {"name": "Braund", "age": 22, "survived": 0, "fare": 7.25},
            {"name": "Cumings", "age": 38, "survived": 1, "fare": 71.28},
            {"name": "Heikkinen", "age": 26, "survived": 1, "fare": 7.92},
            {"name": "Futrelle", "age": 35, "survived": 1, "fare": 53.1},
            {"name": "Allen", "age": 35, "survived": 0, "fare": 8.05},
            {"name": "Moran", "age": null, "survived": 1, "fare": 8.46},
            {"name": "Johnson", "age": 27, "survived": 1, "fare": 11.13},
            {"name": "Nasser", "age": 14, "survived": 1, "fare": 30.07}
        ])),
    )
    .unwrap();
    let pokemon = table_from_objects(
        "pokemon",
        objects(json!([
            {"name": "Bulbasaur", "type1": "grass", "hp": 45},
            {"name": "Charmander", "type1": "fire", "hp": 39},
            {"name": "Squirtle", "type1": "water", "hp": 44},
            {"name": "Vulpix", "type1": "fire", "hp": 38},
            {"name": "Pikachu", "type1": "electric", "hp": 35}
        ])),
    )
    .unwrap();
    MemoryTableStore::new().with_table(titanic).with_table(pokemon)
}

/// Table store that counts every call reaching the backend.
#[derive(Default)]
pub struct RecordingStore {
    inner: MemoryTableStore,
    pub describes: AtomicUsize,
    pub counts: AtomicUsize,
    pub fetches: AtomicUsize,
}

impl RecordingStore {
    pub fn new(inner: MemoryTableStore) -> Self {
        Self {
            inner,
            ..Self::default()
        }
    }

    pub fn total(&self) -> usize {
        self.describes.load(Ordering::SeqCst)
            + self.counts.load(Ordering::SeqCst)
            + self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TableStore for RecordingStore {
    async fn table_names(&self) -> StorageResult<Vec<String>> {
        self.inner.table_names().await
    }

    async fn describe(&self, table: &str) -> StorageResult<Vec<ColumnInfo>> {
        self.describes.fetch_add(1, Ordering::SeqCst);
        self.inner.describe(table).await
    }

    async fn count(&self, table: &str, filter: &EqualityFilter) -> StorageResult<u64> {
        self.counts.fetch_add(1, Ordering::SeqCst);
        self.inner.count(table, filter).await
    }

    async fn fetch(&self, query: &FetchQuery) -> StorageResult<Vec<Row>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch(query).await
    }
}

/// Table store whose backend is down.
pub struct UnavailableStore;

#[async_trait]
impl TableStore for UnavailableStore {
    async fn table_names(&self) -> StorageResult<Vec<String>> {
        Err(StorageError::Backend("connection refused".into()))
    }

    async fn describe(&self, _table: &str) -> StorageResult<Vec<ColumnInfo>> {
        Err(StorageError::Backend("connection refused".into()))
    }

    async fn count(&self, _table: &str, _filter: &EqualityFilter) -> StorageResult<u64> {
        Err(StorageError::Backend("connection refused".into()))
    }

    async fn fetch(&self, _query: &FetchQuery) -> StorageResult<Vec<Row>> {
        Err(StorageError::Backend("connection refused".into()))
    }
}

/// Table store that accepts every call and never answers.
pub struct HangingStore;

#[async_trait]
impl TableStore for HangingStore {
    async fn table_names(&self) -> StorageResult<Vec<String>> {
        std::future::pending().await
    }

    async fn describe(&self, _table: &str) -> StorageResult<Vec<ColumnInfo>> {
        std::future::pending().await
    }

    async fn count(&self, _table: &str, _filter: &EqualityFilter) -> StorageResult<u64> {
        std::future::pending().await
    }

    async fn fetch(&self, _query: &FetchQuery) -> StorageResult<Vec<Row>> {
        std::future::pending().await
    }
}

/// Model client that holds `start_turn` until the gate is opened, then
/// plays `blocks`. After the blocks run out it waits forever, so a test can
/// cancel a turn that is parked on the model.
pub struct GatedModel {
    pub gate: Arc<Notify>,
    pub started: Arc<Notify>,
    blocks: Vec<ModelBlock>,
}

impl GatedModel {
    pub fn new(blocks: Vec<ModelBlock>) -> Self {
        Self {
            gate: Arc::new(Notify::new()),
            started: Arc::new(Notify::new()),
            blocks,
        }
    }
}

#[async_trait]
impl ModelClient for GatedModel {
    async fn start_turn(&self, _prompt: &str) -> Result<Box<dyn ModelTurnProducer>, UpstreamFault> {
        self.started.notify_one();
        self.gate.notified().await;
        Ok(Box::new(ParkingTurn {
            blocks: self.blocks.clone().into(),
        }))
    }
}

struct ParkingTurn {
    blocks: std::collections::VecDeque<ModelBlock>,
}

#[async_trait]
impl ModelTurnProducer for ParkingTurn {
    async fn next_block(&mut self) -> Result<ModelBlock, UpstreamFault> {
        match self.blocks.pop_front() {
            Some(block) => Ok(block),
            None => std::future::pending().await,
        }
    }

    async fn submit_tool_result(&mut self, _call_id: &str, _content: String) -> Result<(), UpstreamFault> {
        Ok(())
    }
}

pub fn text(t: &str) -> ModelBlock {
    ModelBlock::Text { text: t.into() }
}

pub fn code(id: &str, source: &str) -> ModelBlock {
    ModelBlock::Code {
        id: id.into(),
        code: source.into(),
    }
}
