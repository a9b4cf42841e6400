//! Artifact: the durable record of one sandboxed execution.

use chrono::{DateTime, Utc};
use sandpiper_state::{ArtifactRecord, ConversationId};
use sha2::{Digest, Sha256};

use super::classify::{ClassifiedResult, ResultKind};
use super::timing::ExecutionTiming;

#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub id: String,
    pub code: String,
    pub result: ClassifiedResult,
    /// Set for compile, runtime, resource and upstream faults; `result` is
    /// then absent.
    pub error: Option<String>,
    pub stdout: String,
    pub timing: ExecutionTiming,
    /// Compiled program, free of any suspended state.
    pub program_snapshot: Option<Vec<u8>>,
    pub snapshot_digest: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            code: code.into(),
            result: ClassifiedResult::Absent,
            error: None,
            stdout: String::new(),
            timing: ExecutionTiming::default(),
            program_snapshot: None,
            snapshot_digest: None,
            created_at: Utc::now(),
        }
    }

    pub fn result_kind(&self) -> ResultKind {
        self.result.kind()
    }

    pub fn is_faulted(&self) -> bool {
        self.error.is_some()
    }

    /// Attach a compiled-program snapshot and its digest.
    pub fn with_snapshot(mut self, bytes: Vec<u8>) -> Self {
        self.snapshot_digest = Some(snapshot_digest(&bytes));
        self.program_snapshot = Some(bytes);
        self
    }

    pub fn to_record(&self, conversation_id: &ConversationId, turn_id: &str, seq: u64) -> ArtifactRecord {
        ArtifactRecord {
            id: self.id.clone(),
            conversation_id: conversation_id.clone(),
            turn_id: turn_id.to_string(),
            seq,
            code: self.code.clone(),
            result: self.result.to_json(),
            result_kind: self.result_kind().as_str().to_string(),
            error: self.error.clone(),
            stdout: self.stdout.clone(),
            timing: serde_json::to_value(&self.timing).unwrap_or_default(),
            program_snapshot: self.program_snapshot.clone(),
            snapshot_digest: self.snapshot_digest.clone(),
            created_at: self.created_at,
        }
    }

    pub fn from_record(record: &ArtifactRecord) -> Self {
        let kind = ResultKind::parse(&record.result_kind).unwrap_or(ResultKind::Other);
        Self {
            id: record.id.clone(),
            code: record.code.clone(),
            result: ClassifiedResult::from_stored(kind, record.result.as_ref()),
            error: record.error.clone(),
            stdout: record.stdout.clone(),
            timing: serde_json::from_value(record.timing.clone()).unwrap_or_default(),
            program_snapshot: record.program_snapshot.clone(),
            snapshot_digest: record.snapshot_digest.clone(),
            created_at: record.created_at,
        }
    }
}

/// SHA-256 hex digest of snapshot bytes.
pub fn snapshot_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
