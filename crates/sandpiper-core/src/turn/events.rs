//! Events delivered to the client during a turn.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::domain::{Artifact, TurnTiming};

/// Client-facing view of an artifact. Snapshot bytes are never sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactPayload {
    pub id: String,
    pub code: String,
    pub result: Option<Json>,
    pub result_kind: String,
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stdout: String,
}

impl From<&Artifact> for ArtifactPayload {
    fn from(artifact: &Artifact) -> Self {
        Self {
            id: artifact.id.clone(),
            code: artifact.code.clone(),
            result: artifact.result.to_json(),
            result_kind: artifact.result_kind().as_str().to_string(),
            error: artifact.error.clone(),
            stdout: artifact.stdout.clone(),
        }
    }
}

/// One message on the turn stream.
///
/// Serialized as `{"type": "<kind>", "data": <payload>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum TurnEvent {
    Init { conversation_id: String },
    Status(String),
    Text(String),
    Code(String),
    Artifact(ArtifactPayload),
    Error(String),
    Done {
        artifact_ids: Vec<String>,
        timing: TurnTiming,
    },
}

impl TurnEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            TurnEvent::Init { .. } => "init",
            TurnEvent::Status(_) => "status",
            TurnEvent::Text(_) => "text",
            TurnEvent::Code(_) => "code",
            TurnEvent::Artifact(_) => "artifact",
            TurnEvent::Error(_) => "error",
            TurnEvent::Done { .. } => "done",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TurnEvent::Done { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape() {
        let ev = TurnEvent::Status("Agent is thinking...".into());
        assert_eq!(
            serde_json::to_value(&ev).unwrap(),
            json!({"type": "status", "data": "Agent is thinking..."})
        );

        let ev = TurnEvent::Init {
            conversation_id: "c-1".into(),
        };
        assert_eq!(
            serde_json::to_value(&ev).unwrap(),
            json!({"type": "init", "data": {"conversation_id": "c-1"}})
        );
        assert_eq!(ev.kind(), "init");
    }

    #[test]
    fn test_done_round_trip() {
        let ev = TurnEvent::Done {
            artifact_ids: vec!["a".into(), "b".into()],
            timing: TurnTiming::default(),
        };
        let text = serde_json::to_string(&ev).unwrap();
        let back: TurnEvent = serde_json::from_str(&text).unwrap();
        assert_eq!(back, ev);
        assert!(back.is_terminal());
    }

    #[test]
    fn test_artifact_payload_omits_empty_stdout() {
        let artifact = Artifact::new("1");
        let payload = ArtifactPayload::from(&artifact);
        let json = serde_json::to_value(&payload).unwrap();
        assert!(json.get("stdout").is_none());
        assert_eq!(json["result_kind"], "absent");
        assert_eq!(json["result"], serde_json::Value::Null);
    }

    #[test]
    fn test_mapping_payload_is_tagged_key_value() {
        let mut artifact = Artifact::new("{'total': 891}");
        artifact.result = crate::domain::ClassifiedResult::classify(&crate::lang::Object::Dict(vec![(
            crate::lang::Object::str("total"),
            crate::lang::Object::Int(891),
        )]));
        let json = serde_json::to_value(ArtifactPayload::from(&artifact)).unwrap();
        assert_eq!(json["result_kind"], "key-value");
        assert_eq!(json["result"], json!({"total": 891}));
    }
}
