//! The model collaborator.
//!
//! A model turn is an ordered sequence of [`ModelBlock`]s ending in
//! [`ModelBlock::End`]. Code and load-result blocks expect a tool result to
//! be submitted before the next block is requested.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{CoreError, UpstreamFault};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelBlock {
    /// Markdown narration.
    Text { text: String },
    /// Request to execute a program.
    Code {
        #[serde(default)]
        id: String,
        code: String,
    },
    /// Request to load an earlier artifact's data into context.
    LoadResult {
        #[serde(default)]
        id: String,
        uid: String,
    },
    End,
}

/// One in-flight model turn.
#[async_trait]
pub trait ModelTurnProducer: Send {
    async fn next_block(&mut self) -> Result<ModelBlock, UpstreamFault>;

    /// Answer the tool request identified by `call_id`.
    async fn submit_tool_result(&mut self, call_id: &str, content: String) -> Result<(), UpstreamFault>;
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn start_turn(&self, prompt: &str) -> Result<Box<dyn ModelTurnProducer>, UpstreamFault>;
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Script {
    Turns(Vec<Vec<ModelBlock>>),
    Single(Vec<ModelBlock>),
}

/// Model client replaying pre-recorded turns, one per `start_turn`.
#[derive(Debug, Default)]
pub struct ScriptedModelClient {
    turns: Mutex<VecDeque<Vec<ModelBlock>>>,
    prompts: Mutex<Vec<String>>,
    tool_results: Arc<Mutex<Vec<(String, String)>>>,
}

impl ScriptedModelClient {
    pub fn new(turns: Vec<Vec<ModelBlock>>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            ..Self::default()
        }
    }

    /// Parse either a single turn (`[block, ...]`) or several
    /// (`[[block, ...], ...]`).
    pub fn from_json(text: &str) -> Result<Self, CoreError> {
        let turns = match serde_json::from_str::<Script>(text)? {
            Script::Turns(turns) => turns,
            Script::Single(blocks) => vec![blocks],
        };
        Ok(Self::new(turns))
    }

    /// Prompts received so far, in order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    /// `(call_id, content)` pairs submitted so far, in order.
    pub fn tool_results(&self) -> Vec<(String, String)> {
        self.tool_results.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelClient for ScriptedModelClient {
    async fn start_turn(&self, prompt: &str) -> Result<Box<dyn ModelTurnProducer>, UpstreamFault> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        let blocks = self
            .turns
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| UpstreamFault::Model("no scripted turn left".into()))?;
        Ok(Box::new(ScriptedTurn {
            blocks: blocks.into(),
            tool_results: Arc::clone(&self.tool_results),
        }))
    }
}

struct ScriptedTurn {
    blocks: VecDeque<ModelBlock>,
    tool_results: Arc<Mutex<Vec<(String, String)>>>,
}

#[async_trait]
impl ModelTurnProducer for ScriptedTurn {
    async fn next_block(&mut self) -> Result<ModelBlock, UpstreamFault> {
        Ok(self.blocks.pop_front().unwrap_or(ModelBlock::End))
    }

    async fn submit_tool_result(&mut self, call_id: &str, content: String) -> Result<(), UpstreamFault> {
        self.tool_results
            .lock()
            .unwrap()
            .push((call_id.to_string(), content));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_wire_format() {
        let block: ModelBlock =
            serde_json::from_str(r#"{"type": "code", "id": "t1", "code": "tables()"}"#).unwrap();
        assert_eq!(
            block,
            ModelBlock::Code {
                id: "t1".into(),
                code: "tables()".into()
            }
        );
        let block: ModelBlock = serde_json::from_str(r#"{"type": "load_result", "uid": "a-1"}"#).unwrap();
        assert!(matches!(block, ModelBlock::LoadResult { ref uid, .. } if uid == "a-1"));
        let block: ModelBlock = serde_json::from_str(r#"{"type": "end"}"#).unwrap();
        assert_eq!(block, ModelBlock::End);
    }

    #[tokio::test]
    async fn test_scripted_client_single_and_multi_turn() {
        let single = ScriptedModelClient::from_json(r#"[{"type": "text", "text": "hi"}]"#).unwrap();
        let mut turn = single.start_turn("q").await.unwrap();
        assert_eq!(turn.next_block().await.unwrap(), ModelBlock::Text { text: "hi".into() });
        assert_eq!(turn.next_block().await.unwrap(), ModelBlock::End);
        assert!(single.start_turn("again").await.is_err());
        assert_eq!(single.prompts(), vec!["q", "again"]);

        let multi = ScriptedModelClient::from_json(
            r#"[[{"type": "end"}], [{"type": "text", "text": "second"}]]"#,
        )
        .unwrap();
        let mut first = multi.start_turn("1").await.unwrap();
        assert_eq!(first.next_block().await.unwrap(), ModelBlock::End);
        let mut second = multi.start_turn("2").await.unwrap();
        second.submit_tool_result("t1", "ok".into()).await.unwrap();
        assert_eq!(
            second.next_block().await.unwrap(),
            ModelBlock::Text { text: "second".into() }
        );
        assert_eq!(multi.tool_results(), vec![("t1".to_string(), "ok".to_string())]);
    }
}
