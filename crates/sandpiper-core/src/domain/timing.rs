//! Execution and turn timing records.

use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Lightweight description of one dispatched external call. Never carries
/// the payload itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSummary {
    pub operation: String,
    /// `rows`, `count`, `schema`, `tables` or `rejected`.
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallTiming {
    pub operation: String,
    pub duration_ms: u64,
    pub summary: CallSummary,
}

/// Timing of one sandboxed execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionTiming {
    pub compile_ms: u64,
    /// Interpreter time, excluding external calls.
    pub run_ms: u64,
    pub total_ms: u64,
    #[serde(default)]
    pub calls: Vec<CallTiming>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    Llm,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingSpan {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: SpanKind,
    pub start_ms: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDetail {
    pub name: String,
    pub duration_ms: u64,
    pub has_error: bool,
}

/// Aggregate timing carried by the `done` event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnTiming {
    pub total_ms: u64,
    pub model_steps: usize,
    pub executions: usize,
    pub spans: Vec<TimingSpan>,
    pub tool_details: Vec<ToolDetail>,
}

/// Wall-clock recorder for a turn; offsets are relative to turn start.
#[derive(Debug)]
pub struct TurnClock {
    started: Instant,
    timing: TurnTiming,
}

impl TurnClock {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
            timing: TurnTiming::default(),
        }
    }

    /// Milliseconds since turn start; pass to `record_*` as the span start.
    pub fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn record_model_step(&mut self, start_ms: u64) {
        self.timing.model_steps += 1;
        let name = format!("LLM Turn {}", self.timing.model_steps);
        self.push_span(name, SpanKind::Llm, start_ms);
    }

    pub fn record_tool(&mut self, name: &str, start_ms: u64, has_error: bool, counts_as_execution: bool) {
        let duration_ms = self.now_ms().saturating_sub(start_ms);
        if counts_as_execution {
            self.timing.executions += 1;
        }
        self.push_span("Tool Execution".to_string(), SpanKind::Tool, start_ms);
        self.timing.tool_details.push(ToolDetail {
            name: name.to_string(),
            duration_ms,
            has_error,
        });
    }

    fn push_span(&mut self, name: String, kind: SpanKind, start_ms: u64) {
        let duration_ms = self.now_ms().saturating_sub(start_ms);
        self.timing.spans.push(TimingSpan {
            name,
            kind,
            start_ms,
            duration_ms,
        });
    }

    pub fn finish(mut self) -> TurnTiming {
        self.timing.total_ms = self.now_ms();
        self.timing
    }
}
