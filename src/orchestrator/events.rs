//! Build events and the sinks that receive them.
//!
//! Inline callers get every event over a channel (rendered as SSE); workers
//! only track coarse progress.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use super::state::Phase;
use crate::autofix::FixAttempt;
use crate::store::{BuildStatus, GeneratedFile, ValidationSummary};
use crate::validation::{Diagnostic, ValidationResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStage {
    Initial,
    Final,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum BuildEvent {
    #[serde(rename_all = "camelCase")]
    Phase {
        build_id: String,
        phase: Phase,
        #[serde(skip_serializing_if = "Option::is_none")]
        files_count: Option<usize>,
    },
    Chunk { content: String },
    #[serde(rename_all = "camelCase")]
    Validation {
        stage: ValidationStage,
        errors: Vec<Diagnostic>,
        warnings: Vec<Diagnostic>,
        suggestions: usize,
        errors_fixed: usize,
        is_clean: bool,
    },
    AiFixResult(FixAttempt),
    #[serde(rename_all = "camelCase")]
    Complete {
        build_id: String,
        status: BuildStatus,
        is_clean: bool,
        files_count: usize,
        files: Vec<GeneratedFile>,
        validation_summary: ValidationSummary,
        warnings: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        build_id: String,
        kind: String,
        message: String,
        phase: Phase,
    },
}

impl BuildEvent {
    pub fn validation(stage: ValidationStage, result: &ValidationResult) -> Self {
        Self::Validation {
            stage,
            errors: result.errors.clone(),
            warnings: result.warnings.clone(),
            suggestions: result.suggestions.len(),
            errors_fixed: result.stats.errors_fixed,
            is_clean: result.is_clean(),
        }
    }

    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Phase { .. } => "phase",
            Self::Chunk { .. } => "chunk",
            Self::Validation { .. } => "validation",
            Self::AiFixResult(_) => "ai_fix_result",
            Self::Complete { .. } => "complete",
            Self::Error { .. } => "error",
        }
    }

    /// JSON payload without the event name wrapper.
    pub fn data(&self) -> Value {
        match serde_json::to_value(self) {
            Ok(Value::Object(mut map)) => map.remove("data").unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }

    /// `{"event": ..., "data": ...}` line for JSON-lines output.
    pub fn to_json_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: BuildEvent);

    /// Coarse progress, 0-100.
    fn progress(&self, _percent: u8) {}

    /// Whether raw `chunk` events are wanted.
    fn wants_chunks(&self) -> bool {
        true
    }
}

/// Forwards events to an inline caller. A closed receiver (client gone) is
/// ignored here; cancellation is driven by the stream's drop guard.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<BuildEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<BuildEvent>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: BuildEvent) {
        let _ = self.tx.send(event);
    }
}

/// Background sink: publishes progress on a watch channel, logs the rest.
pub struct ProgressSink {
    build_id: String,
    tx: watch::Sender<u8>,
}

impl ProgressSink {
    pub fn new(build_id: &str, tx: watch::Sender<u8>) -> Self {
        Self {
            build_id: build_id.to_string(),
            tx,
        }
    }
}

impl EventSink for ProgressSink {
    fn emit(&self, event: BuildEvent) {
        debug!(build_id = %self.build_id, event = event.name(), "Build event");
    }

    fn progress(&self, percent: u8) {
        let percent = percent.min(100);
        self.tx.send_if_modified(|current| {
            if percent > *current {
                *current = percent;
                true
            } else {
                false
            }
        });
    }

    fn wants_chunks(&self) -> bool {
        false
    }
}

/// Progress during generation: 10 at admission, one point per chunk, capped at 90.
pub fn generation_progress(chunks: usize) -> u8 {
    (10 + chunks).min(90) as u8
}

pub const PROGRESS_ADMITTED: u8 = 10;
pub const PROGRESS_PERSISTED: u8 = 95;
pub const PROGRESS_COMPLETE: u8 = 100;


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names_and_payload() {
        let event = BuildEvent::Phase {
            build_id: "b1".into(),
            phase: Phase::Generated,
            files_count: Some(1),
        };
        assert_eq!(event.name(), "phase");
        let data = event.data();
        assert_eq!(data["phase"], "generated");
        assert_eq!(data["filesCount"], 1);
        assert_eq!(data["buildId"], "b1");

        let line: Value = serde_json::from_str(&event.to_json_line()).unwrap();
        assert_eq!(line["event"], "phase");
    }

    #[test]
    fn test_phase_event_omits_missing_count() {
        let event = BuildEvent::Phase {
            build_id: "b1".into(),
            phase: Phase::Generating,
            files_count: None,
        };
        assert!(event.data().get("filesCount").is_none());
    }

    #[test]
    fn test_generation_progress_is_capped() {
        assert_eq!(generation_progress(0), 10);
        assert_eq!(generation_progress(25), 35);
        assert_eq!(generation_progress(10_000), 90);
    }

    #[test]
    fn test_progress_sink_is_monotonic() {
        let (tx, rx) = watch::channel(0u8);
        let sink = ProgressSink::new("b1", tx);
        sink.progress(40);
        sink.progress(20);
        assert_eq!(*rx.borrow(), 40);
        sink.progress(250);
        assert_eq!(*rx.borrow(), 100);
        assert!(!sink.wants_chunks());
    }

    #[tokio::test]
    async fn test_channel_sink_ignores_closed_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        ChannelSink::new(tx).emit(BuildEvent::Chunk {
            content: "x".into(),
        });
    }
}
