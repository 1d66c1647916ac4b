//! Progress events emitted while a workflow runs.

use crate::result::StepResult;
use crate::step::StepType;
use serde::Serialize;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    WorkflowStarted {
        workflow: String,
        workflow_id: String,
        total_steps: usize,
        /// Steps restored from a checkpoint
        replayed: usize,
    },
    StepStarted {
        workflow: String,
        step: String,
        step_type: StepType,
    },
    StepCompleted {
        workflow: String,
        result: StepResult,
    },
    CheckpointSaved {
        workflow: String,
        workflow_id: String,
        step: String,
        checkpoint_id: String,
    },
    RollbackStarted {
        workflow: String,
        step: String,
        action: String,
    },
    RollbackCompleted {
        workflow: String,
        step: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    WorkflowCompleted {
        workflow: String,
        workflow_id: String,
        success: bool,
        cancelled: bool,
        total_ms: u64,
    },
}

/// Optional event sink. Sending never blocks and a dropped receiver is ignored.
#[derive(Debug, Clone, Default)]
pub(crate) struct EventSink {
    sender: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl EventSink {
    pub(crate) fn new(sender: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        Self {
            sender: Some(sender),
        }
    }

    pub(crate) fn emit(&self, event: ProgressEvent) {
        if let Some(sender) = &self.sender {
            if sender.send(event).is_err() {
                tracing::trace!("progress receiver dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_json_tag() {
        let event = ProgressEvent::StepStarted {
            workflow: "fly".into(),
            step: "load".into(),
            step_type: StepType::Python,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], json!("step_started"));
        assert_eq!(value["step_type"], json!("python"));
    }

    #[test]
    fn test_sink_without_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let sink = EventSink::new(tx);
        sink.emit(ProgressEvent::RollbackStarted {
            workflow: "fly".into(),
            step: "a".into(),
            action: "undo".into(),
        });
        EventSink::default().emit(ProgressEvent::RollbackCompleted {
            workflow: "fly".into(),
            step: "a".into(),
            success: true,
            error: None,
        });
    }
}
