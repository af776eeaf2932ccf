//! Outbound notification hook.
//!
//! The engine never contacts reviewers or deciders itself; it emits
//! notifications through a caller-supplied hook whenever external
//! input is needed or an instance reaches a terminal status.

use crate::engine::instance::{ExecutionStatus, InstanceId};
use crate::model::step::StepId;

/// Event emitted by the engine for the embedding application.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineNotification {
    /// A review step suspended and waits for approvals.
    ReviewRequested {
        instance_id: InstanceId,
        step_id: StepId,
        assignees: Vec<String>,
        deadline_hours: Option<u32>,
    },

    /// A decision step suspended and waits for an option choice.
    DecisionRequested {
        instance_id: InstanceId,
        step_id: StepId,
        options: Vec<String>,
    },

    /// The instance reached Completed, Failed, or Rejected.
    Terminal {
        instance_id: InstanceId,
        status: ExecutionStatus,
    },
}

/// Receiver of engine notifications. Called synchronously while the
/// instance is locked; implementations should hand off work quickly,
/// e.g. by pushing onto a channel.
pub trait NotificationHook: Send + Sync {
    fn notify(&self, notification: EngineNotification);
}

/// Hook that buffers notifications on an unbounded channel. Useful in
/// tests and simple embeddings.
pub struct ChannelHook {
    sender: tokio::sync::mpsc::UnboundedSender<EngineNotification>,
}

impl ChannelHook {
    pub fn new() -> (
        Self,
        tokio::sync::mpsc::UnboundedReceiver<EngineNotification>,
    ) {
        let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl NotificationHook for ChannelHook {
    fn notify(&self, notification: EngineNotification) {
        // Receiver may be gone during shutdown; dropped events are fine.
        let _ = self.sender.send(notification);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_hook_delivers() {
        let (hook, mut receiver) = ChannelHook::new();
        hook.notify(EngineNotification::Terminal {
            instance_id: "wf-1".to_string(),
            status: ExecutionStatus::Completed,
        });

        let event = receiver.recv().await.unwrap();
        assert!(matches!(event, EngineNotification::Terminal { .. }));
    }

    #[test]
    fn test_dropped_receiver_is_ignored() {
        let (hook, receiver) = ChannelHook::new();
        drop(receiver);
        hook.notify(EngineNotification::DecisionRequested {
            instance_id: "wf-1".to_string(),
            step_id: StepId::from("triage"),
            options: vec!["ship".to_string()],
        });
    }
}
