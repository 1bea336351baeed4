//! Event bus adapter (C8): fire-and-forget fan-out to in-process listeners.
//!
//! Grounded on the teacher's `broadcast::Sender<String>` fan-out in
//! `factory/server.rs`, generalized to a typed [`PipelineEvent`] instead of
//! raw JSON strings. Publication never awaits subscribers; a lagging or
//! absent subscriber never affects the publisher (broadcast channels drop
//! the oldest message rather than block the sender once a receiver falls
//! behind the capacity).

use orchestrator_common::PipelineEvent;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 1024;

/// Publish-subscribe surface with a fixed topic vocabulary
/// ([`PipelineEvent`]). Subscribers (metrics, notifications) are external
/// and may fail or lag without affecting the publisher.
pub trait EventBus: Send + Sync {
    fn publish(&self, event: PipelineEvent);

    fn subscribe(&self) -> broadcast::Receiver<PipelineEvent>;
}

/// `tokio::sync::broadcast`-backed event bus.
pub struct InProcessEventBus {
    tx: broadcast::Sender<PipelineEvent>,
}

impl Default for InProcessEventBus {
    fn default() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }
}

impl InProcessEventBus {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventBus for InProcessEventBus {
    fn publish(&self, event: PipelineEvent) {
        // `send` only errors when there are zero receivers; that is not a
        // failure for a fire-and-forget bus, so it is deliberately ignored.
        let _ = self.tx.send(event);
    }

    fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_common::{ProjectId, WorkflowId};

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = InProcessEventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(PipelineEvent::Started {
            project_id: ProjectId::new("p1"),
            workflow_id: WorkflowId::new("wf1"),
        });
        let received = rx.recv().await.unwrap();
        assert_eq!(received.topic(), "pipeline.started");
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_panic() {
        let bus = InProcessEventBus::new();
        bus.publish(PipelineEvent::Completed {
            project_id: ProjectId::new("p1"),
            workflow_id: WorkflowId::new("wf1"),
        });
    }
}
