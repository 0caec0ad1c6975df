// Event bus for agent lifecycle notifications

//! # Event System
//!
//! Fire-and-forget observer notifications for agent lifecycle changes.
//! Events are delivered in emission order per component; a subscriber that
//! lags or drops its receiver cannot affect pool state.

use tokio::sync::broadcast;
use tracing::debug;

use crate::models::{AgentEvent, AgentEventType, AgentId};
use serde_json::Value;

/// Broadcast bus for [`AgentEvent`]s.
pub struct EventBus {
    sender: broadcast::Sender<AgentEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1000); // Buffer up to 1000 events

        Self { sender }
    }

    /// Publish an event to all subscribers. Send errors (no receivers) are
    /// deliberately ignored.
    pub fn publish(&self, event: AgentEvent) {
        debug!(event = event.event.as_str(), agent = %event.agent_id, "agent event");
        let _ = self.sender.send(event);
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.sender.subscribe()
    }

    /// Emit a lifecycle event for the given agent.
    pub fn emit(
        &self,
        event: AgentEventType,
        agent_id: AgentId,
        agent_name: impl Into<String>,
        data: Option<Value>,
    ) {
        self.publish(AgentEvent::new(event, agent_id, agent_name, data));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscribers_receive_events_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        let id = AgentId::from("agent-1");
        bus.emit(AgentEventType::Started, id.clone(), "analyst", None);
        bus.emit(
            AgentEventType::Invoked,
            id.clone(),
            "analyst",
            Some(json!({"latencyMs": 42})),
        );

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.event, AgentEventType::Started);
        assert_eq!(second.event, AgentEventType::Invoked);
        assert_eq!(second.data.unwrap()["latencyMs"], 42);
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_harmless() {
        let bus = EventBus::new();
        bus.emit(AgentEventType::Error, AgentId::new(), "dev", None);
    }
}
