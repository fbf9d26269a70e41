use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;

use crate::types::{EngineEvent, NodeId};

/// Engine progress fan-out over a tokio broadcast channel.
/// Every subscriber sees every event; slow subscribers lose the oldest ones.
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: EngineEvent) {
        // No receivers is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Events concerning a single node, e.g. for one canvas card.
    pub fn subscribe_node(&self, node_id: impl Into<NodeId>) -> NodeSubscription {
        NodeSubscription {
            node_id: node_id.into(),
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

pub struct NodeSubscription {
    node_id: NodeId,
    rx: broadcast::Receiver<EngineEvent>,
}

impl NodeSubscription {
    /// Next event for this node. `None` once the bus is gone.
    pub async fn next(&mut self) -> Option<EngineEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.node_id() == Some(self.node_id.as_str()) => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(node_id = %self.node_id, skipped, "Node subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(EngineEvent::NodeStarted {
            node_id: "n1".into(),
        });
        assert_eq!(
            rx.recv().await.unwrap(),
            EngineEvent::NodeStarted {
                node_id: "n1".into()
            }
        );
    }

    #[tokio::test]
    async fn test_node_subscription_filters() {
        let bus = EventBus::new(8);
        let mut sub = bus.subscribe_node("b");
        bus.publish(EngineEvent::NodeStarted {
            node_id: "a".into(),
        });
        bus.publish(EngineEvent::BatchStarted {
            batch: 1,
            batches: 2,
            size: 2,
        });
        bus.publish(EngineEvent::NodeCompleted {
            node_id: "b".into(),
            elapsed_ms: 5,
        });
        drop(bus);

        assert_eq!(
            sub.next().await,
            Some(EngineEvent::NodeCompleted {
                node_id: "b".into(),
                elapsed_ms: 5
            })
        );
        assert_eq!(sub.next().await, None);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        bus.publish(EngineEvent::SnapshotPersisted { nodes: 0, edges: 0 });
    }
}
