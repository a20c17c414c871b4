//! In-process position lifecycle notifications

use tokio::sync::broadcast;
use tracing::debug;

use crate::state::{CloseReason, Position};

#[derive(Debug, Clone, PartialEq)]
pub enum PositionEvent {
    Created(Position),
    Updated(Position),
    Closed {
        position: Position,
        reason: CloseReason,
    },
}

impl PositionEvent {
    pub fn position(&self) -> &Position {
        match self {
            PositionEvent::Created(position) | PositionEvent::Updated(position) => position,
            PositionEvent::Closed { position, .. } => position,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PositionEvent::Created(_) => "position_created",
            PositionEvent::Updated(_) => "position_updated",
            PositionEvent::Closed { .. } => "position_closed",
        }
    }
}

/// Broadcast bus; every subscriber gets every event once.
/// Slow subscribers lag rather than block publishers.
#[derive(Clone)]
pub struct PositionEventBus {
    sender: broadcast::Sender<PositionEvent>,
}

impl PositionEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish to current subscribers; returns how many received it
    pub fn publish(&self, event: PositionEvent) -> usize {
        let kind = event.kind();
        let id = event.position().id;
        match self.sender.send(event) {
            Ok(receivers) => {
                debug!("📣 {} {} -> {} subscribers", kind, id, receivers);
                receivers
            }
            Err(_) => 0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PositionEvent> {
        self.sender.subscribe()
    }
}

impl Default for PositionEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TokenAddress;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_each_subscriber_receives_once() {
        let bus = PositionEventBus::new(16);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        let position = Position::new(
            "agent",
            "wallet",
            &TokenAddress::new("Mint"),
            "MNT",
            dec!(10),
            dec!(1),
            "sig".to_string(),
        );
        assert_eq!(bus.publish(PositionEvent::Created(position.clone())), 2);

        assert_eq!(first.recv().await.unwrap().kind(), "position_created");
        assert_eq!(second.recv().await.unwrap().position().id, position.id);
        assert!(first.try_recv().is_err());
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = PositionEventBus::default();
        let position = Position::new(
            "agent",
            "wallet",
            &TokenAddress::new("Mint"),
            "MNT",
            dec!(10),
            dec!(1),
            "sig".to_string(),
        );
        assert_eq!(bus.publish(PositionEvent::Updated(position)), 0);
    }
}
