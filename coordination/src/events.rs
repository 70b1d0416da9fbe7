//! In-process event bus
//!
//! Broadcast pub/sub linking the chatroom stream, the council bridge and
//! paper trading. Publishing never fails: with nobody listening the event
//! is simply dropped.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::bridge::{CouncilOutcome, CouncilTrigger};
use crate::chatroom::types::{Phase, Sentiment};
use crate::trading::Trade;

/// Channel capacity for broadcast
const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Channel closed")]
    ChannelClosed,
}

pub type EventBusResult<T> = Result<T, EventBusError>;

/// Shared reference to EventBus
pub type SharedEventBus = Arc<EventBus>;

/// Rolling consensus after a chatroom message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsensusUpdate {
    pub direction: Option<Sentiment>,
    pub strength: u8,
    pub message_count: u64,
    pub phase: Phase,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum VaultEvent {
    ConsensusUpdated(ConsensusUpdate),
    CouncilTriggered(CouncilTrigger),
    CouncilCompleted(CouncilOutcome),
    TradeOpened(Trade),
    TradeClosed(Trade),
}

impl VaultEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ConsensusUpdated(_) => "consensus_updated",
            Self::CouncilTriggered(_) => "council_triggered",
            Self::CouncilCompleted(_) => "council_completed",
            Self::TradeOpened(_) => "trade_opened",
            Self::TradeClosed(_) => "trade_closed",
        }
    }
}

pub struct EventBus {
    sender: broadcast::Sender<VaultEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    /// Publish to all subscribers, returning how many received it.
    pub fn publish(&self, event: VaultEvent) -> usize {
        let event_type = event.event_type();
        match self.sender.send(event) {
            Ok(count) => {
                debug!(event_type, receivers = count, "Event published");
                count
            }
            Err(_) => {
                debug!(event_type, "Event published (no receivers)");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VaultEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Next event for a listener, skipping over lag gaps.
pub async fn next_event(rx: &mut broadcast::Receiver<VaultEvent>) -> EventBusResult<VaultEvent> {
    loop {
        match rx.recv().await {
            Ok(event) => return Ok(event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "event listener lagged, dropping events");
            }
            Err(broadcast::error::RecvError::Closed) => return Err(EventBusError::ChannelClosed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(strength: u8) -> VaultEvent {
        VaultEvent::ConsensusUpdated(ConsensusUpdate {
            direction: Some(Sentiment::Bullish),
            strength,
            message_count: 12,
            phase: Phase::Debate,
            timestamp: 0,
        })
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.publish(update(50)), 0);
    }

    #[tokio::test]
    async fn test_subscribers_receive() {
        let bus = EventBus::new().shared();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
        assert_eq!(bus.publish(update(81)), 2);

        for rx in [&mut a, &mut b] {
            match next_event(rx).await.unwrap() {
                VaultEvent::ConsensusUpdated(u) => assert_eq!(u.strength, 81),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_closed_channel() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        drop(bus);
        assert!(matches!(next_event(&mut rx).await, Err(EventBusError::ChannelClosed)));
    }

    #[test]
    fn test_event_serialization_shape() {
        let json = serde_json::to_value(update(70)).unwrap();
        assert_eq!(json["type"], "consensus_updated");
        assert_eq!(json["data"]["messageCount"], 12);
        assert_eq!(json["data"]["phase"], "DEBATE");
    }
}
