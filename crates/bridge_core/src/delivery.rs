use std::collections::HashMap;

use shared::{
    domain::{ConversationKey, UserId},
    protocol::IncomingEvent,
};
use storage::IdentityRecord;
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

use crate::error::DispatchError;

/// An event resolved to its conversation and acting identity.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub user_id: UserId,
    pub conversation: ConversationKey,
    pub actor: IdentityRecord,
    pub event: IncomingEvent,
}

/// Events buffered per conversation before a consumer drains them.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

struct QueueSlot {
    sender: mpsc::Sender<Delivery>,
    receiver: Option<mpsc::Receiver<Delivery>>,
}

impl QueueSlot {
    fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity);
        Self {
            sender,
            receiver: Some(receiver),
        }
    }
}

/// One FIFO per conversation. Events for a conversation leave in the order
/// they were enqueued; different conversations never block each other.
/// Each queue buffers up to `capacity` events; once full, further events
/// for that conversation are dropped until the consumer catches up.
pub struct DeliveryQueues {
    capacity: usize,
    slots: Mutex<HashMap<ConversationKey, QueueSlot>>,
}

impl Default for DeliveryQueues {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }
}

impl DeliveryQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub async fn enqueue(&self, delivery: Delivery) -> Result<(), DispatchError> {
        let mut slots = self.slots.lock().await;
        let slot = slots
            .entry(delivery.conversation.clone())
            .or_insert_with(|| QueueSlot::new(self.capacity));

        match slot.sender.try_send(delivery) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(delivery)) => {
                let key = delivery.conversation;
                warn!(
                    conversation = %key,
                    kind = delivery.event.kind(),
                    capacity = self.capacity,
                    "delivery: queue full; dropping event"
                );
                Err(DispatchError::QueueFull(key.to_string()))
            }
            Err(mpsc::error::TrySendError::Closed(delivery)) => {
                let key = delivery.conversation;
                warn!(conversation = %key, "delivery: consumer went away; resetting queue");
                slots.remove(&key);
                Err(DispatchError::QueueClosed(key.to_string()))
            }
        }
    }

    /// Hands the consuming end of a conversation's queue to its consumer.
    /// Returns `None` if it was already taken.
    pub async fn take_receiver(
        &self,
        key: &ConversationKey,
    ) -> Option<mpsc::Receiver<Delivery>> {
        let mut slots = self.slots.lock().await;
        slots
            .entry(key.clone())
            .or_insert_with(|| QueueSlot::new(self.capacity))
            .receiver
            .take()
    }
}

#[cfg(test)]
#[path = "tests/delivery_tests.rs"]
mod tests;
