//! Peer message channel contract.
//!
//! One channel pairs the two parties of a single swap. Delivery is assumed
//! FIFO per channel; nothing is guaranteed across reconnects, so flows must
//! tolerate resends of the same event (the idempotent step-completion
//! primitive absorbs them).

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::ChannelError;

/// One delivered peer event.
#[derive(Debug, Clone)]
pub struct ChannelMessage {
    pub event: String,
    pub data: Value,
}

/// Pub/sub channel to the swap counterpart.
///
/// `subscribe` registers synchronously, so a flow can subscribe before sending
/// the request that provokes the reply. A one-shot subscription is simply a
/// receiver dropped after its first delivery.
pub trait MessageChannel: Send + Sync {
    /// Publishes a named event to the counterpart.
    fn send(&self, event: &str, data: Value) -> Result<(), ChannelError>;

    /// Subscribes persistently to a named event.
    fn subscribe(&self, event: &str) -> mpsc::UnboundedReceiver<Value>;
}

/// Awaits exactly one delivery of `event`, then unsubscribes.
pub async fn once(channel: &dyn MessageChannel, event: &str) -> Option<Value> {
    let mut rx = channel.subscribe(event);
    rx.recv().await
}

type SubscriberMap = Arc<Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Value>>>>>;

/// In-memory loopback channel connecting two endpoints in one process.
///
/// This is the transport used by the integration tests; production transports
/// implement [`MessageChannel`] over a real pub/sub room.
pub struct InMemoryChannel {
    inbox: SubscriberMap,
    peer_inbox: SubscriberMap,
}

impl InMemoryChannel {
    /// Creates a connected pair of endpoints.
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let a: SubscriberMap = Arc::new(Mutex::new(HashMap::new()));
        let b: SubscriberMap = Arc::new(Mutex::new(HashMap::new()));
        (
            Arc::new(Self {
                inbox: a.clone(),
                peer_inbox: b.clone(),
            }),
            Arc::new(Self {
                inbox: b,
                peer_inbox: a,
            }),
        )
    }
}

impl MessageChannel for InMemoryChannel {
    fn send(&self, event: &str, data: Value) -> Result<(), ChannelError> {
        debug!(event, "channel send");
        let mut subscribers = self
            .peer_inbox
            .lock()
            .map_err(|_| ChannelError("channel poisoned".into()))?;
        if let Some(senders) = subscribers.get_mut(event) {
            // Dead receivers are pruned on delivery.
            senders.retain(|tx| tx.send(data.clone()).is_ok());
        }
        Ok(())
    }

    fn subscribe(&self, event: &str) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.inbox.lock().expect("channel poisoned");
        subscribers.entry(event.to_string()).or_default().push(tx);
        rx
    }
}
