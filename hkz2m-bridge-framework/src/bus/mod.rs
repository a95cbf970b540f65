//! Publish/subscribe bus abstraction.
//!
//! Every bus operation returns an [`Ack`], a future that resolves once the
//! broker acknowledged the operation (or it failed). Callers that must not
//! block hand the [`Ack`] to a spawned task; callers that need ordering
//! await it in place.

mod memory;
mod mqtt;

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::{BridgeError, Result};

pub use memory::MemoryBus;
pub use mqtt::MqttBus;

/// A publish/subscribe message bus.
pub trait Bus: Send + Sync + 'static {
    /// Publish a payload to a topic.
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Ack;

    /// Subscribe to a topic.
    fn subscribe(&self, topic: &str) -> Ack;

    /// Remove a subscription.
    fn unsubscribe(&self, topic: &str) -> Ack;
}

/// A message received from the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Payload as UTF-8 text, lossy.
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Connection events and messages delivered to the dispatch loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// The broker accepted the connection.
    Connected,
    /// The connection dropped; the broker forgot all subscriptions.
    Disconnected { reason: String },
    /// An inbound message.
    Message(BusMessage),
}

/// Delivery acknowledgement token for a bus operation.
#[derive(Debug)]
#[must_use = "an Ack does nothing unless awaited"]
pub struct Ack {
    state: AckState,
}

#[derive(Debug)]
enum AckState {
    Ready(Option<Result<()>>),
    Pending(oneshot::Receiver<Result<()>>),
}

impl Ack {
    /// A token with its resolving half.
    pub fn pair() -> (AckSender, Ack) {
        let (tx, rx) = oneshot::channel();
        (
            AckSender { tx },
            Ack {
                state: AckState::Pending(rx),
            },
        )
    }

    /// An already successful token.
    pub fn ok() -> Self {
        Self {
            state: AckState::Ready(Some(Ok(()))),
        }
    }

    /// An already failed token.
    pub fn failed(err: BridgeError) -> Self {
        Self {
            state: AckState::Ready(Some(Err(err))),
        }
    }
}

impl Future for Ack {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            AckState::Ready(result) => {
                Poll::Ready(result.take().unwrap_or(Err(BridgeError::BusClosed)))
            }
            // A dropped sender means the bus went away without resolving.
            AckState::Pending(rx) => Pin::new(rx)
                .poll(cx)
                .map(|res| res.unwrap_or(Err(BridgeError::BusClosed))),
        }
    }
}

/// Resolving half of an [`Ack`].
#[derive(Debug)]
pub struct AckSender {
    tx: oneshot::Sender<Result<()>>,
}

impl AckSender {
    /// Resolve the token. The waiter may already be gone, which is fine.
    pub fn resolve(self, result: Result<()>) {
        let _ = self.tx.send(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ready_acks() {
        assert!(Ack::ok().await.is_ok());
        let err = Ack::failed(BridgeError::bus("publish", "t", "full")).await;
        assert!(matches!(err, Err(BridgeError::Bus { .. })));
    }

    #[tokio::test]
    async fn test_pending_ack_resolves() {
        let (tx, ack) = Ack::pair();
        tokio::spawn(async move { tx.resolve(Ok(())) });
        assert!(ack.await.is_ok());
    }

    #[tokio::test]
    async fn test_dropped_sender_reports_closed() {
        let (tx, ack) = Ack::pair();
        drop(tx);
        assert!(matches!(ack.await, Err(BridgeError::BusClosed)));
    }

    #[test]
    fn test_message_payload_str() {
        let msg = BusMessage::new("zigbee2mqtt/bridge/state", "online");
        assert_eq!(msg.payload_str(), "online");
    }
}
