//! In-process bus that records operations.

use std::sync::Arc;

use parking_lot::Mutex;

use super::{Ack, AckSender, Bus, BusMessage};
use crate::error::BridgeError;

/// A bus that records every operation instead of talking to a broker.
///
/// Acknowledgements resolve immediately unless held with
/// [`hold_acks`](Self::hold_acks); individual operation kinds can be made
/// to fail.
#[derive(Debug, Clone, Default)]
pub struct MemoryBus {
    inner: Arc<Mutex<MemoryBusState>>,
}

#[derive(Debug, Default)]
struct MemoryBusState {
    published: Vec<BusMessage>,
    subscribed: Vec<String>,
    unsubscribed: Vec<String>,
    fail_publish: bool,
    fail_subscribe: bool,
    fail_unsubscribe: bool,
    hold: bool,
    held: Vec<AckSender>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages published so far, in order.
    pub fn published(&self) -> Vec<BusMessage> {
        self.inner.lock().published.clone()
    }

    /// Topics subscribed so far, in order, including repeats.
    pub fn subscriptions(&self) -> Vec<String> {
        self.inner.lock().subscribed.clone()
    }

    /// Topics unsubscribed so far, in order.
    pub fn unsubscriptions(&self) -> Vec<String> {
        self.inner.lock().unsubscribed.clone()
    }

    /// Forget recorded operations.
    pub fn clear(&self) {
        let mut state = self.inner.lock();
        state.published.clear();
        state.subscribed.clear();
        state.unsubscribed.clear();
    }

    pub fn set_fail_publish(&self, fail: bool) {
        self.inner.lock().fail_publish = fail;
    }

    pub fn set_fail_subscribe(&self, fail: bool) {
        self.inner.lock().fail_subscribe = fail;
    }

    pub fn set_fail_unsubscribe(&self, fail: bool) {
        self.inner.lock().fail_unsubscribe = fail;
    }

    /// Keep acknowledgements of subsequent operations pending until
    /// [`release_acks`](Self::release_acks).
    pub fn hold_acks(&self) {
        self.inner.lock().hold = true;
    }

    /// Resolve every held acknowledgement successfully and stop holding.
    /// Returns how many were released.
    pub fn release_acks(&self) -> usize {
        let held = {
            let mut state = self.inner.lock();
            state.hold = false;
            std::mem::take(&mut state.held)
        };
        let count = held.len();
        for tx in held {
            tx.resolve(Ok(()));
        }
        count
    }

    fn complete(state: &mut MemoryBusState, fail: bool, op: &'static str, topic: &str) -> Ack {
        if fail {
            return Ack::failed(BridgeError::bus(op, topic, "injected failure"));
        }
        if state.hold {
            let (tx, ack) = Ack::pair();
            state.held.push(tx);
            return ack;
        }
        Ack::ok()
    }
}

impl Bus for MemoryBus {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Ack {
        let mut state = self.inner.lock();
        state.published.push(BusMessage::new(topic, payload));
        let fail = state.fail_publish;
        Self::complete(&mut state, fail, "publish", topic)
    }

    fn subscribe(&self, topic: &str) -> Ack {
        let mut state = self.inner.lock();
        state.subscribed.push(topic.to_string());
        let fail = state.fail_subscribe;
        Self::complete(&mut state, fail, "subscribe", topic)
    }

    fn unsubscribe(&self, topic: &str) -> Ack {
        let mut state = self.inner.lock();
        state.unsubscribed.push(topic.to_string());
        let fail = state.fail_unsubscribe;
        Self::complete(&mut state, fail, "unsubscribe", topic)
    }
}
