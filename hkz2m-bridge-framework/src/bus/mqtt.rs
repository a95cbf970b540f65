//! rumqttc-backed bus.
//!
//! rumqttc does not hand out per-request acknowledgement tokens, so the bus
//! correlates them from the event loop: requests leave the client channel
//! in order, each `Outgoing` event assigns the packet id of the oldest
//! queued request of that kind, and the matching `SUBACK`/`UNSUBACK`/`PUBACK`
//! resolves it. QoS 0 publishes resolve as soon as they are written.
//!
//! When the client channel is full, requests wait in a backlog that a
//! single task feeds into the channel in order. While the backlog is
//! draining every new request joins its tail.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ClientError, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS, Request,
    SubscribeReasonCode,
};
use tracing::{debug, trace};

use super::{Ack, AckSender, Bus};
use crate::error::BridgeError;

/// Capacity of the request channel between client and event loop.
const REQUESTS_CAP: usize = 64;

/// Bus handle over a rumqttc client.
///
/// Cheap to clone; every clone shares the same acknowledgement tracker.
/// The paired [`EventLoop`] must be driven by
/// [`BridgeRunner`](crate::BridgeRunner), which feeds every event to
/// [`track`](Self::track).
#[derive(Clone)]
pub struct MqttBus {
    client: AsyncClient,
    acks: Arc<Mutex<AckTracker>>,
}

impl std::fmt::Debug for MqttBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let acks = self.acks.lock();
        f.debug_struct("MqttBus")
            .field("queued", &acks.queued())
            .field("in_flight", &acks.in_flight())
            .field("backlog", &acks.backlog.len())
            .field("closed", &acks.closed)
            .finish()
    }
}

impl MqttBus {
    /// Create the bus and the event loop that drives it.
    pub fn new(options: MqttOptions) -> (Self, EventLoop) {
        let (client, event_loop) = AsyncClient::new(options, REQUESTS_CAP);
        let bus = Self {
            client,
            acks: Arc::new(Mutex::new(AckTracker::default())),
        };
        (bus, event_loop)
    }

    /// Feed one event loop event into the acknowledgement tracker.
    pub fn track(&self, event: &Event) {
        let mut acks = self.acks.lock();
        match event {
            Event::Outgoing(Outgoing::Publish(pkid)) => acks.sent(Kind::Publish, *pkid),
            Event::Outgoing(Outgoing::Subscribe(pkid)) => acks.sent(Kind::Subscribe, *pkid),
            Event::Outgoing(Outgoing::Unsubscribe(pkid)) => acks.sent(Kind::Unsubscribe, *pkid),
            Event::Incoming(Incoming::PubAck(ack)) => {
                acks.acknowledged(Kind::Publish, ack.pkid, Ok(()));
            }
            Event::Incoming(Incoming::SubAck(ack)) => {
                let rejected = ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure));
                let result = if rejected {
                    Err("rejected by broker")
                } else {
                    Ok(())
                };
                acks.acknowledged(Kind::Subscribe, ack.pkid, result);
            }
            Event::Incoming(Incoming::UnsubAck(ack)) => {
                acks.acknowledged(Kind::Unsubscribe, ack.pkid, Ok(()));
            }
            _ => {}
        }
    }

    /// Fail every request already written to the broker.
    ///
    /// Queued requests stay queued; the event loop sends them after the
    /// reconnect.
    pub fn connection_lost(&self) {
        let failed = self.acks.lock().fail_in_flight();
        if failed > 0 {
            debug!(failed, "Failed in-flight acknowledgements after connection loss");
        }
    }

    /// Remove subscribes to `topics` from the requests the event loop kept
    /// for replay after a disconnect, failing their acknowledgements.
    ///
    /// The supervisor subscribes those topics again after every connect, so
    /// a replayed copy would subscribe them twice. Returns how many were
    /// dropped.
    pub fn discard_replayed(&self, pending: &mut VecDeque<Request>, topics: &[String]) -> usize {
        let mut acks = self.acks.lock();
        let mut position = [0usize; 3];
        let mut dropped = 0;

        pending.retain(|request| {
            let (kind, topic) = match request {
                Request::Publish(publish) => (Kind::Publish, publish.topic.as_str()),
                Request::Subscribe(subscribe) => match subscribe.filters.as_slice() {
                    [filter] => (Kind::Subscribe, filter.path.as_str()),
                    _ => (Kind::Subscribe, ""),
                },
                Request::Unsubscribe(unsubscribe) => match unsubscribe.topics.as_slice() {
                    [topic] => (Kind::Unsubscribe, topic.as_str()),
                    _ => (Kind::Unsubscribe, ""),
                },
                _ => return true,
            };

            if kind == Kind::Subscribe && topics.iter().any(|t| t == topic) {
                acks.abandon(kind, position[kind.index()], topic);
                dropped += 1;
                false
            } else {
                position[kind.index()] += 1;
                true
            }
        });

        if dropped > 0 {
            debug!(dropped, "Dropped replayed bridge subscriptions");
        }
        dropped
    }

    /// Shut the bus down: fail every pending acknowledgement and reject
    /// further operations.
    pub fn close(&self) {
        let failed = self.acks.lock().close();
        debug!(failed, "Bus closed");
        if let Err(e) = self.client.try_disconnect() {
            trace!(error = %e, "Disconnect request not queued");
        }
    }

    fn request(&self, topic: &str, outbound: Outbound) -> Ack {
        let kind = outbound.kind();
        let valid = match kind {
            Kind::Publish => rumqttc::valid_topic(topic),
            Kind::Subscribe | Kind::Unsubscribe => rumqttc::valid_filter(topic),
        };
        if !valid {
            return Ack::failed(BridgeError::bus(kind.op(), topic, "invalid topic"));
        }

        // Hold the tracker lock across the send so queue order matches
        // channel order.
        let mut acks = self.acks.lock();
        if acks.closed {
            return Ack::failed(BridgeError::BusClosed);
        }

        if !acks.draining && outbound.clone().try_send(&self.client, topic).is_ok() {
            let (tx, ack) = Ack::pair();
            acks.queue(kind, topic, tx);
            return ack;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return Ack::failed(BridgeError::bus(kind.op(), topic, "request channel full"));
        };

        let (tx, ack) = Ack::pair();
        acks.backlog.push_back(Deferred {
            topic: topic.to_string(),
            outbound,
            tx,
        });
        if !acks.draining {
            acks.draining = true;
            trace!(op = kind.op(), topic = %topic, "Request channel full, draining backlog");
            runtime.spawn(drain_backlog(self.client.clone(), Arc::clone(&self.acks)));
        }
        ack
    }
}

impl Bus for MqttBus {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Ack {
        self.request(topic, Outbound::Publish(payload))
    }

    fn subscribe(&self, topic: &str) -> Ack {
        self.request(topic, Outbound::Subscribe)
    }

    fn unsubscribe(&self, topic: &str) -> Ack {
        self.request(topic, Outbound::Unsubscribe)
    }
}

/// Feed the backlog into the client channel, waiting for room, until it is
/// empty.
async fn drain_backlog(client: AsyncClient, acks: Arc<Mutex<AckTracker>>) {
    loop {
        let (kind, topic, outbound) = {
            let mut acks = acks.lock();
            let Some(deferred) = acks.backlog.pop_front() else {
                acks.draining = false;
                return;
            };
            let kind = deferred.outbound.kind();
            // Queued before the send; the event loop cannot report it earlier.
            acks.queue(kind, &deferred.topic, deferred.tx);
            (kind, deferred.topic, deferred.outbound)
        };

        if let Err(e) = outbound.send(&client, &topic).await {
            // Nothing else queues while draining, so this is the tail entry.
            if let Some(pending) = acks.lock().unqueue_last(kind, &topic) {
                pending.tx.resolve(Err(BridgeError::bus(kind.op(), &topic, e.to_string())));
            }
        }
    }
}

/// A request that has not reached the client channel yet.
#[derive(Debug, Clone)]
enum Outbound {
    Publish(Vec<u8>),
    Subscribe,
    Unsubscribe,
}

impl Outbound {
    fn kind(&self) -> Kind {
        match self {
            Outbound::Publish(_) => Kind::Publish,
            Outbound::Subscribe => Kind::Subscribe,
            Outbound::Unsubscribe => Kind::Unsubscribe,
        }
    }

    fn try_send(self, client: &AsyncClient, topic: &str) -> Result<(), ClientError> {
        match self {
            Outbound::Publish(payload) => client.try_publish(topic, QoS::AtMostOnce, false, payload),
            Outbound::Subscribe => client.try_subscribe(topic, QoS::AtMostOnce),
            Outbound::Unsubscribe => client.try_unsubscribe(topic),
        }
    }

    async fn send(self, client: &AsyncClient, topic: &str) -> Result<(), ClientError> {
        match self {
            Outbound::Publish(payload) => {
                client.publish(topic, QoS::AtMostOnce, false, payload).await
            }
            Outbound::Subscribe => client.subscribe(topic, QoS::AtMostOnce).await,
            Outbound::Unsubscribe => client.unsubscribe(topic).await,
        }
    }
}

#[derive(Debug)]
struct Deferred {
    topic: String,
    outbound: Outbound,
    tx: AckSender,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Kind {
    Publish,
    Subscribe,
    Unsubscribe,
}

impl Kind {
    fn op(self) -> &'static str {
        match self {
            Kind::Publish => "publish",
            Kind::Subscribe => "subscribe",
            Kind::Unsubscribe => "unsubscribe",
        }
    }

    fn index(self) -> usize {
        match self {
            Kind::Publish => 0,
            Kind::Subscribe => 1,
            Kind::Unsubscribe => 2,
        }
    }
}

#[derive(Debug)]
struct Pending {
    topic: String,
    tx: AckSender,
}

#[derive(Debug, Default)]
struct AckTracker {
    /// Requests handed to the client but not yet written, per kind.
    queued: [VecDeque<Pending>; 3],
    /// Written requests waiting for the broker, per kind and packet id.
    in_flight: [HashMap<u16, Pending>; 3],
    /// Requests waiting for room in the client channel.
    backlog: VecDeque<Deferred>,
    draining: bool,
    closed: bool,
}

impl AckTracker {
    fn queue(&mut self, kind: Kind, topic: &str, tx: AckSender) {
        self.queued[kind.index()].push_back(Pending {
            topic: topic.to_string(),
            tx,
        });
    }

    fn sent(&mut self, kind: Kind, pkid: u16) {
        let Some(pending) = self.queued[kind.index()].pop_front() else {
            // Retransmission or a request issued outside this bus.
            trace!(op = kind.op(), pkid, "Untracked outgoing packet");
            return;
        };

        if kind == Kind::Publish && pkid == 0 {
            trace!(topic = %pending.topic, "QoS 0 publish written");
            pending.tx.resolve(Ok(()));
        } else {
            self.in_flight[kind.index()].insert(pkid, pending);
        }
    }

    fn unqueue_last(&mut self, kind: Kind, topic: &str) -> Option<Pending> {
        let queue = &mut self.queued[kind.index()];
        if queue.back().is_some_and(|pending| pending.topic == topic) {
            queue.pop_back()
        } else {
            None
        }
    }

    /// Fail the queued request at `position` if it is the one for `topic`.
    fn abandon(&mut self, kind: Kind, position: usize, topic: &str) {
        let queue = &mut self.queued[kind.index()];
        if queue.get(position).is_some_and(|pending| pending.topic == topic) {
            if let Some(pending) = queue.remove(position) {
                pending.tx.resolve(Err(BridgeError::ConnectionLost {
                    op: kind.op(),
                    topic: pending.topic,
                }));
            }
        } else {
            trace!(op = kind.op(), topic = %topic, "Replayed request without a tracked acknowledgement");
        }
    }

    fn acknowledged(&mut self, kind: Kind, pkid: u16, result: Result<(), &str>) {
        let Some(pending) = self.in_flight[kind.index()].remove(&pkid) else {
            trace!(op = kind.op(), pkid, "Acknowledgement for unknown packet");
            return;
        };

        trace!(op = kind.op(), topic = %pending.topic, pkid, "Acknowledged");
        let result = result.map_err(|msg| BridgeError::bus(kind.op(), &pending.topic, msg));
        pending.tx.resolve(result);
    }

    fn fail_in_flight(&mut self) -> usize {
        let mut failed = 0;
        for kind in [Kind::Publish, Kind::Subscribe, Kind::Unsubscribe] {
            for (_, pending) in self.in_flight[kind.index()].drain() {
                pending.tx.resolve(Err(BridgeError::ConnectionLost {
                    op: kind.op(),
                    topic: pending.topic,
                }));
                failed += 1;
            }
        }
        failed
    }

    fn close(&mut self) -> usize {
        self.closed = true;
        let mut failed = self.fail_in_flight();
        for queue in &mut self.queued {
            for pending in queue.drain(..) {
                pending.tx.resolve(Err(BridgeError::BusClosed));
                failed += 1;
            }
        }
        for deferred in self.backlog.drain(..) {
            deferred.tx.resolve(Err(BridgeError::BusClosed));
            failed += 1;
        }
        failed
    }

    fn queued(&self) -> usize {
        self.queued.iter().map(VecDeque::len).sum()
    }

    fn in_flight(&self) -> usize {
        self.in_flight.iter().map(HashMap::len).sum()
    }
}
