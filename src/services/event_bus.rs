//! In-process publish/subscribe for normalized envelopes
//!
//! Subscribers register either a synchronous callback or a bounded channel.
//! `publish` delivers to every subscriber registered at call time, in
//! registration order, with panics in one callback isolated from the rest.
//! `publish` never waits on a channel subscriber: each one gets an unbounded
//! intake queue drained into its bounded receiver by a forwarding task, so a
//! slow consumer grows its backlog instead of stalling ingestion. Envelopes
//! are only dropped once the receiver is gone, and every drop is counted.

use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, warn};

use crate::domain::EventEnvelope;

/// Topic that matches every published event
pub const WILDCARD: &str = "*";

/// Log a warning each time a subscriber's backlog grows by this many
const BACKLOG_WARN_STEP: i64 = 10_000;

pub type Handler = Arc<dyn Fn(&EventEnvelope) + Send + Sync>;

struct ChannelDelivery {
    intake: mpsc::UnboundedSender<Arc<EventEnvelope>>,
    outlet: mpsc::Sender<Arc<EventEnvelope>>,
    backlog: Arc<AtomicI64>,
}

enum Delivery {
    Callback(Handler),
    Channel(ChannelDelivery),
}

struct Subscriber {
    id: u64,
    topic: String,
    delivery: Delivery,
    alive: AtomicBool,
}

impl Subscriber {
    fn matches(&self, topic: &str) -> bool {
        self.topic == WILDCARD || self.topic == topic
    }
}

#[derive(Default)]
struct BusInner {
    subscribers: RwLock<Vec<Arc<Subscriber>>>,
    next_id: AtomicU64,
    published: AtomicU64,
    handler_failures: AtomicU64,
    dropped: AtomicU64,
    /// Signalled whenever a channel subscriber's backlog empties
    idle: Notify,
}

impl BusInner {
    fn read_subscribers(&self) -> Vec<Arc<Subscriber>> {
        match self.subscribers.read() {
            Ok(subs) => subs.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn prune(&self) {
        let mut subs = match self.subscribers.write() {
            Ok(subs) => subs,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = subs.len();
        subs.retain(|s| s.alive.load(Ordering::SeqCst));
        debug!(pruned = before - subs.len(), "Pruned dead subscribers");
    }
}

/// Handle returned by `subscribe`; call `unsubscribe` to stop delivery
pub struct Unsubscribe {
    id: u64,
    bus: Weak<BusInner>,
}

impl Unsubscribe {
    pub fn unsubscribe(self) {
        let Some(bus) = self.bus.upgrade() else {
            return;
        };
        for sub in bus.read_subscribers() {
            if sub.id == self.id {
                sub.alive.store(false, Ordering::SeqCst);
            }
        }
    }
}

/// Outcome of one publish call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Bus counters for the status report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
    pub published: u64,
    pub handler_failures: u64,
    /// Envelopes queued for channel subscribers but not yet received
    pub channel_backlog: u64,
    /// Envelopes lost because a channel subscriber went away
    pub dropped: u64,
}

/// Move envelopes from the intake queue into the bounded receiver in order
async fn forward(
    id: u64,
    mut intake: mpsc::UnboundedReceiver<Arc<EventEnvelope>>,
    outlet: mpsc::Sender<Arc<EventEnvelope>>,
    backlog: Arc<AtomicI64>,
    bus: Weak<BusInner>,
) {
    while let Some(envelope) = intake.recv().await {
        let sequence = envelope.sequence;
        if outlet.send(envelope).await.is_ok() {
            if backlog.fetch_sub(1, Ordering::SeqCst) <= 1 {
                if let Some(bus) = bus.upgrade() {
                    bus.idle.notify_waiters();
                }
            }
            continue;
        }

        intake.close();
        let mut lost = 1u64;
        while intake.try_recv().is_ok() {
            lost += 1;
        }
        backlog.fetch_sub(lost as i64, Ordering::SeqCst);
        if let Some(bus) = bus.upgrade() {
            bus.dropped.fetch_add(lost, Ordering::Relaxed);
            bus.idle.notify_waiters();
        }
        warn!(
            subscriber = id,
            lost,
            first_sequence = sequence,
            "Channel subscriber closed with envelopes pending"
        );
        return;
    }
    debug!(subscriber = id, "Channel forwarder stopped");
}

#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, topic: &str, delivery: Delivery) -> Unsubscribe {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let subscriber = Arc::new(Subscriber {
            id,
            topic: topic.to_string(),
            delivery,
            alive: AtomicBool::new(true),
        });

        match self.inner.subscribers.write() {
            Ok(mut subs) => subs.push(subscriber),
            Err(poisoned) => poisoned.into_inner().push(subscriber),
        }
        debug!(id, topic, "Subscriber registered");

        Unsubscribe {
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Register a synchronous callback for `topic` (or `WILDCARD`)
    pub fn subscribe<F>(&self, topic: &str, handler: F) -> Unsubscribe
    where
        F: Fn(&EventEnvelope) + Send + Sync + 'static,
    {
        self.register(topic, Delivery::Callback(Arc::new(handler)))
    }

    /// Register a bounded channel for `topic` (or `WILDCARD`). Envelopes that
    /// do not fit wait in the subscriber's intake queue. Must be called from
    /// within a Tokio runtime.
    pub fn subscribe_channel(
        &self,
        topic: &str,
        capacity: usize,
    ) -> (mpsc::Receiver<Arc<EventEnvelope>>, Unsubscribe) {
        let (outlet, rx) = mpsc::channel(capacity.max(1));
        let (intake, intake_rx) = mpsc::unbounded_channel();
        let backlog = Arc::new(AtomicI64::new(0));
        let delivery = ChannelDelivery {
            intake,
            outlet: outlet.clone(),
            backlog: Arc::clone(&backlog),
        };
        let handle = self.register(topic, Delivery::Channel(delivery));
        tokio::spawn(forward(
            handle.id,
            intake_rx,
            outlet,
            backlog,
            Arc::downgrade(&self.inner),
        ));
        (rx, handle)
    }

    /// Deliver `envelope` on its topic (`event_type`). Never waits on a
    /// subscriber.
    pub async fn publish(&self, envelope: EventEnvelope) -> PublishReport {
        let envelope = Arc::new(envelope);
        let topic = envelope.event_type.as_str();
        let subscribers = self.inner.read_subscribers();
        let mut report = PublishReport::default();
        let mut saw_dead = false;

        for sub in &subscribers {
            if !sub.alive.load(Ordering::SeqCst) {
                saw_dead = true;
                continue;
            }
            if !sub.matches(topic) {
                continue;
            }

            match &sub.delivery {
                Delivery::Callback(handler) => {
                    match catch_unwind(AssertUnwindSafe(|| handler(envelope.as_ref()))) {
                        Ok(()) => report.delivered += 1,
                        Err(_) => {
                            report.failed += 1;
                            self.inner.handler_failures.fetch_add(1, Ordering::Relaxed);
                            error!(
                                subscriber = sub.id,
                                topic,
                                sequence = envelope.sequence,
                                "Subscriber handler panicked"
                            );
                        }
                    }
                }
                Delivery::Channel(channel) => {
                    let sent = !channel.outlet.is_closed()
                        && channel.intake.send(Arc::clone(&envelope)).is_ok();
                    if sent {
                        report.delivered += 1;
                        let backlog = channel.backlog.fetch_add(1, Ordering::SeqCst) + 1;
                        if backlog % BACKLOG_WARN_STEP == 0 {
                            warn!(subscriber = sub.id, backlog, "Channel subscriber falling behind");
                        }
                    } else {
                        sub.alive.store(false, Ordering::SeqCst);
                        saw_dead = true;
                        report.failed += 1;
                        self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            subscriber = sub.id,
                            sequence = envelope.sequence,
                            "Channel subscriber closed, envelope dropped"
                        );
                    }
                }
            }
        }

        if saw_dead {
            self.inner.prune();
        }
        self.inner.published.fetch_add(1, Ordering::Relaxed);
        report
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .read_subscribers()
            .iter()
            .filter(|s| s.alive.load(Ordering::SeqCst))
            .count()
    }

    pub fn published_count(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }

    pub fn handler_failures(&self) -> u64 {
        self.inner.handler_failures.load(Ordering::Relaxed)
    }

    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Envelopes accepted for live channel subscribers but not yet received
    pub fn channel_backlog(&self) -> u64 {
        self.inner
            .read_subscribers()
            .iter()
            .filter(|s| s.alive.load(Ordering::SeqCst))
            .filter_map(|s| match &s.delivery {
                Delivery::Channel(channel) => Some(channel.backlog.load(Ordering::SeqCst).max(0) as u64),
                Delivery::Callback(_) => None,
            })
            .sum()
    }

    /// Wait until every live channel subscriber's intake has been moved into
    /// its receiver. Call after the last publish and before closing consumers.
    pub async fn drain_channels(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.channel_backlog() == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.published_count(),
            handler_failures: self.handler_failures(),
            channel_backlog: self.channel_backlog(),
            dropped: self.dropped_count(),
        }
    }
}
