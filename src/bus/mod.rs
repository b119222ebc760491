//! The Bus — in-process publish-subscribe dispatcher.
//!
//! Generalizes a method-routed request/reply bus into path-pattern
//! pub/sub: instead of one `mpsc` per RPC method prefix, every
//! [`AddressableHandle`] owns an [`Inbox`] and the Bus holds a
//! copy-on-write table of `(handle, pattern)` subscriptions (`arc-swap`,
//! the same technique `up-streamer` uses for its route table) so
//! `publish` never blocks a concurrent `subscribe`/`unsubscribe`.

pub mod inbox;

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use tracing::{debug, trace, warn};

use crate::channel::{Channel, Pattern};
use crate::error::RaceError;
use inbox::{Inbox, OverflowPolicy, PushOutcome};

/// Opaque publish payload. The Bus never inspects it; codecs in the remote
/// connector are the only code that knows how to serialize concrete types.
pub type Payload = Arc<dyn Any + Send + Sync>;

/// The sink behind an [`AddressableHandle`] — a local Entity inbox, or (from
/// the remote connector) a proxy that forwards onto a peer Runtime.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn enqueue(&self, event: BusEvent) -> PushOutcome;
}

#[async_trait]
impl Sink for Inbox {
    async fn enqueue(&self, event: BusEvent) -> PushOutcome {
        self.push(event).await
    }
}

/// A sink that always rejects — backs the "anonymous" sender sentinel and
/// any handle that should never itself receive bus traffic.
struct NullSink;

#[async_trait]
impl Sink for NullSink {
    async fn enqueue(&self, _event: BusEvent) -> PushOutcome {
        PushOutcome::Rejected
    }
}

/// An opaque, equality-comparable reference to an Entity.
///
/// Equality/hash are defined over the `Arc` pointer identity of the
/// underlying sink, the same trick `up-streamer`'s `ComparableTransport`
/// uses for its `Arc<dyn UTransport>` handles — two clones of the same
/// handle compare equal, two handles to different Entities never do.
#[derive(Clone)]
pub struct AddressableHandle {
    name: Arc<str>,
    sink: Arc<dyn Sink>,
}

impl AddressableHandle {
    pub fn new(name: impl Into<Arc<str>>, sink: Arc<dyn Sink>) -> Self {
        AddressableHandle {
            name: name.into(),
            sink,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sentinel handle used when a publish is initiated from a non-Entity
    /// context (a timer callback, an I/O thread) per the "Implicit sender
    /// context" design note.
    pub fn anonymous() -> Self {
        AddressableHandle::new("anonymous", Arc::new(NullSink))
    }

    pub(crate) async fn enqueue(&self, event: BusEvent) -> PushOutcome {
        self.sink.enqueue(event).await
    }
}

impl PartialEq for AddressableHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.sink, &other.sink)
    }
}

impl Eq for AddressableHandle {}

impl Hash for AddressableHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.sink).hash(state);
    }
}

impl fmt::Debug for AddressableHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressableHandle")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// The `(channel, payload, sender)` triple routed by the Bus.
#[derive(Clone)]
pub struct BusEvent {
    pub channel: Channel,
    pub payload: Payload,
    pub sender: AddressableHandle,
}

impl BusEvent {
    pub fn new(channel: Channel, payload: Payload, sender: AddressableHandle) -> Self {
        BusEvent {
            channel,
            payload,
            sender,
        }
    }
}

impl fmt::Debug for BusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusEvent")
            .field("channel", &self.channel)
            .field("sender", &self.sender.name())
            .finish_non_exhaustive()
    }
}

/// A held `(handle, pattern)` registration.
#[derive(Clone)]
struct Subscription {
    handle: AddressableHandle,
    pattern: Pattern,
}

impl PartialEq for Subscription {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle && self.pattern == other.pattern
    }
}

/// Failure counters surfaced through `Runtime::metrics()`.
#[derive(Default)]
pub struct BusMetrics {
    pub dropped_disconnected_remote: AtomicU64,
    pub dropped_overflow: AtomicU64,
    pub enqueue_hard_fail: AtomicU64,
}

impl BusMetrics {
    pub fn snapshot(&self) -> BusMetricsSnapshot {
        BusMetricsSnapshot {
            dropped_disconnected_remote: self.dropped_disconnected_remote.load(Ordering::Relaxed),
            dropped_overflow: self.dropped_overflow.load(Ordering::Relaxed),
            enqueue_hard_fail: self.enqueue_hard_fail.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BusMetricsSnapshot {
    pub dropped_disconnected_remote: u64,
    pub dropped_overflow: u64,
    pub enqueue_hard_fail: u64,
}

/// The in-process publish-subscribe dispatcher.
///
/// The subscription table is copy-on-write (`ArcSwap<Vec<Subscription>>`):
/// `publish` reads an immutable snapshot and never contends with a concurrent
/// `subscribe`/`unsubscribe`. Matching subscribers are enqueued in the order
/// they appear in that snapshot — i.e. declaration order — which is how
/// the per-(publisher, subscriber, channel) FIFO guarantee is upheld:
/// a sending Entity only ever has one `publish` in flight at a time (it is
/// itself sequentially processed), so successive publishes from the same
/// sender enqueue to the same subscriber inbox strictly one after another.
pub struct Bus {
    subscriptions: ArcSwap<Vec<Subscription>>,
    pub metrics: Arc<BusMetrics>,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus {
    pub fn new() -> Self {
        Bus {
            subscriptions: ArcSwap::from_pointee(Vec::new()),
            metrics: Arc::new(BusMetrics::default()),
        }
    }

    /// Register a subscription. Idempotent: subscribing twice with the same
    /// `(handle, pattern)` pair is a no-op and returns `false`.
    pub fn subscribe(&self, handle: AddressableHandle, pattern: Pattern) -> bool {
        let mut inserted = false;
        self.subscriptions.rcu(|cur| {
            if cur
                .iter()
                .any(|s| s.handle == handle && s.pattern == pattern)
            {
                inserted = false;
                return cur.clone();
            }
            inserted = true;
            let mut next = (**cur).clone();
            next.push(Subscription {
                handle: handle.clone(),
                pattern: pattern.clone(),
            });
            Arc::new(next)
        });
        if inserted {
            debug!(handle = handle.name(), pattern = %pattern, "subscribed");
        }
        inserted
    }

    /// Remove a subscription. Idempotent: removing an absent pair is a no-op.
    pub fn unsubscribe(&self, handle: &AddressableHandle, pattern: &Pattern) -> bool {
        let mut removed = false;
        self.subscriptions.rcu(|cur| {
            if !cur.iter().any(|s| &s.handle == handle && &s.pattern == pattern) {
                removed = false;
                return cur.clone();
            }
            removed = true;
            let next: Vec<Subscription> = cur
                .iter()
                .filter(|s| !(&s.handle == handle && &s.pattern == pattern))
                .cloned()
                .collect();
            Arc::new(next)
        });
        removed
    }

    /// Remove every subscription held by `handle` — called on Entity
    /// termination.
    pub fn unsubscribe_all(&self, handle: &AddressableHandle) -> usize {
        let mut removed = 0usize;
        self.subscriptions.rcu(|cur| {
            removed = cur.iter().filter(|s| &s.handle == handle).count();
            let next: Vec<Subscription> = cur.iter().filter(|s| &s.handle != handle).cloned().collect();
            Arc::new(next)
        });
        if removed > 0 {
            debug!(handle = handle.name(), removed, "unsubscribed all");
        }
        removed
    }

    /// Publish a payload to every subscriber whose pattern matches `channel`.
    /// Returns once enqueueing to every matching subscriber has completed —
    /// delivery into each subscriber's own processing loop is asynchronous.
    ///
    /// An enqueue failure under a hard-fail overflow policy is surfaced to
    /// the caller as `RaceError::BusEnqueue`; every other outcome (including
    /// drop-oldest/drop-newest and an unmatched publish) is silent,
    /// with counters incremented on `self.metrics`.
    pub async fn publish(
        &self,
        channel: &Channel,
        payload: Payload,
        sender: AddressableHandle,
    ) -> Result<(), RaceError> {
        let snapshot = self.subscriptions.load();
        let mut hard_fail_channel: Option<String> = None;

        for sub in snapshot.iter() {
            if !sub.pattern.matches(channel) {
                continue;
            }
            let event = BusEvent::new(channel.clone(), payload.clone(), sender.clone());
            match sub.handle.enqueue(event).await {
                PushOutcome::Enqueued => {}
                PushOutcome::DroppedOldest | PushOutcome::DroppedNewest => {
                    self.metrics.dropped_overflow.fetch_add(1, Ordering::Relaxed);
                }
                PushOutcome::Rejected => {
                    self.metrics.enqueue_hard_fail.fetch_add(1, Ordering::Relaxed);
                    hard_fail_channel.get_or_insert_with(|| channel.to_string());
                }
            }
        }

        if snapshot.iter().all(|s| !s.pattern.matches(channel)) {
            trace!(%channel, "publish matched no subscribers");
        }

        match hard_fail_channel {
            Some(channel) => Err(RaceError::BusEnqueue {
                channel,
                reason: "subscriber inbox full under hard-fail policy".into(),
            }),
            None => Ok(()),
        }
    }

    /// Publish that treats a disconnected remote proxy sink the same as any
    /// other silently-dropped delivery, bumping the dedicated remote counter
    /// instead of the generic overflow one. Used by the remote connector's
    /// proxy sinks, which return `Rejected` to mean "peer unreachable" rather
    /// than "hard-fail policy."
    pub fn note_remote_disconnected_drop(&self) {
        self.metrics
            .dropped_disconnected_remote
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.load().len()
    }
}

/// Construct a local `AddressableHandle` backed by a fresh bounded inbox,
/// returning both the handle (to hand to the Bus / other Entities) and the
/// inbox (for the Entity's own processing loop to drain).
pub fn local_handle(
    name: impl Into<Arc<str>>,
    capacity: usize,
    policy: OverflowPolicy,
) -> (AddressableHandle, Inbox) {
    let inbox = Inbox::new(capacity, policy);
    let handle = AddressableHandle::new(name, Arc::new(inbox.clone()));
    (handle, inbox)
}
