//! Bounded per-Entity mailbox with a configurable overflow policy.
//!
//! Entity inboxes are single-consumer (the worker processing that Entity)
//! but multi-producer (every publisher that targets it). A plain bounded
//! `tokio::sync::mpsc` only gives us one overflow behavior ("fail the
//! send"); the runtime's resource policy additionally wants drop-oldest
//! (the default) and drop-newest, so the queue itself is hand-rolled around
//! a `Mutex<VecDeque<_>>` plus a `Notify`, the way the cron service's timer
//! loop parks on a condition rather than polling.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

use crate::bus::BusEvent;

/// What happens when `push` is called against a full inbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Evict the oldest queued event to make room (the runtime default).
    DropOldest,
    /// Reject the incoming event, keeping the queue as-is.
    DropNewest,
    /// Reject the incoming event and report a classified error upstream.
    HardFail,
}

impl Default for OverflowPolicy {
    fn default() -> Self {
        OverflowPolicy::DropOldest
    }
}

/// Push-side result. `Enqueued` and `DroppedOldest`/`DroppedNewest` are all
/// "the publish succeeded" outcomes ("Returns once enqueueing is
/// complete"); only `Rejected` (hard-fail policy) is a publisher-visible
/// error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Enqueued,
    DroppedOldest,
    DroppedNewest,
    Rejected,
}

struct Inner {
    queue: Mutex<VecDeque<BusEvent>>,
    notify: Notify,
    capacity: usize,
    policy: OverflowPolicy,
    dropped: AtomicU64,
}

/// A cloneable handle to one Entity's mailbox.
#[derive(Clone)]
pub struct Inbox {
    inner: Arc<Inner>,
}

impl Inbox {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Inbox {
            inner: Arc::new(Inner {
                queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
                notify: Notify::new(),
                capacity: capacity.max(1),
                policy,
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Total events dropped (either policy) since creation.
    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Enqueue a single event. Never blocks the caller on subscriber
    /// processing — the Bus's `publish` must never synchronously invoke
    /// subscriber code.
    pub async fn push(&self, event: BusEvent) -> PushOutcome {
        let mut q = self.inner.queue.lock().await;
        if q.len() < self.inner.capacity {
            q.push_back(event);
            drop(q);
            self.inner.notify.notify_one();
            return PushOutcome::Enqueued;
        }

        match self.inner.policy {
            OverflowPolicy::DropOldest => {
                q.pop_front();
                q.push_back(event);
                drop(q);
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                self.inner.notify.notify_one();
                PushOutcome::DroppedOldest
            }
            OverflowPolicy::DropNewest => {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                PushOutcome::DroppedNewest
            }
            OverflowPolicy::HardFail => {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                PushOutcome::Rejected
            }
        }
    }

    /// Pop the next event, awaiting one if the queue is currently empty.
    /// FIFO: callers that push in order observe events in that same order
    /// (per-(publisher, subscriber, channel) ordering is a property of the
    /// publish path enqueueing subscribers in declaration order, not of
    /// this queue, which simply never reorders what lands in it).
    pub async fn pop(&self) -> BusEvent {
        loop {
            {
                let mut q = self.inner.queue.lock().await;
                if let Some(event) = q.pop_front() {
                    return event;
                }
            }
            self.inner.notify.notified().await;
        }
    }

    /// Non-blocking pop, for workers that interleave inbox draining with a
    /// `tokio::select!` over other events (e.g. a priority lifecycle lane).
    pub async fn try_pop(&self) -> Option<BusEvent> {
        let mut q = self.inner.queue.lock().await;
        q.pop_front()
    }

    pub async fn len(&self) -> usize {
        self.inner.queue.lock().await.len()
    }
}
