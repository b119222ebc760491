//! Clock — the scaled, pausable notion of time every Entity schedules
//! against.
//!
//! Grounded in the cron service's timer loop: a `BTreeMap<Instant, Entry>`
//! priority queue with a secondary id-index for O(log n) cancel, and a
//! `tokio::select!` that `sleep_until`s the next deadline or parks forever
//! (`std::future::pending`) when the queue is empty. The one addition over
//! the cron service is scale/base: `now()` is computed from a wall-clock
//! anchor plus an elapsed-`Instant` delta multiplied by a configurable rate,
//! so simulations can run faster, slower, or paused relative to real time.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, trace};

/// Simulation time, expressed as milliseconds since the Unix epoch under the
/// Clock's current base/scale — distinct from wall-clock time once `set_base`
/// or `set_scale` have been used.
pub type SimTime = u64;

#[derive(Debug, Clone)]
pub enum Schedule {
    /// Fire once at the given simulation-time deadline.
    Once { at: SimTime },
    /// Fire repeatedly, `every` apart, starting one period from now.
    Periodic { every: Duration },
}

enum Command {
    Schedule {
        schedule: Schedule,
        reply: oneshot::Sender<ScheduleId>,
        fire: mpsc::UnboundedSender<ScheduleId>,
    },
    Cancel {
        id: ScheduleId,
        reply: oneshot::Sender<bool>,
    },
    SetBase {
        base: SimTime,
    },
    SetScale {
        scale: f64,
    },
    Now {
        reply: oneshot::Sender<SimTime>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScheduleId(u64);

struct Entry {
    id: ScheduleId,
    periodic: Option<Duration>,
    fire: mpsc::UnboundedSender<ScheduleId>,
}

/// A handle to the running Clock. Cheap to clone; every Entity that wants to
/// schedule timers holds one.
#[derive(Clone)]
pub struct Clock {
    cmd_tx: mpsc::UnboundedSender<Command>,
    anchor: Arc<AnchorState>,
}

struct AnchorState {
    base_unix_ms: AtomicU64,
    anchor_instant_ms: AtomicU64,
    scale_millis: AtomicU64, // scale * 1000, fixed-point to stay atomic-friendly
}

impl AnchorState {
    fn scale(&self) -> f64 {
        self.scale_millis.load(Ordering::Relaxed) as f64 / 1000.0
    }
}

impl Clock {
    /// Start the Clock's background task. `shutdown` is observed the same
    /// way every other component observes it — cooperative, not forced.
    pub fn spawn(shutdown: CancellationToken) -> Self {
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<Command>();
        let anchor = Arc::new(AnchorState {
            base_unix_ms: AtomicU64::new(unix_now_ms()),
            anchor_instant_ms: AtomicU64::new(0),
            scale_millis: AtomicU64::new(1000),
        });

        let clock = Clock {
            cmd_tx,
            anchor: anchor.clone(),
        };

        let start = Instant::now();
        tokio::spawn(async move {
            let mut queue: BTreeMap<Instant, Entry> = BTreeMap::new();
            let mut next_id: u64 = 1;
            let mut id_to_deadline: HashMap<ScheduleId, Instant> = HashMap::new();

            info!("clock running");

            loop {
                let next_deadline = queue.keys().next().copied();

                tokio::select! {
                    biased;

                    _ = shutdown.cancelled() => {
                        info!("clock shutting down ({} active timers dropped)", queue.len());
                        break;
                    }

                    Some(cmd) = cmd_rx.recv() => {
                        match cmd {
                            Command::Schedule { schedule, reply, fire } => {
                                let id = ScheduleId(next_id);
                                next_id += 1;
                                let (deadline, periodic) = match schedule {
                                    Schedule::Once { at } => (sim_to_instant(&anchor, start, at), None),
                                    Schedule::Periodic { every } => (Instant::now() + every, Some(every)),
                                };
                                let entry = Entry { id, periodic, fire };
                                let actual = insert_unique(&mut queue, deadline, entry);
                                id_to_deadline.insert(id, actual);
                                trace!(?id, "timer scheduled");
                                let _ = reply.send(id);
                            }
                            Command::Cancel { id, reply } => {
                                let removed = if let Some(deadline) = id_to_deadline.remove(&id) {
                                    queue.remove(&deadline);
                                    true
                                } else {
                                    false
                                };
                                let _ = reply.send(removed);
                            }
                            Command::SetBase { base } => {
                                anchor.base_unix_ms.store(base, Ordering::Relaxed);
                                anchor.anchor_instant_ms
                                    .store(start.elapsed().as_millis() as u64, Ordering::Relaxed);
                            }
                            Command::SetScale { scale } => {
                                anchor.base_unix_ms.store(current_sim_ms(&anchor, start), Ordering::Relaxed);
                                anchor.anchor_instant_ms
                                    .store(start.elapsed().as_millis() as u64, Ordering::Relaxed);
                                anchor.scale_millis.store((scale * 1000.0) as u64, Ordering::Relaxed);
                            }
                            Command::Now { reply } => {
                                let _ = reply.send(current_sim_ms(&anchor, start));
                            }
                        }
                    }

                    _ = async {
                        match next_deadline {
                            Some(d) => tokio::time::sleep_until(d).await,
                            None => std::future::pending().await,
                        }
                    } => {
                        if let Some((deadline, entry)) = queue.pop_first() {
                            id_to_deadline.remove(&entry.id);
                            let _ = entry.fire.send(entry.id);
                            if let Some(period) = entry.periodic {
                                let next = deadline + period;
                                let id = entry.id;
                                let fire = entry.fire.clone();
                                let reinserted = Entry { id, periodic: Some(period), fire };
                                let actual = insert_unique(&mut queue, next, reinserted);
                                id_to_deadline.insert(id, actual);
                            }
                        }
                    }
                }
            }
        });

        clock
    }

    /// Current simulation time, honoring `set_base`/`set_scale`.
    pub async fn now(&self) -> SimTime {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Now { reply: tx }).is_err() {
            return unix_now_ms();
        }
        rx.await.unwrap_or_else(|_| unix_now_ms())
    }

    /// Schedule a one-shot fire at a sim-time deadline. Returns a channel
    /// the caller polls/receives the fire notification on, plus a cancel id.
    pub async fn schedule_once(&self, at: SimTime) -> (ScheduleId, mpsc::UnboundedReceiver<ScheduleId>) {
        self.schedule(Schedule::Once { at }).await
    }

    pub async fn schedule_periodic(&self, every: Duration) -> (ScheduleId, mpsc::UnboundedReceiver<ScheduleId>) {
        self.schedule(Schedule::Periodic { every }).await
    }

    async fn schedule(&self, schedule: Schedule) -> (ScheduleId, mpsc::UnboundedReceiver<ScheduleId>) {
        let (fire_tx, fire_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.cmd_tx.send(Command::Schedule {
            schedule,
            reply: reply_tx,
            fire: fire_tx,
        });
        let id = reply_rx.await.expect("clock task is alive for the Runtime's lifetime");
        (id, fire_rx)
    }

    /// Cancel a pending timer. Idempotent: cancelling twice or cancelling an
    /// already-fired one-shot returns `false` the second time.
    pub async fn cancel(&self, id: ScheduleId) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Cancel { id, reply: tx }).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Re-anchor simulation time to `base` (unix millis), taking effect from
    /// now onward — does not retroactively move already-fired timers.
    pub fn set_base(&self, base: SimTime) {
        let _ = self.cmd_tx.send(Command::SetBase { base });
    }

    /// Change the rate simulation time advances relative to wall-clock time.
    /// `1.0` is real-time, `2.0` runs twice as fast, `0.0` pauses.
    pub fn set_scale(&self, scale: f64) {
        let _ = self.cmd_tx.send(Command::SetScale { scale });
    }
}

fn current_sim_ms(anchor: &AnchorState, start: Instant) -> SimTime {
    let base = anchor.base_unix_ms.load(Ordering::Relaxed);
    let anchor_ms = anchor.anchor_instant_ms.load(Ordering::Relaxed);
    let now_ms = start.elapsed().as_millis() as u64;
    let elapsed = now_ms.saturating_sub(anchor_ms);
    let scaled = (elapsed as f64 * anchor.scale()) as u64;
    base + scaled
}

fn sim_to_instant(anchor: &AnchorState, start: Instant, target: SimTime) -> Instant {
    let now_sim = current_sim_ms(anchor, start);
    if target <= now_sim {
        return Instant::now();
    }
    let scale = anchor.scale();
    let delta_sim = (target - now_sim) as f64;
    let delta_wall_ms = if scale > 0.0 { delta_sim / scale } else { f64::MAX };
    Instant::now() + Duration::from_millis(delta_wall_ms.min(u64::MAX as f64) as u64)
}

fn unix_now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn insert_unique(queue: &mut BTreeMap<Instant, Entry>, mut deadline: Instant, entry: Entry) -> Instant {
    while queue.contains_key(&deadline) {
        deadline += Duration::from_nanos(1);
    }
    queue.insert(deadline, entry);
    deadline
}
