//! Entity — the unit of concurrent execution.
//!
//! An Entity is "at most one thread of control": its own worker task drains
//! lifecycle commands and bus messages strictly one at a time, the same
//! shape as the cron service / supervisor run-loops this crate is built
//! from, just with the subsystem-specific dispatch replaced by a trait
//! object the application implements.

pub mod lifecycle;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::inbox::{Inbox, OverflowPolicy};
use crate::bus::{local_handle, AddressableHandle, Bus, BusEvent, Payload};
use crate::channel::{Channel, Pattern};
use crate::error::RaceError;

pub use lifecycle::{LifecycleCommand, LifecyclePhase, LifecycleState};

/// The application-provided behavior behind one Entity.
///
/// Implementors receive lifecycle callbacks and bus messages through
/// [`EntityContext`]; the worker loop in this module is the only thing that
/// ever calls these methods, one at a time, so implementations never need
/// interior synchronization for their own state.
#[async_trait]
pub trait Entity: Send {
    /// Stable identifier used in logs and for the Entity's own Addressable
    /// handle name.
    fn name(&self) -> &str;

    /// Called once during the Supervisor's Initialize phase.
    async fn initialize(&mut self, ctx: &EntityContext) -> Result<(), RaceError> {
        let _ = ctx;
        Ok(())
    }

    /// Called once during the Start phase, after every Entity has
    /// initialized successfully.
    async fn start(&mut self, ctx: &EntityContext) -> Result<(), RaceError> {
        let _ = ctx;
        Ok(())
    }

    async fn pause(&mut self, ctx: &EntityContext) -> Result<(), RaceError> {
        let _ = ctx;
        Ok(())
    }

    async fn resume(&mut self, ctx: &EntityContext) -> Result<(), RaceError> {
        let _ = ctx;
        Ok(())
    }

    /// Called during shutdown, in reverse declaration order. Best-effort:
    /// the Supervisor enforces a bounded timeout and moves on regardless.
    async fn terminate(&mut self, ctx: &EntityContext) -> Result<(), RaceError> {
        let _ = ctx;
        Ok(())
    }

    /// Invoked once per bus message routed to this Entity's subscriptions.
    async fn on_message(&mut self, ctx: &EntityContext, event: BusEvent) {
        let _ = (ctx, event);
    }
}

/// The handle an Entity's callbacks use to talk back to the Runtime: publish,
/// subscribe/unsubscribe, and read the Clock.
#[derive(Clone)]
pub struct EntityContext {
    pub(crate) self_handle: AddressableHandle,
    pub(crate) bus: Arc<Bus>,
    pub(crate) clock: crate::clock::Clock,
}

impl EntityContext {
    pub async fn publish(&self, channel: impl Into<Channel>, payload: Payload) -> Result<(), RaceError> {
        self.bus.publish(&channel.into(), payload, self.self_handle.clone()).await
    }

    pub fn subscribe(&self, pattern: Pattern) -> bool {
        self.bus.subscribe(self.self_handle.clone(), pattern)
    }

    pub fn unsubscribe(&self, pattern: &Pattern) -> bool {
        self.bus.unsubscribe(&self.self_handle, pattern)
    }

    pub fn handle(&self) -> &AddressableHandle {
        &self.self_handle
    }

    pub async fn now(&self) -> crate::clock::SimTime {
        self.clock.now().await
    }
}

/// A spawned Entity's control surface, held by the Supervisor.
pub struct EntityHandle {
    pub name: Arc<str>,
    pub addressable: AddressableHandle,
    cmd_tx: mpsc::Sender<(LifecycleCommand, oneshot::Sender<Result<(), RaceError>>)>,
    worker: tokio::task::JoinHandle<()>,
    state: Arc<AtomicU8>,
}

impl EntityHandle {
    /// Send a lifecycle command and await its acknowledgment. The Supervisor
    /// is the only caller; this is a request/reply pair over an internal
    /// channel, not a bus publish.
    pub async fn send_lifecycle(&self, cmd: LifecycleCommand) -> Result<(), RaceError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send((cmd, tx))
            .await
            .map_err(|_| RaceError::lifecycle(self.name.as_ref(), cmd.phase_name(), "entity worker is gone"))?;
        rx.await
            .map_err(|_| RaceError::lifecycle(self.name.as_ref(), cmd.phase_name(), "entity worker dropped the reply"))?
    }

    /// Snapshot of the worker's current lifecycle state, readable without
    /// going through the command channel — used by the `inspect` CLI path.
    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub async fn join(self) {
        let _ = self.worker.await;
    }
}

/// Spawn an Entity's worker task.
///
/// Lifecycle commands always take priority over queued bus messages (the
/// `biased` `select!` below), matching the "control plane ahead of
/// application traffic" property every lane in this crate upholds.
pub fn spawn(
    mut entity: Box<dyn Entity>,
    bus: Arc<Bus>,
    clock: crate::clock::Clock,
    inbox_capacity: usize,
    overflow: OverflowPolicy,
    shutdown: CancellationToken,
) -> EntityHandle {
    spawn_with_subscriptions(entity, bus, clock, inbox_capacity, overflow, Vec::new(), shutdown)
}

/// Spawn an Entity, auto-subscribing it to `declared_subscriptions` the
/// moment it successfully enters `Initialized` — the config-declared
/// `readFrom` patterns ("Subscribing is declarative").
pub fn spawn_with_subscriptions(
    mut entity: Box<dyn Entity>,
    bus: Arc<Bus>,
    clock: crate::clock::Clock,
    inbox_capacity: usize,
    overflow: OverflowPolicy,
    declared_subscriptions: Vec<Pattern>,
    shutdown: CancellationToken,
) -> EntityHandle {
    let name: Arc<str> = entity.name().to_string().into();
    let (self_handle, inbox) = local_handle(name.clone(), inbox_capacity, overflow);
    let (cmd_tx, mut cmd_rx) =
        mpsc::channel::<(LifecycleCommand, oneshot::Sender<Result<(), RaceError>>)>(8);
    let state_cell = Arc::new(AtomicU8::new(LifecycleState::Uninitialized.as_u8()));

    let ctx = EntityContext {
        self_handle: self_handle.clone(),
        bus: bus.clone(),
        clock,
    };

    let worker_name = name.clone();
    let worker_state = state_cell.clone();
    let worker = tokio::spawn(async move {
        let mut state = LifecycleState::Uninitialized;
        info!(entity = %worker_name, "entity worker started");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    debug!(entity = %worker_name, "entity worker observed shutdown");
                    break;
                }

                Some((cmd, reply)) = cmd_rx.recv() => {
                    let result = apply_lifecycle(&mut *entity, &ctx, &mut state, cmd).await;
                    if result.is_ok() {
                        worker_state.store(state.as_u8(), Ordering::Release);
                    }
                    if result.is_ok() && cmd == LifecycleCommand::Initialize {
                        for pattern in &declared_subscriptions {
                            ctx.subscribe(pattern.clone());
                        }
                    }
                    if let Err(e) = &result {
                        warn!(entity = %worker_name, error = %e, "lifecycle command failed");
                    }
                    let _ = reply.send(result);
                }

                event = inbox.pop(), if state == LifecycleState::Running => {
                    entity.on_message(&ctx, event).await;
                }
            }
        }

        bus.unsubscribe_all(&self_handle);
        info!(entity = %worker_name, "entity worker exited");
    });

    EntityHandle {
        name,
        addressable: self_handle,
        cmd_tx,
        worker,
        state: state_cell,
    }
}

async fn apply_lifecycle(
    entity: &mut dyn Entity,
    ctx: &EntityContext,
    state: &mut LifecycleState,
    cmd: LifecycleCommand,
) -> Result<(), RaceError> {
    let target = cmd.target_state();
    if !state.can_transition_to(target) {
        return Err(RaceError::lifecycle(
            entity.name(),
            cmd.phase_name(),
            format!("illegal transition from {state:?} to {target:?}"),
        ));
    }

    let result = match cmd {
        LifecycleCommand::Initialize => entity.initialize(ctx).await,
        LifecycleCommand::Start => entity.start(ctx).await,
        LifecycleCommand::Pause => entity.pause(ctx).await,
        LifecycleCommand::Resume => entity.resume(ctx).await,
        LifecycleCommand::Terminate => entity.terminate(ctx).await,
    };

    if result.is_ok() {
        *state = target;
    }
    result
}
