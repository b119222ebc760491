//! Supervisor — drives every Entity through the lifecycle in declaration
//! order, and tears them down in reverse.
//!
//! Shape is carried over from the bot's `supervisor::run` message loop, but
//! where that loop routed bus requests to a single subsystem, this one
//! drives a `Vec<ManagedEntity>` (local or remote-proxied) through ordered
//! phases with per-phase timeouts, unwinding on the first failure the same way
//! `spawn_components` cancels sibling components on an error.

use std::time::Duration;

use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::entity::lifecycle::{LifecyclePhase, LifecycleState};
use crate::entity::{EntityHandle, LifecycleCommand};
use crate::error::RaceError;
use crate::remote::client::RemoteEntity;

/// Either a locally spawned Entity or a `remote_uri`-declared proxy resolved
/// (by Lookup, falling back to Start) against a peer Runtime. The Supervisor
/// drives both through the same ordered phases — a remote Entity's position
/// in the declaration order is honored exactly like a local one's.
pub enum ManagedEntity {
    Local(EntityHandle),
    Remote(RemoteEntity),
}

impl ManagedEntity {
    fn name(&self) -> &str {
        match self {
            ManagedEntity::Local(h) => h.name.as_ref(),
            ManagedEntity::Remote(r) => r.name.as_ref(),
        }
    }

    fn state(&self) -> LifecycleState {
        match self {
            ManagedEntity::Local(h) => h.state(),
            ManagedEntity::Remote(r) => r.state(),
        }
    }

    async fn send_lifecycle(&self, cmd: LifecycleCommand) -> Result<(), RaceError> {
        match self {
            ManagedEntity::Local(h) => h.send_lifecycle(cmd).await,
            ManagedEntity::Remote(r) => r.send_lifecycle(cmd).await,
        }
    }
}

/// Owns the ordered set of Entities for one Runtime and drives their
/// lifecycle. Entities are declared once, at construction, in the order
/// they should initialize/start — and are torn down in the reverse of that
/// order.
pub struct Supervisor {
    entities: Vec<ManagedEntity>,
}

impl Supervisor {
    pub fn new(entities: Vec<ManagedEntity>) -> Self {
        Supervisor { entities }
    }

    pub fn entity_names(&self) -> impl Iterator<Item = &str> {
        self.entities.iter().map(|e| e.name())
    }

    /// Current lifecycle state of every Entity, in declaration order — the
    /// data behind the `inspect` CLI path.
    pub fn entity_states(&self) -> Vec<(String, LifecycleState)> {
        self.entities.iter().map(|e| (e.name().to_string(), e.state())).collect()
    }

    /// The local Entity control surface for a declared name, if it is
    /// hosted on this process (not itself a `remote_uri` proxy) — used to
    /// forward an inbound `LifecycleCmd` frame from a peer Runtime to the
    /// Entity it names.
    pub fn local_entity_handle(&self, name: &str) -> Option<&EntityHandle> {
        self.entities.iter().find_map(|e| match e {
            ManagedEntity::Local(h) if h.name.as_ref() == name => Some(h),
            _ => None,
        })
    }

    /// Run Initialize then Start across every Entity, in declaration order.
    /// On the first failure, every already-succeeded Entity (for that
    /// phase) is torn down in reverse declaration order and the error is
    /// returned; Entities after the failing one never receive the command.
    pub async fn boot(&self) -> Result<(), RaceError> {
        self.run_phase(LifecycleCommand::Initialize, LifecyclePhase::Initialize)
            .await?;
        self.run_phase(LifecycleCommand::Start, LifecyclePhase::Start).await?;
        info!("all entities running");
        Ok(())
    }

    pub async fn pause_all(&self) -> Result<(), RaceError> {
        self.run_phase(LifecycleCommand::Pause, LifecyclePhase::Pause).await
    }

    pub async fn resume_all(&self) -> Result<(), RaceError> {
        self.run_phase(LifecycleCommand::Resume, LifecyclePhase::Resume).await
    }

    /// Issue Terminate to every Entity in reverse declaration order, each
    /// bounded by the Terminate phase timeout. An Entity that doesn't
    /// acknowledge in time is abandoned (logged, not retried) so shutdown
    /// always completes in bounded time.
    pub async fn shutdown(&self) {
        let phase_timeout = LifecycleState::default_timeout(LifecyclePhase::Terminate);
        for entity in self.entities.iter().rev() {
            match timeout(phase_timeout, entity.send_lifecycle(LifecycleCommand::Terminate)).await {
                Ok(Ok(())) => info!(entity = %entity.name(), "terminated"),
                Ok(Err(e)) => warn!(entity = %entity.name(), error = %e, "terminate returned failure, continuing shutdown"),
                Err(_) => warn!(entity = %entity.name(), "terminate timed out, abandoning"),
            }
        }
    }

    async fn run_phase(&self, cmd: LifecycleCommand, phase: LifecyclePhase) -> Result<(), RaceError> {
        let phase_timeout = LifecycleState::default_timeout(phase);
        let mut succeeded = Vec::with_capacity(self.entities.len());

        for entity in &self.entities {
            match timeout(phase_timeout, entity.send_lifecycle(cmd)).await {
                Ok(Ok(())) => {
                    succeeded.push(entity);
                }
                Ok(Err(e)) => {
                    error!(entity = %entity.name(), phase = cmd.phase_name(), error = %e, "phase failed");
                    self.unwind(succeeded, phase_timeout).await;
                    return Err(e);
                }
                Err(_) => {
                    let e = RaceError::lifecycle(entity.name(), cmd.phase_name(), "timed out");
                    error!(entity = %entity.name(), phase = cmd.phase_name(), "phase timed out");
                    self.unwind(succeeded, phase_timeout).await;
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    async fn unwind<'a>(&self, succeeded: Vec<&'a ManagedEntity>, phase_timeout: Duration) {
        for entity in succeeded.into_iter().rev() {
            let term_timeout = LifecycleState::default_timeout(LifecyclePhase::Terminate).max(phase_timeout);
            match timeout(term_timeout, entity.send_lifecycle(LifecycleCommand::Terminate)).await {
                Ok(Ok(())) => info!(entity = %entity.name(), "torn down after sibling failure"),
                Ok(Err(e)) => warn!(entity = %entity.name(), error = %e, "teardown returned failure"),
                Err(_) => warn!(entity = %entity.name(), "teardown timed out, abandoning"),
            }
        }
    }
}
