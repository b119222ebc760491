//! Outbound control-plane client: `Lookup`/`Instantiate`/`LifecycleCmd`
//! request/reply round trips against a peer Runtime, layered over an
//! `OutboundLink`'s frame pump. This is the Supervisor-facing half of the
//! Remote connector's two deployment modes — Lookup finds an Entity the
//! peer already hosts, Start (`Instantiate`) asks the peer to create it
//! when Lookup comes back empty.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::debug;

use crate::entity::{LifecycleCommand, LifecycleState};
use crate::error::RaceError;

use super::wire::{InstantiateResult, LookupResult, WireLifecycleCommand, WireMessage};
use super::{OutboundLink, RuntimeUri};

/// How long a Lookup/Instantiate/LifecycleCmd request waits for the peer's
/// reply before the phase it's running in fails.
pub const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(10);

fn to_wire(cmd: LifecycleCommand) -> WireLifecycleCommand {
    match cmd {
        LifecycleCommand::Initialize => WireLifecycleCommand::Initialize,
        LifecycleCommand::Start => WireLifecycleCommand::Start,
        LifecycleCommand::Pause => WireLifecycleCommand::Pause,
        LifecycleCommand::Resume => WireLifecycleCommand::Resume,
        LifecycleCommand::Terminate => WireLifecycleCommand::Terminate,
    }
}

pub fn from_wire(cmd: WireLifecycleCommand) -> LifecycleCommand {
    match cmd {
        WireLifecycleCommand::Initialize => LifecycleCommand::Initialize,
        WireLifecycleCommand::Start => LifecycleCommand::Start,
        WireLifecycleCommand::Pause => LifecycleCommand::Pause,
        WireLifecycleCommand::Resume => LifecycleCommand::Resume,
        WireLifecycleCommand::Terminate => LifecycleCommand::Terminate,
    }
}

/// One peer connection's control-plane half, demultiplexed from the same
/// inbound frame channel a `BusConnector` would drain `BusEvent` frames
/// from. A `RemoteLink`'s requests are only ever issued one at a time (the
/// Supervisor drives one Entity through one phase at a time), so a single
/// pending-reply slot is enough — no per-request correlation id needed.
pub struct RemoteLink {
    link: Arc<OutboundLink>,
    pending: Arc<Mutex<Option<oneshot::Sender<WireMessage>>>>,
}

impl RemoteLink {
    pub fn wrap(link: Arc<OutboundLink>, mut inbound_rx: mpsc::UnboundedReceiver<WireMessage>) -> Arc<Self> {
        let pending = Arc::new(Mutex::new(None));
        let reader_pending = pending.clone();

        tokio::spawn(async move {
            while let Some(msg) = inbound_rx.recv().await {
                match msg {
                    WireMessage::LookupReply(_) | WireMessage::InstantiateReply(_) | WireMessage::LifecycleAck { .. } => {
                        if let Some(tx) = reader_pending.lock().await.take() {
                            let _ = tx.send(msg);
                        }
                    }
                    other => debug!(?other, "remote control client received a frame outside its control plane"),
                }
            }
        });

        Arc::new(RemoteLink { link, pending })
    }

    pub fn peer(&self) -> &RuntimeUri {
        &self.link.uri
    }

    async fn wait_connected(&self, timeout: Duration) -> Result<(), RaceError> {
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.link.is_connected() {
            if tokio::time::Instant::now() >= deadline {
                return Err(RaceError::RemoteTransport {
                    peer: self.peer().to_string(),
                    reason: "timed out connecting".into(),
                });
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        Ok(())
    }

    async fn request(&self, msg: WireMessage, timeout: Duration) -> Result<WireMessage, RaceError> {
        self.wait_connected(timeout).await?;

        let (tx, rx) = oneshot::channel();
        *self.pending.lock().await = Some(tx);
        self.link.send(msg)?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(RaceError::RemoteTransport {
                peer: self.peer().to_string(),
                reason: "control link closed before replying".into(),
            }),
            Err(_) => Err(RaceError::RemoteTransport {
                peer: self.peer().to_string(),
                reason: "timed out waiting for reply".into(),
            }),
        }
    }
}

/// A Supervisor-managed slot for one `remote_uri`-declared Entity: resolved
/// by Lookup (falling back to Start) during Initialize, then driven through
/// the rest of its lifecycle by forwarding `LifecycleCmd` frames to the same
/// name on the peer Runtime.
pub struct RemoteEntity {
    pub name: Arc<str>,
    implementation: String,
    options_json: String,
    link: Arc<RemoteLink>,
    state: AtomicU8,
}

impl RemoteEntity {
    pub fn new(name: impl Into<Arc<str>>, implementation: String, options_json: String, link: Arc<RemoteLink>) -> Self {
        RemoteEntity {
            name: name.into(),
            implementation,
            options_json,
            link,
            state: AtomicU8::new(LifecycleState::Uninitialized.as_u8()),
        }
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub async fn send_lifecycle(&self, cmd: LifecycleCommand) -> Result<(), RaceError> {
        if cmd == LifecycleCommand::Initialize {
            self.resolve().await?;
        }

        let reply = self
            .link
            .request(
                WireMessage::LifecycleCmd { handle_name: self.name.to_string(), cmd: to_wire(cmd) },
                DEFAULT_REMOTE_TIMEOUT,
            )
            .await?;

        match reply {
            WireMessage::LifecycleAck { ok: true, .. } => {
                self.state.store(cmd.target_state().as_u8(), Ordering::Release);
                Ok(())
            }
            WireMessage::LifecycleAck { ok: false, reason, .. } => Err(RaceError::lifecycle(
                self.name.as_ref(),
                cmd.phase_name(),
                reason.unwrap_or_else(|| "peer rejected lifecycle command".into()),
            )),
            other => Err(RaceError::RemoteTransport {
                peer: self.link.peer().to_string(),
                reason: format!("unexpected reply to LifecycleCmd: {other:?}"),
            }),
        }
    }

    /// The two deployment modes: Lookup finds an Entity the peer already
    /// hosts; Start (`Instantiate`) asks the peer to create it from its own
    /// registry when Lookup comes back empty.
    async fn resolve(&self) -> Result<(), RaceError> {
        let reply = self
            .link
            .request(WireMessage::Lookup { name: self.name.to_string() }, DEFAULT_REMOTE_TIMEOUT)
            .await?;
        if let WireMessage::LookupReply(LookupResult::Found { .. }) = reply {
            return Ok(());
        }

        let reply = self
            .link
            .request(
                WireMessage::Instantiate {
                    name: self.name.to_string(),
                    implementation: self.implementation.clone(),
                    config_json: self.options_json.clone(),
                },
                DEFAULT_REMOTE_TIMEOUT,
            )
            .await?;

        match reply {
            WireMessage::InstantiateReply(InstantiateResult::Started { .. }) => Ok(()),
            WireMessage::InstantiateReply(InstantiateResult::Error { code }) => {
                Err(RaceError::lifecycle(self.name.as_ref(), "Initialize", format!("remote start failed: {code}")))
            }
            other => Err(RaceError::RemoteTransport {
                peer: self.link.peer().to_string(),
                reason: format!("unexpected reply to Instantiate: {other:?}"),
            }),
        }
    }
}
