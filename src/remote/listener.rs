//! Inbound side of the remote connector: accepts peer connections on a
//! Runtime's listening endpoint and answers `Lookup`/`Inspect`/`Shutdown`,
//! the exchange the `race inspect`/`race shutdown` CLI subcommands drive,
//! plus `Instantiate`/`LifecycleCmd` from a peer Supervisor resolving and
//! driving a `remote_uri`-declared Entity hosted on this process.
//!
//! One task per accepted connection, each draining frames in a loop —
//! the same per-connection task shape `connection_loop` uses on the
//! outbound side, just without the reconnect logic: a listener has nothing
//! to reconnect to.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::RaceError;
use crate::runtime::Runtime;

use super::client::from_wire;
use super::wire::{read_frame, write_frame, InstantiateResult, LookupResult, WireMessage};
use std::sync::Arc;

/// Bind `addr` and serve inbound connections until `shutdown` fires.
pub async fn serve(addr: SocketAddr, runtime: Arc<Runtime>, shutdown: CancellationToken) -> Result<(), RaceError> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "remote listener bound");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("remote listener observed shutdown");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let runtime = runtime.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    handle_connection(stream, peer, runtime, shutdown).await;
                });
            }
        }
    }
}

async fn handle_connection(mut stream: TcpStream, peer: SocketAddr, runtime: Arc<Runtime>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            frame = read_frame(&mut stream) => {
                let msg = match frame {
                    Ok(msg) => msg,
                    Err(e) => {
                        debug!(%peer, error = %e, "remote connection closed");
                        return;
                    }
                };
                if !dispatch(&mut stream, msg, &runtime).await {
                    return;
                }
            }
        }
    }
}

/// Handle one frame. Returns `false` when the connection should close.
async fn dispatch(stream: &mut TcpStream, msg: WireMessage, runtime: &Arc<Runtime>) -> bool {
    match msg {
        WireMessage::Handshake { .. } => true,

        WireMessage::Lookup { name } => {
            let reply = if runtime.entity_handle(&name).is_some() {
                WireMessage::LookupReply(LookupResult::Found {
                    runtime_uri: runtime.config().runtime_name.clone(),
                })
            } else {
                WireMessage::LookupReply(LookupResult::NotFound)
            };
            write_frame(stream, &reply).await.is_ok()
        }

        WireMessage::Inspect => {
            let entities = runtime
                .entity_states()
                .into_iter()
                .map(|(name, state)| (name, state.to_string()))
                .collect();
            write_frame(stream, &WireMessage::InspectReply { entities }).await.is_ok()
        }

        WireMessage::Shutdown => {
            runtime.shutdown().await;
            let _ = write_frame(stream, &WireMessage::ShutdownAck).await;
            false
        }

        WireMessage::Disconnect => false,

        WireMessage::Instantiate { name, implementation, config_json } => {
            let reply = match runtime.remote_instantiate(&name, &implementation, &config_json).await {
                Ok(()) => WireMessage::InstantiateReply(InstantiateResult::Started { runtime_uri: runtime.config().runtime_name.clone() }),
                Err(e) => WireMessage::InstantiateReply(InstantiateResult::Error { code: e.to_string() }),
            };
            write_frame(stream, &reply).await.is_ok()
        }

        WireMessage::LifecycleCmd { handle_name, cmd } => {
            let reply = match runtime.remote_lifecycle(&handle_name, from_wire(cmd)).await {
                Ok(()) => WireMessage::LifecycleAck { handle_name, ok: true, reason: None },
                Err(e) => WireMessage::LifecycleAck { handle_name, ok: false, reason: Some(e.to_string()) },
            };
            write_frame(stream, &reply).await.is_ok()
        }

        other => {
            warn!(?other, "remote listener received an unexpected frame outside a bus connector");
            true
        }
    }
}
