//! Remote connector — cross-process Entity lookup/startup and Bus bridging.
//!
//! `OutboundLink` owns one TCP connection to a peer Runtime and reconnects
//! with exponential backoff, the same "keep a background task alive across
//! reconnects, report failures through a counter rather than buffering"
//! shape the egress worker in `up-streamer` uses for its transport-forwarder
//! loop. `BusConnector` is the local proxy Entity that bridges non-local
//! channels onto the wire in both directions, one per peer.

pub mod client;
pub mod codec;
pub mod listener;
pub mod wire;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{AddressableHandle, Bus, BusEvent, Payload, Sink};
use crate::bus::inbox::PushOutcome;
use crate::channel::Channel;
use crate::error::RaceError;
use codec::CodecRegistry;
use wire::{read_frame, write_frame, WireMessage};

/// `race://host:port/runtime-name` — the stable address of a Runtime's
/// single listening endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuntimeUri {
    pub host: String,
    pub port: u16,
    pub name: String,
}

impl fmt::Display for RuntimeUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "race://{}:{}/{}", self.host, self.port, self.name)
    }
}

impl FromStr for RuntimeUri {
    type Err = RaceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s.strip_prefix("race://").ok_or_else(|| RaceError::Config(format!("not a race:// uri: {s}")))?;
        let (authority, name) = rest.split_once('/').ok_or_else(|| RaceError::Config(format!("missing runtime name in uri: {s}")))?;
        let (host, port) = authority.split_once(':').ok_or_else(|| RaceError::Config(format!("missing port in uri: {s}")))?;
        let port: u16 = port.parse().map_err(|_| RaceError::Config(format!("invalid port in uri: {s}")))?;
        if name.is_empty() {
            return Err(RaceError::Config(format!("empty runtime name in uri: {s}")));
        }
        Ok(RuntimeUri { host: host.to_string(), port, name: name.to_string() })
    }
}

/// Doubling backoff with a cap, reset on a successful connection.
pub struct ExponentialBackoff {
    current: Duration,
    max: Duration,
    initial: Duration,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        ExponentialBackoff { current: initial, max, initial }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[derive(Default)]
pub struct RemoteMetrics {
    pub send_failures: AtomicU64,
    pub reconnect_attempts: AtomicU64,
    pub serialization_failures: AtomicU64,
}

/// One outbound connection to a peer Runtime, maintained across reconnects.
/// `send` never buffers: while disconnected it fails immediately and bumps
/// `metrics.send_failures` rather than queuing.
pub struct OutboundLink {
    pub uri: RuntimeUri,
    outbound_tx: mpsc::UnboundedSender<WireMessage>,
    connected: Arc<AtomicBool>,
    pub metrics: Arc<RemoteMetrics>,
}

impl OutboundLink {
    pub fn spawn(
        uri: RuntimeUri,
        local_uri: RuntimeUri,
        inbound_tx: mpsc::UnboundedSender<WireMessage>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<WireMessage>();
        let connected = Arc::new(AtomicBool::new(false));
        let metrics = Arc::new(RemoteMetrics::default());

        let link = Arc::new(OutboundLink {
            uri: uri.clone(),
            outbound_tx,
            connected: connected.clone(),
            metrics: metrics.clone(),
        });

        tokio::spawn(connection_loop(uri, local_uri, connected, metrics, outbound_rx, inbound_tx, shutdown));

        link
    }

    /// Treat an already-accepted connection as the passive side of a link:
    /// pump frames until the peer disconnects, with no reconnect attempt —
    /// a listening Runtime has nothing to dial back into. The counterpart
    /// to `spawn`'s active dial-and-backoff loop, for a Runtime's own
    /// listening endpoint bridging a peer's `BusConnector`.
    pub fn spawn_accepted(
        stream: TcpStream,
        peer_uri: RuntimeUri,
        inbound_tx: mpsc::UnboundedSender<WireMessage>,
    ) -> Arc<Self> {
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<WireMessage>();
        let connected = Arc::new(AtomicBool::new(true));
        let metrics = Arc::new(RemoteMetrics::default());

        let link = Arc::new(OutboundLink {
            uri: peer_uri.clone(),
            outbound_tx,
            connected: connected.clone(),
            metrics: metrics.clone(),
        });

        tokio::spawn(async move {
            let (mut read_half, mut write_half) = stream.into_split();
            run_link(&mut read_half, &mut write_half, &mut outbound_rx, &inbound_tx).await;
            connected.store(false, Ordering::Relaxed);
            info!(peer = %peer_uri, "accepted remote link closed");
        });

        link
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn send(&self, msg: WireMessage) -> Result<(), RaceError> {
        if !self.connected.load(Ordering::Relaxed) {
            self.metrics.send_failures.fetch_add(1, Ordering::Relaxed);
            return Err(RaceError::RemoteTransport {
                peer: self.uri.to_string(),
                reason: "not connected".into(),
            });
        }
        self.outbound_tx.send(msg).map_err(|_| {
            self.metrics.send_failures.fetch_add(1, Ordering::Relaxed);
            RaceError::RemoteTransport {
                peer: self.uri.to_string(),
                reason: "connection task is gone".into(),
            }
        })
    }
}

async fn connection_loop(
    uri: RuntimeUri,
    local_uri: RuntimeUri,
    connected: Arc<AtomicBool>,
    metrics: Arc<RemoteMetrics>,
    mut outbound_rx: mpsc::UnboundedReceiver<WireMessage>,
    inbound_tx: mpsc::UnboundedSender<WireMessage>,
    shutdown: CancellationToken,
) {
    let mut backoff = ExponentialBackoff::new(Duration::from_millis(200), Duration::from_secs(30));

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        match TcpStream::connect((uri.host.as_str(), uri.port)).await {
            Ok(stream) => {
                let (mut read_half, mut write_half) = stream.into_split();
                let handshake = WireMessage::Handshake {
                    uri: local_uri.to_string(),
                    runtime_name: local_uri.name.clone(),
                };
                if write_frame(&mut write_half, &handshake).await.is_err() {
                    metrics.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
                } else {
                    backoff.reset();
                    connected.store(true, Ordering::Relaxed);
                    info!(peer = %uri, "remote link established");

                    run_link(&mut read_half, &mut write_half, &mut outbound_rx, &inbound_tx).await;

                    connected.store(false, Ordering::Relaxed);
                    metrics.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
                    warn!(peer = %uri, "remote link dropped");
                }
            }
            Err(e) => {
                metrics.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
                debug!(peer = %uri, error = %e, "remote connect attempt failed");
            }
        }

        if shutdown.is_cancelled() {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(backoff.next_delay()) => {}
            _ = shutdown.cancelled() => break,
        }
    }
}

async fn run_link(
    read_half: &mut OwnedReadHalf,
    write_half: &mut OwnedWriteHalf,
    outbound_rx: &mut mpsc::UnboundedReceiver<WireMessage>,
    inbound_tx: &mpsc::UnboundedSender<WireMessage>,
) {
    loop {
        tokio::select! {
            frame = read_frame(read_half) => {
                match frame {
                    Ok(msg) => {
                        if inbound_tx.send(msg).is_err() {
                            return;
                        }
                    }
                    Err(_) => return,
                }
            }
            Some(msg) = outbound_rx.recv() => {
                if write_frame(write_half, &msg).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// The local proxy Entity that bridges a single peer Runtime's non-local
/// channels onto this process's Bus, in both directions.
pub struct BusConnector {
    peer_uri: RuntimeUri,
    local_uri: RuntimeUri,
    link: Arc<OutboundLink>,
    bus: Arc<Bus>,
    codecs: CodecRegistry,
    /// Channel -> registered payload type id, consulted for both directions.
    type_ids: HashMap<Channel, String>,
}

impl BusConnector {
    pub fn new(
        peer_uri: RuntimeUri,
        local_uri: RuntimeUri,
        link: Arc<OutboundLink>,
        bus: Arc<Bus>,
        codecs: CodecRegistry,
        type_ids: HashMap<Channel, String>,
    ) -> Arc<Self> {
        Arc::new(BusConnector { peer_uri, local_uri, link, bus, codecs, type_ids })
    }

    /// Local Sink for a channel this peer wants bridged outbound — subscribe
    /// this on the Bus for the requested pattern; every matching BusEvent is
    /// encoded and forwarded over the wire.
    pub fn outbound_sink(self: &Arc<Self>) -> Arc<dyn Sink> {
        Arc::new(OutboundSink { connector: self.clone() })
    }

    /// Drain inbound `BusEvent` frames from the peer and republish them on
    /// the local Bus, tagged with a cross-process sender handle.
    pub async fn run_inbound(self: Arc<Self>, mut inbound_rx: mpsc::UnboundedReceiver<WireMessage>) {
        while let Some(msg) = inbound_rx.recv().await {
            if let WireMessage::BusEvent { channel, type_id, payload, sender_runtime_uri, sender_name } = msg {
                let decoded = match self.codecs.decode(&type_id, &payload) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(peer = %self.peer_uri, error = %e, "dropping undecodable remote bus event");
                        continue;
                    }
                };
                let sender = remote_sender_handle(&sender_runtime_uri, &sender_name);
                if let Err(e) = self.bus.publish(&Channel::new(channel), decoded, sender).await {
                    warn!(peer = %self.peer_uri, error = %e, "republishing remote bus event failed");
                }
            }
        }
    }
}

/// A handle representing an Entity that lives on a remote Runtime. Its
/// sink always rejects local enqueue — remote Entities are never valid
/// local subscription targets, only sender tags on republished events, or
/// (for a `remote_uri`-declared Entity) a name-to-handle map entry standing
/// in for an Entity that actually runs elsewhere.
pub(crate) fn remote_sender_handle(runtime_uri: &str, name: &str) -> AddressableHandle {
    struct Rejecting;
    #[async_trait]
    impl Sink for Rejecting {
        async fn enqueue(&self, _event: BusEvent) -> PushOutcome {
            PushOutcome::Rejected
        }
    }
    AddressableHandle::new(format!("{runtime_uri}/{name}"), Arc::new(Rejecting))
}

struct OutboundSink {
    connector: Arc<BusConnector>,
}

#[async_trait]
impl Sink for OutboundSink {
    async fn enqueue(&self, event: BusEvent) -> PushOutcome {
        let connector = &self.connector;
        let Some(type_id) = connector.type_ids.get(&event.channel) else {
            connector.bus.metrics.enqueue_hard_fail.fetch_add(1, Ordering::Relaxed);
            warn!(channel = %event.channel, "no registered payload type id for remote channel, dropping");
            return PushOutcome::Rejected;
        };

        let bytes = match connector.codecs.encode(type_id, &event.payload) {
            Ok(b) => b,
            Err(e) => {
                connector.link.metrics.serialization_failures.fetch_add(1, Ordering::Relaxed);
                warn!(channel = %event.channel, error = %e, "serialization failed, event not transmitted");
                return PushOutcome::Rejected;
            }
        };

        let msg = WireMessage::BusEvent {
            channel: event.channel.to_string(),
            type_id: type_id.clone(),
            payload: bytes,
            sender_runtime_uri: connector.local_uri.to_string(),
            sender_name: event.sender.name().to_string(),
        };

        match connector.link.send(msg) {
            Ok(()) => PushOutcome::Enqueued,
            Err(_) => {
                connector.bus.note_remote_disconnected_drop();
                PushOutcome::Rejected
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_displays_runtime_uri() {
        let uri: RuntimeUri = "race://host1:9000/alpha".parse().unwrap();
        assert_eq!(uri.host, "host1");
        assert_eq!(uri.port, 9000);
        assert_eq!(uri.name, "alpha");
        assert_eq!(uri.to_string(), "race://host1:9000/alpha");
    }

    #[test]
    fn rejects_malformed_uri() {
        assert!("http://host1:9000/alpha".parse::<RuntimeUri>().is_err());
        assert!("race://host1/alpha".parse::<RuntimeUri>().is_err());
        assert!("race://host1:9000/".parse::<RuntimeUri>().is_err());
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let mut backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(400));
        assert_eq!(backoff.next_delay(), Duration::from_millis(800));
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn backoff_reset_returns_to_initial() {
        let mut backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(1));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn outbound_link_reconnects_and_delivers_after_listener_restarts() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let uri = RuntimeUri { host: "127.0.0.1".into(), port: addr.port(), name: "peer".into() };
        let local_uri = RuntimeUri { host: "127.0.0.1".into(), port: 0, name: "self".into() };

        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let link = OutboundLink::spawn(uri, local_uri, inbound_tx, shutdown.clone());

        let (mut stream, _) = listener.accept().await.unwrap();
        let handshake = read_frame(&mut stream).await.unwrap();
        assert!(matches!(handshake, WireMessage::Handshake { .. }));

        // Wait for the link to observe the successful handshake.
        for _ in 0..50 {
            if link.is_connected() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(link.is_connected());

        link.send(WireMessage::Disconnect).unwrap();
        let got = read_frame(&mut stream).await.unwrap();
        assert!(matches!(got, WireMessage::Disconnect));

        shutdown.cancel();
        let _ = inbound_rx.try_recv();
    }
}
