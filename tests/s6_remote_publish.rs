//! S6 — Two Runtimes bridge one channel over a real TCP loopback
//! connection; ten payloads published on the dialing side arrive on the
//! listening side's local Bus in publish order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use race_core::bus::inbox::OverflowPolicy;
use race_core::bus::{local_handle, AddressableHandle, Bus};
use race_core::channel::{Channel, Pattern};
use race_core::remote::codec::CodecRegistry;
use race_core::remote::wire::{read_frame, WireMessage};
use race_core::remote::{BusConnector, OutboundLink, RuntimeUri};

async fn wait_connected(link: &Arc<OutboundLink>) {
    for _ in 0..100 {
        if link.is_connected() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("link never connected");
}

#[tokio::test]
async fn ten_payloads_arrive_in_order_across_a_bridged_channel() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let uri_b = RuntimeUri { host: "127.0.0.1".into(), port: addr.port(), name: "b".into() };
    let uri_a = RuntimeUri { host: "127.0.0.1".into(), port: 0, name: "a".into() };

    let shutdown = CancellationToken::new();
    let (inbound_tx_a, _inbound_rx_a) = tokio::sync::mpsc::unbounded_channel();
    let link_a = OutboundLink::spawn(uri_b.clone(), uri_a.clone(), inbound_tx_a, shutdown.clone());

    let (mut stream_b, _) = listener.accept().await.unwrap();
    let handshake = read_frame(&mut stream_b).await.unwrap();
    assert!(matches!(handshake, WireMessage::Handshake { .. }));

    let (inbound_tx_b, inbound_rx_b) = tokio::sync::mpsc::unbounded_channel();
    let link_b = OutboundLink::spawn_accepted(stream_b, uri_a.clone(), inbound_tx_b);

    wait_connected(&link_a).await;

    let codecs = CodecRegistry::builder().register::<i32>("i32").build();
    let mut type_ids = HashMap::new();
    type_ids.insert(Channel::new("/g"), "i32".to_string());

    let bus_a = Arc::new(Bus::new());
    let bus_b = Arc::new(Bus::new());

    let connector_a = BusConnector::new(uri_b.clone(), uri_a.clone(), link_a.clone(), bus_a.clone(), codecs.clone(), type_ids.clone());
    bus_a.subscribe(AddressableHandle::new("to-b", connector_a.outbound_sink()), Pattern::parse("/g").unwrap());

    let connector_b = BusConnector::new(uri_a.clone(), uri_b.clone(), link_b.clone(), bus_b.clone(), codecs.clone(), type_ids.clone());
    tokio::spawn(connector_b.run_inbound(inbound_rx_b));

    let (recorder, inbox) = local_handle("recorder", 32, OverflowPolicy::DropOldest);
    bus_b.subscribe(recorder, Pattern::parse("/g").unwrap());

    for i in 0..10i32 {
        bus_a
            .publish(&Channel::new("/g"), Arc::new(i), AddressableHandle::anonymous())
            .await
            .unwrap();
    }

    for expect in 0..10i32 {
        let event = tokio::time::timeout(Duration::from_secs(2), inbox.pop()).await.unwrap();
        let got = *event.payload.downcast_ref::<i32>().unwrap();
        assert_eq!(got, expect);
    }

    shutdown.cancel();
}

#[tokio::test]
async fn publishes_after_the_peer_disconnects_are_dropped_not_buffered() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let uri_b = RuntimeUri { host: "127.0.0.1".into(), port: addr.port(), name: "b".into() };
    let uri_a = RuntimeUri { host: "127.0.0.1".into(), port: 0, name: "a".into() };

    let shutdown = CancellationToken::new();
    let (inbound_tx_a, _inbound_rx_a) = tokio::sync::mpsc::unbounded_channel();
    let link_a = OutboundLink::spawn(uri_b.clone(), uri_a.clone(), inbound_tx_a, shutdown.clone());

    let (stream_b, _) = listener.accept().await.unwrap();
    wait_connected(&link_a).await;

    // Sever the peer side; the dialing link has nothing to read or write to
    // anymore and should observe the drop on its next frame attempt.
    drop(stream_b);

    let codecs = CodecRegistry::builder().register::<i32>("i32").build();
    let mut type_ids = HashMap::new();
    type_ids.insert(Channel::new("/g"), "i32".to_string());

    let bus_a = Arc::new(Bus::new());
    let connector_a = BusConnector::new(uri_b.clone(), uri_a.clone(), link_a.clone(), bus_a.clone(), codecs, type_ids);
    bus_a.subscribe(AddressableHandle::new("to-b", connector_a.outbound_sink()), Pattern::parse("/g").unwrap());

    for _ in 0..50 {
        if !link_a.is_connected() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // The publish itself never panics or hangs; the Bus's generic hard-fail
    // accounting surfaces the drop as an error to the local publisher rather
    // than silently buffering it for a peer that may never come back.
    let result = bus_a.publish(&Channel::new("/g"), Arc::new(1i32), AddressableHandle::anonymous()).await;
    assert!(result.is_err());
    assert_eq!(bus_a.metrics.snapshot().dropped_disconnected_remote, 1);

    shutdown.cancel();
}
