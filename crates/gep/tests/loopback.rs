//! Publisher <-> subscriber loopback over localhost.
//!
//! These tests run both ends of the protocol against each other: the
//! operational-mode handshake, cache and base-time delivery, compact and
//! TSSC data flow over TCP, UDP data channels, metadata exchange, and
//! reconnect-with-resubscribe.

use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};
use tokio_stream::StreamExt;
use uuid::Uuid;

use gep::transport::{
    DataPublisher, DataSubscriber, Measurement, PublisherConfig, PublisherHandlers,
    SignalDefinition, SubscriberConnector, SubscriberEvent, SubscriberEvents,
    SubscriptionInfo,
};
use gep::util::time::ticks_now;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn test_signals(count: u32) -> Vec<SignalDefinition> {
    (0..count)
        .map(|id| SignalDefinition {
            signal_id: Uuid::new_v4(),
            source: "PPA".into(),
            id: id + 1,
        })
        .collect()
}

fn test_frame(signals: &[SignalDefinition], timestamp: i64, value_seed: f64) -> Vec<Measurement> {
    signals
        .iter()
        .enumerate()
        .map(|(index, signal)| Measurement {
            signal_id: signal.signal_id,
            source: signal.source.clone(),
            id: signal.id,
            value: value_seed + index as f64 * 0.25,
            timestamp,
            flags: 0,
            ..Default::default()
        })
        .collect()
}

async fn started_publisher(signals: Vec<SignalDefinition>) -> DataPublisher {
    let publisher = DataPublisher::new(PublisherConfig::default(), PublisherHandlers::new());
    publisher.define_signals(signals);
    publisher.start(0).await.unwrap();
    publisher
}

async fn wait_subscribed(subscriber: &DataSubscriber) {
    timeout(TEST_TIMEOUT, async {
        while !subscriber.is_subscribed() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("subscription should be confirmed");
}

async fn next_measurements(events: &mut SubscriberEvents) -> Vec<Measurement> {
    timeout(TEST_TIMEOUT, async {
        loop {
            match events.next().await {
                Some(SubscriberEvent::Measurements(batch)) => return batch,
                Some(_) => continue,
                None => panic!("event stream ended unexpectedly"),
            }
        }
    })
    .await
    .expect("measurements should arrive")
}

#[tokio::test(flavor = "multi_thread")]
async fn handshake_sends_modes_then_subscribe_frame() {
    // A raw listener stands in for the publisher so the exact bytes of
    // the first two frames can be checked.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let subscriber = DataSubscriber::new(gep::SubscriberHandlers::new());
    let accept = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();

        // Frame one: DefineOperationalModes.
        let mut header = [0u8; 8];
        socket.read_exact(&mut header).await.unwrap();
        assert_eq!(&header[0..4], &[0xAA, 0xBB, 0xCC, 0xDD]);
        let size = u32::from_le_bytes(header[4..8].try_into().unwrap()) as usize;
        assert_eq!(size, 5);

        let mut payload = vec![0u8; size];
        socket.read_exact(&mut payload).await.unwrap();
        assert_eq!(payload[0], 0x06);

        let modes = u32::from_be_bytes(payload[1..5].try_into().unwrap());
        assert_eq!(modes & 0x0000_0200, 0x0000_0200, "UTF-8 encoding bit");
        assert_eq!(modes & 0x0000_0020, 0x0000_0020, "GZip compression bit");

        // Frame two: Subscribe.
        socket.read_exact(&mut header).await.unwrap();
        assert_eq!(&header[0..4], &[0xAA, 0xBB, 0xCC, 0xDD]);
        let size = u32::from_le_bytes(header[4..8].try_into().unwrap()) as usize;

        let mut payload = vec![0u8; size];
        socket.read_exact(&mut payload).await.unwrap();
        assert_eq!(payload[0], 0x02, "Subscribe command code");
        assert_eq!(payload[1], 0x02, "compact data packet flag");

        let string_length = u32::from_be_bytes(payload[2..6].try_into().unwrap()) as usize;
        assert_eq!(size, 5 + string_length + 1);

        let connection_string = String::from_utf8(payload[6..].to_vec()).unwrap();
        assert!(connection_string.contains("includeTime=true"));
        assert!(connection_string.contains("processingInterval=-1"));
        assert!(connection_string.contains("inputMeasurementKeys={PPA:1;PPA:2}"));
    });

    subscriber.connect("127.0.0.1", port).await.unwrap();
    subscriber
        .subscribe(SubscriptionInfo {
            filter_expression: "PPA:1;PPA:2".into(),
            ..Default::default()
        })
        .await
        .unwrap();

    timeout(TEST_TIMEOUT, accept).await.unwrap().unwrap();
    subscriber.disconnect().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn tssc_stream_over_tcp() {
    let signals = test_signals(5);
    let publisher = started_publisher(signals.clone()).await;

    let (handlers, mut events) = SubscriberEvents::channel(1024);
    let subscriber = DataSubscriber::new(handlers);

    subscriber
        .connect("127.0.0.1", publisher.local_port())
        .await
        .unwrap();
    subscriber
        .subscribe(SubscriptionInfo::default())
        .await
        .unwrap();
    wait_subscribed(&subscriber).await;

    let start = ticks_now();
    for frame in 0..5i64 {
        let batch = test_frame(&signals, start + frame * 333_333, 59.5 + frame as f64);
        publisher.publish_measurements(&batch).await.unwrap();
    }

    let mut received = Vec::new();
    while received.len() < 25 {
        received.extend(next_measurements(&mut events).await);
    }

    assert_eq!(received.len(), 25);
    for (index, m) in received.iter().enumerate() {
        let frame = index / 5;
        let position = index % 5;
        let expected = &signals[position];

        assert_eq!(m.signal_id, expected.signal_id);
        assert_eq!(m.source, "PPA");
        assert_eq!(m.id, expected.id);
        assert_eq!(m.timestamp, start + frame as i64 * 333_333);
        assert_eq!(
            m.value as f32,
            (59.5 + frame as f64 + position as f64 * 0.25) as f32
        );
    }

    assert_eq!(subscriber.total_measurements_received(), 25);
    assert!(subscriber.total_command_channel_bytes_received() > 0);

    subscriber.disconnect().await;
    publisher.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn compact_stream_over_tcp() {
    let signals = test_signals(3);
    let publisher = started_publisher(signals.clone()).await;

    let (handlers, mut events) = SubscriberEvents::channel(1024);
    let subscriber = DataSubscriber::new(handlers);
    subscriber.set_payload_data_compressed(false);

    subscriber
        .connect("127.0.0.1", publisher.local_port())
        .await
        .unwrap();
    subscriber
        .subscribe(SubscriptionInfo::default())
        .await
        .unwrap();
    wait_subscribed(&subscriber).await;

    let timestamp = ticks_now();
    let batch = test_frame(&signals, timestamp, 60.125);
    publisher.publish_measurements(&batch).await.unwrap();

    let received = next_measurements(&mut events).await;
    assert_eq!(received.len(), 3);
    for (m, signal) in received.iter().zip(&signals) {
        assert_eq!(m.signal_id, signal.signal_id);
        assert_eq!(m.timestamp, timestamp);
    }

    subscriber.disconnect().await;
    publisher.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn compact_stream_over_udp_data_channel() {
    let signals = test_signals(2);
    let publisher = started_publisher(signals.clone()).await;

    let (handlers, mut events) = SubscriberEvents::channel(1024);
    let subscriber = DataSubscriber::new(handlers);

    let info = SubscriptionInfo {
        udp_data_channel: true,
        data_channel_local_port: 0, // ephemeral
        ..Default::default()
    };

    // UDP plans must be in place before connect: the operational modes
    // must not request TSSC for a lossy channel.
    subscriber.set_subscription_info(info.clone());
    subscriber
        .connect("127.0.0.1", publisher.local_port())
        .await
        .unwrap();
    subscriber.subscribe(info).await.unwrap();
    wait_subscribed(&subscriber).await;

    let timestamp = ticks_now();
    let received = timeout(TEST_TIMEOUT, async {
        // UDP is lossy even on loopback; republish until delivery.
        loop {
            let batch = test_frame(&signals, timestamp, 50.5);
            publisher.publish_measurements(&batch).await.unwrap();

            tokio::select! {
                event = events.next() => {
                    if let Some(SubscriberEvent::Measurements(batch)) = event {
                        return batch;
                    }
                }
                _ = sleep(Duration::from_millis(200)) => {}
            }
        }
    })
    .await
    .expect("datagram should arrive on loopback");

    assert_eq!(received.len(), 2);
    assert_eq!(received[0].signal_id, signals[0].signal_id);
    assert!(subscriber.total_data_channel_bytes_received() > 0);

    subscriber.disconnect().await;
    publisher.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn metadata_refresh_round_trip() {
    let metadata = b"<DataSet><Table>PPA devices</Table></DataSet>".repeat(50);

    let publisher = started_publisher(test_signals(1)).await;
    publisher.define_metadata(metadata.clone());

    let (handlers, mut events) = SubscriberEvents::channel(64);
    let subscriber = DataSubscriber::new(handlers);

    subscriber
        .connect("127.0.0.1", publisher.local_port())
        .await
        .unwrap();
    subscriber.request_metadata().await.unwrap();

    let blob = timeout(TEST_TIMEOUT, async {
        loop {
            match events.next().await {
                Some(SubscriberEvent::Metadata(blob)) => return blob,
                Some(_) => continue,
                None => panic!("event stream ended unexpectedly"),
            }
        }
    })
    .await
    .expect("metadata should arrive");

    assert_eq!(blob, metadata);

    subscriber.disconnect().await;
    publisher.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn reconnect_resubscribes_and_data_resumes() {
    let signals = test_signals(2);
    let publisher = started_publisher(signals.clone()).await;
    let port = publisher.local_port();

    let (handlers, mut events) = SubscriberEvents::channel(1024);
    let subscriber = DataSubscriber::new(handlers);

    let mut connector = SubscriberConnector::new("127.0.0.1", port);
    connector.set_retry_interval(Duration::from_millis(100));
    connector.set_max_retries(-1);
    connector.set_auto_reconnect(true);

    let connected = connector
        .connect_with(&subscriber, SubscriptionInfo::default())
        .await
        .unwrap();
    assert!(connected);

    subscriber
        .subscribe(SubscriptionInfo::default())
        .await
        .unwrap();
    wait_subscribed(&subscriber).await;

    publisher
        .publish_measurements(&test_frame(&signals, ticks_now(), 10.0))
        .await
        .unwrap();
    assert_eq!(next_measurements(&mut events).await.len(), 2);

    // Kill the publisher; the subscriber should notice and begin
    // retrying at the connector's cadence.
    publisher.stop().await;

    timeout(TEST_TIMEOUT, async {
        loop {
            if let Some(SubscriberEvent::ConnectionTerminated) = events.next().await {
                return;
            }
        }
    })
    .await
    .expect("termination should be reported");

    // Bring a publisher back on the same port.
    let revived = DataPublisher::new(PublisherConfig::default(), PublisherHandlers::new());
    revived.define_signals(signals.clone());
    revived.start(port).await.unwrap();

    // The connector reconnects and re-issues the stored subscription.
    timeout(TEST_TIMEOUT, async {
        while !subscriber.is_subscribed() {
            sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("resubscription should complete");

    let received = timeout(TEST_TIMEOUT, async {
        loop {
            revived
                .publish_measurements(&test_frame(&signals, ticks_now(), 20.0))
                .await
                .unwrap();

            tokio::select! {
                event = events.next() => {
                    if let Some(SubscriberEvent::Measurements(batch)) = event {
                        return batch;
                    }
                }
                _ = sleep(Duration::from_millis(100)) => {}
            }
        }
    })
    .await
    .expect("data should resume after reconnect");

    assert_eq!(received.len(), 2);

    connector.cancel();
    subscriber.disconnect().await;
    revived.stop().await;
}
