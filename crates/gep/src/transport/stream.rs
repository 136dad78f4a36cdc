//! Stream-based consumption of subscriber events.
//!
//! [`SubscriberEvents`] turns the engine's callback set into a
//! [`Stream`], for callers who would rather `while let` over events than
//! wire up closures:
//!
//! ```ignore
//! use gep::transport::{DataSubscriber, SubscriberEvent, SubscriberEvents};
//! use tokio_stream::StreamExt;
//!
//! let (handlers, mut events) = SubscriberEvents::channel(1024);
//! let subscriber = DataSubscriber::new(handlers);
//! subscriber.connect("localhost", 7165).await?;
//!
//! while let Some(event) = events.next().await {
//!     match event {
//!         SubscriberEvent::Measurements(batch) => println!("{} points", batch.len()),
//!         SubscriberEvent::StatusMessage(msg) => println!("{msg}"),
//!         _ => {}
//!     }
//! }
//! ```

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::mpsc;
use tokio_stream::Stream;
use tokio_stream::wrappers::ReceiverStream;

use super::subscriber::SubscriberHandlers;
use super::types::Measurement;

/// One event from a subscription, in receipt order.
#[derive(Debug, Clone)]
pub enum SubscriberEvent {
    /// Informational message.
    StatusMessage(String),
    /// Error message, including remote command failures.
    ErrorMessage(String),
    /// Decoded measurement batch, one per data packet.
    Measurements(Vec<Measurement>),
    /// Metadata blob answering a metadata refresh.
    Metadata(Vec<u8>),
    /// Stream start time in ticks.
    DataStartTime(i64),
    /// Temporal processing completed.
    ProcessingComplete(String),
    /// Publisher configuration changed.
    ConfigurationChanged,
    /// The connection ended, locally or by the peer.
    ConnectionTerminated,
}

/// A `Stream` of [`SubscriberEvent`]s backed by a bounded channel.
///
/// Built together with the [`SubscriberHandlers`] that feed it. Events
/// arriving while the channel is full are dropped rather than stalling
/// the engine's callback task; size the capacity for the worst burst the
/// consumer may lag behind.
pub struct SubscriberEvents {
    inner: ReceiverStream<SubscriberEvent>,
}

impl SubscriberEvents {
    /// Create a handler set and the event stream it feeds.
    pub fn channel(capacity: usize) -> (SubscriberHandlers, Self) {
        let (tx, rx) = mpsc::channel(capacity);

        let forward = |tx: &mpsc::Sender<SubscriberEvent>| {
            let tx = tx.clone();
            move |event| {
                let _ = tx.try_send(event);
            }
        };

        let send_status = forward(&tx);
        let send_error = forward(&tx);
        let send_measurements = forward(&tx);
        let send_metadata = forward(&tx);
        let send_start = forward(&tx);
        let send_complete = forward(&tx);
        let send_changed = forward(&tx);
        let send_terminated = forward(&tx);

        let handlers = SubscriberHandlers::new()
            .on_status(move |msg| send_status(SubscriberEvent::StatusMessage(msg.to_string())))
            .on_error(move |msg| send_error(SubscriberEvent::ErrorMessage(msg.to_string())))
            .on_measurements(move |batch| {
                send_measurements(SubscriberEvent::Measurements(batch))
            })
            .on_metadata(move |blob| send_metadata(SubscriberEvent::Metadata(blob)))
            .on_data_start_time(move |ticks| send_start(SubscriberEvent::DataStartTime(ticks)))
            .on_processing_complete(move |msg| {
                send_complete(SubscriberEvent::ProcessingComplete(msg.to_string()))
            })
            .on_configuration_changed(move || send_changed(SubscriberEvent::ConfigurationChanged))
            .on_connection_terminated(move || {
                send_terminated(SubscriberEvent::ConnectionTerminated)
            });

        (
            handlers,
            Self {
                inner: ReceiverStream::new(rx),
            },
        )
    }
}

impl Stream for SubscriberEvents {
    type Item = SubscriberEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
