//! Async Gateway Exchange Protocol transport for measurement streaming.
//!
//! This crate implements both ends of the Gateway Exchange Protocol: a
//! session-oriented binary protocol for moving high-rate time-series
//! measurements (PMU-style samples) between a publisher and its
//! subscribers over TCP, with an optional UDP data channel.
//!
//! The pieces, bottom up:
//!
//! - Compact and TSSC measurement codecs ([`transport::compact`],
//!   [`transport::tssc`]) - the latter a stateful, bit-level delta/XOR
//!   compressor purpose-built for successive floating-point samples.
//! - Signal-index-cache negotiation ([`transport::signal_index_cache`]) -
//!   a 16-bit runtime alias per subscribed signal that shrinks every
//!   on-wire record.
//! - Command-channel framing and response dispatch ([`transport::frame`],
//!   [`transport::subscriber`]).
//! - The subscription engine ([`transport::DataSubscriber`]), publisher
//!   mirror ([`transport::DataPublisher`]), and the retry/auto-reconnect
//!   connector ([`transport::SubscriberConnector`]).
//!
//! # Example
//!
//! ```ignore
//! use gep::transport::{DataSubscriber, SubscriberHandlers, SubscriptionInfo};
//!
//! #[tokio::main]
//! async fn main() -> gep::Result<()> {
//!     let subscriber = DataSubscriber::new(
//!         SubscriberHandlers::new()
//!             .on_status(|msg| println!("{msg}"))
//!             .on_measurements(|batch| {
//!                 for m in &batch {
//!                     println!("{} = {}", m.signal_id, m.adjusted_value());
//!                 }
//!             }),
//!     );
//!
//!     subscriber.connect("localhost", 7165).await?;
//!     subscriber.subscribe(SubscriptionInfo {
//!         filter_expression: "FILTER ActiveMeasurements WHERE SignalType = 'FREQ'".into(),
//!         ..Default::default()
//!     }).await?;
//!
//!     tokio::signal::ctrl_c().await.ok();
//!     subscriber.disconnect().await;
//!     Ok(())
//! }
//! ```
//!
//! Events can also be consumed as a `Stream`; see
//! [`transport::SubscriberEvents`].

pub mod transport;
pub mod util;

// Re-export common types at crate root for convenience
pub use transport::{Error, Result};

pub use transport::{
    DataPublisher, DataSubscriber, Measurement, PublisherConfig, PublisherHandlers,
    SignalDefinition, SignalIndexCache, SignalKind, SignalReference, SubscriberConnector,
    SubscriberEvent, SubscriberEvents, SubscriberHandlers, SubscriptionInfo,
};
