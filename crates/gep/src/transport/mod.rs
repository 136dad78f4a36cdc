//! Gateway Exchange Protocol transport implementation.
//!
//! The protocol is a bidirectional, session-oriented, binary wire
//! protocol for publishing and subscribing to high-rate streams of
//! measurement samples over a TCP command channel with an optional UDP
//! data channel.
//!
//! # Subscribing
//!
//! ```ignore
//! use gep::transport::{DataSubscriber, SubscriberHandlers, SubscriptionInfo};
//!
//! let subscriber = DataSubscriber::new(
//!     SubscriberHandlers::new()
//!         .on_measurements(|batch| println!("{} measurements", batch.len()))
//!         .on_error(|msg| eprintln!("{msg}")),
//! );
//!
//! subscriber.connect("localhost", 7165).await?;
//! subscriber.subscribe(SubscriptionInfo::default()).await?;
//! ```
//!
//! # Publishing
//!
//! ```ignore
//! use gep::transport::{DataPublisher, PublisherConfig, PublisherHandlers};
//!
//! let publisher = DataPublisher::new(PublisherConfig::default(), PublisherHandlers::new());
//! publisher.define_signals(signals);
//! publisher.start(7165).await?;
//! publisher.publish_measurements(&frame).await?;
//! ```
//!
//! # Reconnection
//!
//! [`SubscriberConnector`] wraps a subscriber in retry/backoff policy
//! and, when auto-reconnect is enabled, re-establishes terminated
//! connections and re-issues the stored subscription.

pub mod compact;
pub mod config;
pub mod connector;
pub mod constants;
pub mod error;
pub mod frame;
pub mod publisher;
pub mod signal_index_cache;
pub mod stream;
pub mod subscriber;
pub mod tssc;
pub mod types;

pub use config::{ConnectionString, SubscriptionInfo};
pub use connector::SubscriberConnector;
pub use error::{Error, Result};
pub use publisher::{DataPublisher, PublisherConfig, PublisherHandlers, SignalDefinition};
pub use signal_index_cache::SignalIndexCache;
pub use stream::{SubscriberEvent, SubscriberEvents};
pub use subscriber::{DataSubscriber, SubscriberHandlers};
pub use types::{Measurement, SignalKind, SignalReference};
