//! Retry and auto-reconnect wrapper for subscribers.
//!
//! The connector holds nothing but connection policy; it receives the
//! engine at each entry point rather than storing it, so there is no
//! reference cycle between the two.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::debug;

use super::error::Result;
use super::subscriber::DataSubscriber;

/// Callback invoked with connector error text.
pub type ConnectorMessageCallback = Arc<dyn Fn(&str) + Send + Sync>;
/// Callback invoked after an automatic reconnect attempt completes.
pub type ReconnectCallback = Arc<dyn Fn(&DataSubscriber) + Send + Sync>;

/// Connection policy: host, port, retry bounds, and auto-reconnect.
///
/// Cheap to clone; clones share the cancellation state, so a `cancel`
/// from any clone interrupts a `connect` in progress on another.
#[derive(Clone)]
pub struct SubscriberConnector {
    hostname: String,
    port: u16,
    max_retries: i32,
    retry_interval: Duration,
    auto_reconnect: bool,

    cancelled: Arc<AtomicBool>,
    cancel_notify: Arc<Notify>,

    error_message_callback: Option<ConnectorMessageCallback>,
    reconnect_callback: Option<ReconnectCallback>,
}

impl SubscriberConnector {
    /// Create a connector for the given publisher endpoint. Defaults:
    /// unlimited retries two seconds apart, auto-reconnect enabled.
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            max_retries: -1,
            retry_interval: Duration::from_millis(2000),
            auto_reconnect: true,
            cancelled: Arc::new(AtomicBool::new(false)),
            cancel_notify: Arc::new(Notify::new()),
            error_message_callback: None,
            reconnect_callback: None,
        }
    }

    /// The hostname of the publisher to connect to.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// The port the publisher is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Maximum connection attempts per sequence; -1 means unlimited.
    pub fn max_retries(&self) -> i32 {
        self.max_retries
    }

    /// Limit connection attempts per sequence; -1 means unlimited.
    pub fn set_max_retries(&mut self, max_retries: i32) {
        self.max_retries = max_retries;
    }

    /// Idle time between connection attempts.
    pub fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    /// Set the idle time between connection attempts.
    pub fn set_retry_interval(&mut self, interval: Duration) {
        self.retry_interval = interval;
    }

    /// Whether a terminated connection triggers reconnection.
    pub fn auto_reconnect(&self) -> bool {
        self.auto_reconnect
    }

    /// Enable or disable reconnection after a terminated connection.
    pub fn set_auto_reconnect(&mut self, auto_reconnect: bool) {
        self.auto_reconnect = auto_reconnect;
    }

    /// Set a callback for per-attempt connection failures.
    pub fn set_error_message_callback(&mut self, f: impl Fn(&str) + Send + Sync + 'static) {
        self.error_message_callback = Some(Arc::new(f));
    }

    /// Set a callback fired when an automatic reconnect attempt finishes.
    pub fn set_reconnect_callback(
        &mut self,
        f: impl Fn(&DataSubscriber) + Send + Sync + 'static,
    ) {
        self.reconnect_callback = Some(Arc::new(f));
    }

    /// Store `info` on the subscriber, then run a connection sequence.
    /// The info must be in place before connecting so the operational
    /// modes can account for it.
    pub async fn connect_with(
        &self,
        subscriber: &DataSubscriber,
        info: crate::transport::SubscriptionInfo,
    ) -> Result<bool> {
        subscriber.set_subscription_info(info);
        self.connect(subscriber).await
    }

    /// Run a connection sequence against `subscriber`: attempt, report,
    /// sleep, repeat, until connected, cancelled, or out of retries.
    /// Returns whether the subscriber ended up connected.
    pub async fn connect(&self, subscriber: &DataSubscriber) -> Result<bool> {
        if self.auto_reconnect {
            let connector = self.clone();
            subscriber.register_auto_reconnect_hook(Arc::new(move |subscriber| {
                let connector = connector.clone();
                tokio::spawn(async move {
                    connector.run_auto_reconnect(&subscriber).await;
                });
            }));
        }

        self.cancelled.store(false, Ordering::Release);
        self.connect_sequence(subscriber).await
    }

    /// Cancel the current and any future connection sequences, waking a
    /// sleeping retry timer immediately.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.cancel_notify.notify_waiters();
    }

    async fn connect_sequence(&self, subscriber: &DataSubscriber) -> Result<bool> {
        let mut attempt = 0;

        while !self.is_cancelled() && (self.max_retries == -1 || attempt < self.max_retries) {
            attempt += 1;

            match subscriber.connect(&self.hostname, self.port).await {
                Ok(()) => break,
                Err(e) => {
                    debug!(attempt, error = %e, "connection attempt failed");

                    if let Some(callback) = &self.error_message_callback {
                        callback(&format!(
                            "Failed to connect to \"{}:{}\": {e}",
                            self.hostname, self.port
                        ));
                    }

                    // Sleep out the retry interval unless cancelled first.
                    tokio::select! {
                        _ = self.cancel_notify.notified() => {}
                        _ = tokio::time::sleep(self.retry_interval) => {}
                    }
                }
            }
        }

        Ok(subscriber.is_connected())
    }

    /// Reconnection driver installed as the engine's termination hook.
    async fn run_auto_reconnect(&self, subscriber: &DataSubscriber) {
        if self.is_cancelled() {
            return;
        }

        if let Some(callback) = &self.error_message_callback {
            callback("Publisher connection terminated. Attempting to reconnect...");
        }

        let connected = self
            .connect_sequence(subscriber)
            .await
            .unwrap_or(false);

        if connected && subscriber.should_resubscribe() {
            if let Err(e) = subscriber.resubscribe().await {
                if let Some(callback) = &self.error_message_callback {
                    callback(&format!("Failed to resubscribe after reconnect: {e}"));
                }
            }
        }

        if !self.is_cancelled() {
            if let Some(callback) = &self.reconnect_callback {
                callback(subscriber);
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::subscriber::SubscriberHandlers;
    use std::sync::atomic::AtomicU32;
    use std::time::Instant;

    #[tokio::test]
    async fn test_bounded_retries_report_each_failure() {
        // Nothing listens on this port; every attempt fails.
        let mut connector = SubscriberConnector::new("127.0.0.1", 1);
        connector.set_max_retries(3);
        connector.set_retry_interval(Duration::from_millis(50));
        connector.set_auto_reconnect(false);

        let failures = Arc::new(AtomicU32::new(0));
        let counter = failures.clone();
        connector.set_error_message_callback(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        });

        let subscriber = DataSubscriber::new(SubscriberHandlers::new());
        let started = Instant::now();
        let connected = connector.connect(&subscriber).await.unwrap();

        assert!(!connected);
        assert!(!subscriber.is_connected());
        assert_eq!(failures.load(Ordering::Relaxed), 3);
        // Three sleeps at ~50 ms spacing.
        assert!(started.elapsed() >= Duration::from_millis(120));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_the_retry_sleep() {
        let mut connector = SubscriberConnector::new("127.0.0.1", 1);
        connector.set_max_retries(-1);
        connector.set_retry_interval(Duration::from_secs(3600));
        connector.set_auto_reconnect(false);

        let subscriber = DataSubscriber::new(SubscriberHandlers::new());
        let canceller = connector.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let connected = connector.connect(&subscriber).await.unwrap();

        assert!(!connected);
        assert!(started.elapsed() < Duration::from_secs(60));
    }
}
