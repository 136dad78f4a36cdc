//! The subscription engine.
//!
//! [`DataSubscriber`] owns one subscription: the TCP command channel, the
//! optional UDP data channel, the signal index cache, base time offsets,
//! and the TSSC decoder state. Two reader tasks (one per channel) decode
//! response frames and hand every user-visible event to a dedicated
//! callback task through a bounded queue, so user callbacks run serially,
//! in receipt order, and off the I/O paths. Data packets decode inline on
//! the reader to avoid copying them through the queue; only the resulting
//! measurement batch crosses it.

use std::net::IpAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket, lookup_host};
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::compact::CompactMeasurement;
use super::config::SubscriptionInfo;
use super::constants::{
    CompressionModes, DataPacketFlags, MAX_PACKET_SIZE, OperationalEncoding, OperationalModes,
    PAYLOAD_HEADER_SIZE, RESPONSE_HEADER_SIZE, ServerCommand, ServerResponse, TSSC_VERSION,
};
use super::error::{Error, Result};
use super::frame::{self, BaseTimeUpdate};
use super::signal_index_cache::SignalIndexCache;
use super::tssc;
use super::types::Measurement;
use crate::util::gzip;

/// Callback invoked with status or error text.
pub type MessageCallback = Box<dyn Fn(&str) + Send + Sync>;
/// Callback invoked with each decoded measurement batch.
pub type MeasurementsCallback = Box<dyn Fn(Vec<Measurement>) + Send + Sync>;
/// Callback invoked with the raw metadata blob.
pub type MetadataCallback = Box<dyn Fn(Vec<u8>) + Send + Sync>;
/// Callback invoked with the stream start time in ticks.
pub type DataStartTimeCallback = Box<dyn Fn(i64) + Send + Sync>;
/// Callback invoked on events that carry no payload.
pub type NotificationCallback = Box<dyn Fn() + Send + Sync>;

/// The closure set a [`DataSubscriber`] reports through.
///
/// Every field is optional; unset events are dropped. Callbacks run on
/// the subscription's callback task, serially and in receipt order, and
/// may call back into the engine - but must not block for long, since
/// every event of the subscription funnels through them.
#[derive(Default)]
pub struct SubscriberHandlers {
    /// Informational messages.
    pub on_status_message: Option<MessageCallback>,
    /// Error messages, including remote command failures.
    pub on_error_message: Option<MessageCallback>,
    /// Decoded measurement batches, one per data packet.
    pub on_measurements: Option<MeasurementsCallback>,
    /// Metadata blobs answering a metadata refresh.
    pub on_metadata: Option<MetadataCallback>,
    /// Stream start time reported by the publisher.
    pub on_data_start_time: Option<DataStartTimeCallback>,
    /// Temporal processing completed.
    pub on_processing_complete: Option<MessageCallback>,
    /// Publisher configuration changed; a metadata refresh is in order.
    pub on_configuration_changed: Option<NotificationCallback>,
    /// The connection ended, locally or by the peer.
    pub on_connection_terminated: Option<NotificationCallback>,
}

impl SubscriberHandlers {
    /// Handlers that drop every event.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the status message handler.
    pub fn on_status(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_status_message = Some(Box::new(f));
        self
    }

    /// Set the error message handler.
    pub fn on_error(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_error_message = Some(Box::new(f));
        self
    }

    /// Set the measurement batch handler.
    pub fn on_measurements(
        mut self,
        f: impl Fn(Vec<Measurement>) + Send + Sync + 'static,
    ) -> Self {
        self.on_measurements = Some(Box::new(f));
        self
    }

    /// Set the metadata handler.
    pub fn on_metadata(mut self, f: impl Fn(Vec<u8>) + Send + Sync + 'static) -> Self {
        self.on_metadata = Some(Box::new(f));
        self
    }

    /// Set the data start time handler.
    pub fn on_data_start_time(mut self, f: impl Fn(i64) + Send + Sync + 'static) -> Self {
        self.on_data_start_time = Some(Box::new(f));
        self
    }

    /// Set the processing complete handler.
    pub fn on_processing_complete(
        mut self,
        f: impl Fn(&str) + Send + Sync + 'static,
    ) -> Self {
        self.on_processing_complete = Some(Box::new(f));
        self
    }

    /// Set the configuration changed handler.
    pub fn on_configuration_changed(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_configuration_changed = Some(Box::new(f));
        self
    }

    /// Set the connection terminated handler.
    pub fn on_connection_terminated(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_connection_terminated = Some(Box::new(f));
        self
    }
}

/// One event crossing the callback queue.
enum Dispatch {
    Status(String),
    ErrorMessage(String),
    Measurements(Vec<Measurement>),
    Metadata(Vec<u8>),
    DataStartTime(i64),
    ProcessingComplete(String),
    ConfigurationChanged,
}

/// Monotonic per-connection statistics, reset on each connect.
#[derive(Default)]
struct Statistics {
    command_channel_bytes: AtomicU64,
    data_channel_bytes: AtomicU64,
    measurements: AtomicU64,
}

/// TSSC decode state shared by both channels.
struct TsscTracker {
    decoder: tssc::Decoder,
    sequence_number: u16,
    reset_requested: bool,
}

/// Everything spawned or opened by `connect`, torn down as a unit.
struct ConnState {
    command_task: JoinHandle<()>,
    callback_task: JoinHandle<()>,
}

type ReconnectHook = Arc<dyn Fn(DataSubscriber) + Send + Sync>;

/// Depth of the callback queue. Deep enough to ride out a slow callback
/// during a traffic burst without stalling the reader.
const CALLBACK_QUEUE_DEPTH: usize = 1024;

struct Inner {
    handlers: SubscriberHandlers,

    compress_payload_data: AtomicBool,
    compress_metadata: AtomicBool,
    compress_signal_index_cache: AtomicBool,

    connected: AtomicBool,
    subscribed: AtomicBool,
    disconnecting: AtomicBool,
    /// A subscription was requested and not explicitly cancelled, so a
    /// reconnect should re-issue it.
    resubscribe_pending: AtomicBool,

    subscriber_id: StdMutex<Uuid>,
    host_address: StdMutex<Option<IpAddr>>,
    cache: StdMutex<Arc<SignalIndexCache>>,
    base_times: StdMutex<BaseTimeUpdate>,
    tssc: StdMutex<TsscTracker>,
    subscription: StdMutex<SubscriptionInfo>,
    stats: Statistics,

    writer: AsyncMutex<Option<OwnedWriteHalf>>,
    callback_tx: StdMutex<Option<mpsc::Sender<Dispatch>>>,
    conn: StdMutex<Option<ConnState>>,
    data_task: StdMutex<Option<JoinHandle<()>>>,

    reconnect_hook: StdMutex<Option<ReconnectHook>>,
}

/// A subscriber endpoint of the Gateway Exchange Protocol.
///
/// Cheap to clone; clones share the same subscription. A subscription is
/// driven through [`connect`](Self::connect),
/// [`subscribe`](Self::subscribe), and
/// [`disconnect`](Self::disconnect); everything the publisher sends back
/// arrives through the [`SubscriberHandlers`] given at construction.
///
/// # Example
///
/// ```ignore
/// use gep::transport::{DataSubscriber, SubscriberHandlers, SubscriptionInfo};
///
/// let subscriber = DataSubscriber::new(
///     SubscriberHandlers::new()
///         .on_status(|msg| println!("{msg}"))
///         .on_measurements(|batch| println!("{} measurements", batch.len())),
/// );
///
/// subscriber.connect("localhost", 7165).await?;
/// subscriber.subscribe(SubscriptionInfo {
///     filter_expression: "PPA:1;PPA:2".into(),
///     ..Default::default()
/// }).await?;
/// ```
#[derive(Clone)]
pub struct DataSubscriber {
    inner: Arc<Inner>,
}

impl DataSubscriber {
    /// Create a subscriber reporting through `handlers`.
    pub fn new(handlers: SubscriberHandlers) -> Self {
        Self {
            inner: Arc::new(Inner {
                handlers,
                compress_payload_data: AtomicBool::new(true),
                compress_metadata: AtomicBool::new(true),
                compress_signal_index_cache: AtomicBool::new(true),
                connected: AtomicBool::new(false),
                subscribed: AtomicBool::new(false),
                disconnecting: AtomicBool::new(false),
                resubscribe_pending: AtomicBool::new(false),
                subscriber_id: StdMutex::new(Uuid::nil()),
                host_address: StdMutex::new(None),
                cache: StdMutex::new(Arc::new(SignalIndexCache::new())),
                base_times: StdMutex::new(BaseTimeUpdate {
                    time_index: 0,
                    offsets: [0, 0],
                }),
                tssc: StdMutex::new(TsscTracker {
                    decoder: tssc::Decoder::new(),
                    sequence_number: 0,
                    reset_requested: false,
                }),
                subscription: StdMutex::new(SubscriptionInfo::default()),
                stats: Statistics::default(),
                writer: AsyncMutex::new(None),
                callback_tx: StdMutex::new(None),
                conn: StdMutex::new(None),
                data_task: StdMutex::new(None),
                reconnect_hook: StdMutex::new(None),
            }),
        }
    }

    // ========================================================================
    // Pre-connect configuration
    // ========================================================================

    /// Whether payload data compression (TSSC) will be requested.
    pub fn is_payload_data_compressed(&self) -> bool {
        self.inner.compress_payload_data.load(Ordering::Relaxed)
    }

    /// Request or decline payload data compression. Takes effect at the
    /// next connect; operational modes cannot be renegotiated.
    pub fn set_payload_data_compressed(&self, compressed: bool) {
        self.inner
            .compress_payload_data
            .store(compressed, Ordering::Relaxed);
    }

    /// Whether metadata exchange compression (GZip) will be requested.
    pub fn is_metadata_compressed(&self) -> bool {
        self.inner.compress_metadata.load(Ordering::Relaxed)
    }

    /// Request or decline metadata compression.
    pub fn set_metadata_compressed(&self, compressed: bool) {
        self.inner
            .compress_metadata
            .store(compressed, Ordering::Relaxed);
    }

    /// Whether signal-index-cache compression (GZip) will be requested.
    pub fn is_signal_index_cache_compressed(&self) -> bool {
        self.inner
            .compress_signal_index_cache
            .load(Ordering::Relaxed)
    }

    /// Request or decline signal-index-cache compression.
    pub fn set_signal_index_cache_compressed(&self, compressed: bool) {
        self.inner
            .compress_signal_index_cache
            .store(compressed, Ordering::Relaxed);
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Whether the command channel is connected.
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Whether a subscription is active.
    pub fn is_subscribed(&self) -> bool {
        self.inner.subscribed.load(Ordering::Acquire)
    }

    /// The subscriber UUID assigned by the publisher, nil before the
    /// first signal index cache arrives.
    pub fn subscriber_id(&self) -> Uuid {
        *self.inner.subscriber_id.lock().expect("subscriber id lock")
    }

    /// The configuration of the most recent subscription.
    pub fn subscription_info(&self) -> SubscriptionInfo {
        self.inner.subscription.lock().expect("subscription lock").clone()
    }

    /// Store subscription configuration ahead of [`connect`](Self::connect).
    ///
    /// Operational modes depend on the subscription shape (TSSC is not
    /// requested when a UDP data channel is planned), so a subscription
    /// that will use UDP should be stored before connecting.
    pub fn set_subscription_info(&self, info: SubscriptionInfo) {
        *self.inner.subscription.lock().expect("subscription lock") = info;
    }

    /// Total bytes received on the command channel since the last connect.
    pub fn total_command_channel_bytes_received(&self) -> u64 {
        self.inner
            .stats
            .command_channel_bytes
            .load(Ordering::Relaxed)
    }

    /// Total bytes received on the data channel since the last connect.
    /// Without a UDP data channel this is the command channel total,
    /// since data packets ride the command channel.
    pub fn total_data_channel_bytes_received(&self) -> u64 {
        let udp = self
            .inner
            .subscription
            .lock()
            .expect("subscription lock")
            .udp_data_channel;
        if udp {
            self.inner.stats.data_channel_bytes.load(Ordering::Relaxed)
        } else {
            self.total_command_channel_bytes_received()
        }
    }

    /// Total measurements received since the last subscribe.
    pub fn total_measurements_received(&self) -> u64 {
        self.inner.stats.measurements.load(Ordering::Relaxed)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Resolve `hostname`, open the command channel, start the reader and
    /// callback tasks, and negotiate operational modes.
    pub async fn connect(&self, hostname: &str, port: u16) -> Result<()> {
        if self.is_connected() {
            return Err(Error::InvalidState(
                "subscriber is already connected; disconnect first",
            ));
        }

        self.inner
            .stats
            .command_channel_bytes
            .store(0, Ordering::Relaxed);
        self.inner
            .stats
            .data_channel_bytes
            .store(0, Ordering::Relaxed);
        self.inner.stats.measurements.store(0, Ordering::Relaxed);

        let addr = lookup_host((hostname, port))
            .await
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| Error::Resolve {
                host: hostname.to_string(),
                port,
            })?;

        let stream = TcpStream::connect(addr).await?;
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();

        *self.inner.host_address.lock().expect("host address lock") = Some(addr.ip());
        *self.inner.writer.lock().await = Some(write_half);

        let (tx, rx) = mpsc::channel(CALLBACK_QUEUE_DEPTH);
        *self.inner.callback_tx.lock().expect("callback tx lock") = Some(tx);

        let callback_task = tokio::spawn(run_callbacks(self.inner.clone(), rx));
        let command_task = tokio::spawn(run_command_channel(self.inner.clone(), read_half));

        *self.inner.conn.lock().expect("conn lock") = Some(ConnState {
            command_task,
            callback_task,
        });

        if let Err(e) = self.send_operational_modes().await {
            // The channel opened but the handshake failed; unwind the
            // half-built connection without reporting a termination.
            shutdown_with(&self.inner, false, false).await;
            return Err(e);
        }

        self.inner.connected.store(true, Ordering::Release);

        debug!(host = hostname, port, "command channel connected");
        Ok(())
    }

    /// Disconnect from the publisher. Shuts down both channels, stops all
    /// owned tasks, and does not return until they have exited. Pending
    /// callbacks are released, not drained.
    ///
    /// Must not be called from inside a subscription callback; the
    /// callback task cannot wait for itself.
    pub async fn disconnect(&self) {
        shutdown(&self.inner, false).await;
    }

    /// Subscribe with the given configuration. An active subscription is
    /// silently unsubscribed first.
    pub async fn subscribe(&self, info: SubscriptionInfo) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::InvalidState("subscriber is not connected"));
        }

        if self.is_subscribed() {
            self.unsubscribe().await?;
        }

        self.inner.stats.measurements.store(0, Ordering::Relaxed);
        let mut info = info;

        if info.udp_data_channel {
            let family = self
                .inner
                .host_address
                .lock()
                .expect("host address lock")
                .unwrap_or(IpAddr::from([0u8, 0, 0, 0]));

            // Bind with the remote's address family so the publisher can
            // reach us over the same protocol it speaks to us on.
            let bind_addr: std::net::SocketAddr = match family {
                IpAddr::V4(_) => (std::net::Ipv4Addr::UNSPECIFIED, info.data_channel_local_port)
                    .into(),
                IpAddr::V6(_) => (std::net::Ipv6Addr::UNSPECIFIED, info.data_channel_local_port)
                    .into(),
            };

            let socket = UdpSocket::bind(bind_addr).await?;

            // Port 0 requests an ephemeral port; advertise what the OS
            // actually assigned.
            if let Ok(local) = socket.local_addr() {
                info.data_channel_local_port = local.port();
            }

            let task = tokio::spawn(run_data_channel(self.inner.clone(), socket));

            if let Some(previous) = self
                .inner
                .data_task
                .lock()
                .expect("data task lock")
                .replace(task)
            {
                previous.abort();
            }
        }

        *self.inner.subscription.lock().expect("subscription lock") = info.clone();

        let connection_string = info.to_connection_string();
        let string_bytes = connection_string.as_bytes();

        let mut body = Vec::with_capacity(5 + string_bytes.len());
        body.push(DataPacketFlags::COMPACT);
        body.extend_from_slice(&(string_bytes.len() as u32).to_be_bytes());
        body.extend_from_slice(string_bytes);

        self.send_server_command(ServerCommand::SUBSCRIBE, &body)
            .await?;

        // The decoder resynchronizes on the publisher's first packet.
        self.inner.tssc.lock().expect("tssc lock").reset_requested = true;
        self.inner
            .resubscribe_pending
            .store(true, Ordering::Release);

        Ok(())
    }

    /// Subscribe again with the stored configuration, after a reconnect.
    pub async fn resubscribe(&self) -> Result<()> {
        let info = self.subscription_info();
        self.subscribe(info).await
    }

    /// Cancel the current subscription. The data channel, if any, stops
    /// immediately; the subscribed state clears when the publisher
    /// confirms.
    pub async fn unsubscribe(&self) -> Result<()> {
        let task = self.inner.data_task.lock().expect("data task lock").take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }

        self.inner
            .resubscribe_pending
            .store(false, Ordering::Release);

        self.send_server_command(ServerCommand::UNSUBSCRIBE, &[])
            .await
    }

    /// Request a metadata refresh from the publisher.
    pub async fn request_metadata(&self) -> Result<()> {
        self.send_server_command(ServerCommand::METADATA_REFRESH, &[])
            .await
    }

    /// Update the temporal processing interval. Only valid while
    /// subscribed.
    pub async fn set_processing_interval(&self, interval_ms: i32) -> Result<()> {
        if !self.is_subscribed() {
            return Err(Error::InvalidState(
                "processing interval updates require an active subscription",
            ));
        }

        self.send_server_command(
            ServerCommand::UPDATE_PROCESSING_INTERVAL,
            &interval_ms.to_be_bytes(),
        )
        .await
    }

    /// Send a raw command frame to the publisher.
    pub async fn send_server_command(&self, command: u8, body: &[u8]) -> Result<()> {
        let mut frame = Vec::with_capacity(PAYLOAD_HEADER_SIZE + 1 + body.len());
        frame::write_command_frame(&mut frame, command, body);

        let mut writer = self.inner.writer.lock().await;
        let Some(write_half) = writer.as_mut() else {
            return Err(Error::InvalidState("command channel is not open"));
        };

        match write_half.write_all(&frame).await {
            Ok(()) => {
                debug!(command, len = frame.len(), "command sent");
                Ok(())
            }
            Err(e) => {
                drop(writer);
                let lost = super::error::connection_lost(&e);
                if self.inner.connected.load(Ordering::Acquire)
                    && !self.inner.disconnecting.load(Ordering::Acquire)
                {
                    tokio::spawn(shutdown_owned(self.inner.clone(), true));
                }
                Err(lost)
            }
        }
    }

    /// Send the configured operational modes. Called once per connect,
    /// before any other command.
    async fn send_operational_modes(&self) -> Result<()> {
        let udp = self
            .inner
            .subscription
            .lock()
            .expect("subscription lock")
            .udp_data_channel;

        let mut modes = CompressionModes::GZIP
            | OperationalEncoding::UTF8
            | OperationalModes::USE_COMMON_SERIALIZATION_FORMAT;

        // TSSC is stateful; it only survives on a lossless channel.
        if self.is_payload_data_compressed() && !udp {
            modes |= OperationalModes::COMPRESS_PAYLOAD_DATA | CompressionModes::TSSC;
        }

        if self.is_metadata_compressed() {
            modes |= OperationalModes::COMPRESS_METADATA;
        }

        if self.is_signal_index_cache_compressed() {
            modes |= OperationalModes::COMPRESS_SIGNAL_INDEX_CACHE;
        }

        self.send_server_command(ServerCommand::DEFINE_OPERATIONAL_MODES, &modes.to_be_bytes())
            .await
    }

    /// Whether a reconnect should re-issue the stored subscription.
    pub(crate) fn should_resubscribe(&self) -> bool {
        self.inner.resubscribe_pending.load(Ordering::Acquire)
    }

    /// Install the hook the connector fires after a terminated connection
    /// when auto-reconnect is enabled.
    pub(crate) fn register_auto_reconnect_hook(&self, hook: ReconnectHook) {
        *self
            .inner
            .reconnect_hook
            .lock()
            .expect("reconnect hook lock") = Some(hook);
    }
}

// ============================================================================
// Connection teardown
// ============================================================================

async fn shutdown_owned(inner: Arc<Inner>, auto_reconnect: bool) {
    shutdown(&inner, auto_reconnect).await;
}

async fn shutdown(inner: &Arc<Inner>, auto_reconnect: bool) {
    shutdown_with(inner, auto_reconnect, true).await;
}

async fn shutdown_with(inner: &Arc<Inner>, auto_reconnect: bool, notify_terminated: bool) {
    if inner.disconnecting.swap(true, Ordering::AcqRel) {
        return;
    }

    inner.connected.store(false, Ordering::Release);
    inner.subscribed.store(false, Ordering::Release);

    // Closing the write half and aborting the readers unblocks every
    // pending socket operation.
    *inner.writer.lock().await = None;
    inner.callback_tx.lock().expect("callback tx lock").take();

    let data_task = inner.data_task.lock().expect("data task lock").take();
    if let Some(task) = data_task {
        task.abort();
        let _ = task.await;
    }

    let conn = inner.conn.lock().expect("conn lock").take();
    if let Some(conn) = conn {
        conn.command_task.abort();
        let _ = conn.command_task.await;
        // Pending callbacks are released, not drained.
        conn.callback_task.abort();
        let _ = conn.callback_task.await;
    }

    if notify_terminated {
        invoke_notification(inner, &inner.handlers.on_connection_terminated);
    }

    inner.disconnecting.store(false, Ordering::Release);

    if auto_reconnect {
        let hook = inner
            .reconnect_hook
            .lock()
            .expect("reconnect hook lock")
            .clone();
        if let Some(hook) = hook {
            let subscriber = DataSubscriber {
                inner: inner.clone(),
            };
            // Reconnection happens on its own task; the user's terminated
            // callback has already run.
            tokio::spawn(async move { hook(subscriber) });
        }
    }
}

// ============================================================================
// Reader tasks
// ============================================================================

async fn run_command_channel(inner: Arc<Inner>, mut read_half: OwnedReadHalf) {
    let mut header = [0u8; PAYLOAD_HEADER_SIZE];

    loop {
        if let Err(e) = read_half.read_exact(&mut header).await {
            on_channel_lost(&inner, &e);
            return;
        }

        inner
            .stats
            .command_channel_bytes
            .fetch_add(PAYLOAD_HEADER_SIZE as u64, Ordering::Relaxed);

        let packet_size =
            u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;

        let mut packet = BytesMut::zeroed(packet_size);
        if let Err(e) = read_half.read_exact(&mut packet).await {
            on_channel_lost(&inner, &e);
            return;
        }

        inner
            .stats
            .command_channel_bytes
            .fetch_add(packet_size as u64, Ordering::Relaxed);

        if let Err(e) = process_server_response(&inner, packet.freeze()).await {
            if matches!(e, Error::Malformed { .. }) {
                // Protocol violations terminate the connection.
                dispatch(&inner, Dispatch::ErrorMessage(e.to_string())).await;
                if !inner.disconnecting.load(Ordering::Acquire) {
                    tokio::spawn(shutdown_owned(inner.clone(), true));
                }
                return;
            }
            dispatch(&inner, Dispatch::ErrorMessage(e.to_string())).await;
        }
    }
}

async fn run_data_channel(inner: Arc<Inner>, socket: UdpSocket) {
    let mut buffer = vec![0u8; MAX_PACKET_SIZE];

    loop {
        let length = match socket.recv_from(&mut buffer).await {
            Ok((length, _)) => length,
            Err(e) => {
                if !inner.disconnecting.load(Ordering::Acquire) {
                    dispatch(
                        &inner,
                        Dispatch::ErrorMessage(format!(
                            "Error reading data from data channel: {e}"
                        )),
                    )
                    .await;
                }
                return;
            }
        };

        inner
            .stats
            .data_channel_bytes
            .fetch_add(length as u64, Ordering::Relaxed);

        // A datagram is one complete response frame; losses just thin the
        // stream. TSSC notices gaps through its sequence numbers.
        let packet = Bytes::copy_from_slice(&buffer[..length]);
        if let Err(e) = process_server_response(&inner, packet).await {
            dispatch(&inner, Dispatch::ErrorMessage(e.to_string())).await;
        }
    }
}

fn on_channel_lost(inner: &Arc<Inner>, error: &std::io::Error) {
    if inner.disconnecting.load(Ordering::Acquire) {
        return;
    }

    debug!(%error, "command channel closed");
    tokio::spawn(shutdown_owned(inner.clone(), true));
}

// ============================================================================
// Response dispatch
// ============================================================================

async fn process_server_response(inner: &Arc<Inner>, packet: Bytes) -> Result<()> {
    let (response, command, _) = frame::split_response(&packet)?;
    let body = packet.slice(RESPONSE_HEADER_SIZE..);

    match response {
        ServerResponse::SUCCEEDED => handle_succeeded(inner, command, &body).await,
        ServerResponse::FAILED => {
            let message = String::from_utf8_lossy(&body);
            dispatch(
                inner,
                Dispatch::ErrorMessage(format!(
                    "Received failure code from server command {command:#04X}: {message}"
                )),
            )
            .await;
            Ok(())
        }
        ServerResponse::DATA_PACKET => handle_data_packet(inner, body).await,
        ServerResponse::UPDATE_SIGNAL_INDEX_CACHE => {
            handle_update_signal_index_cache(inner, &body).await
        }
        ServerResponse::UPDATE_BASE_TIMES => handle_update_base_times(inner, &body).await,
        ServerResponse::UPDATE_CIPHER_KEYS => {
            let cipher_index = body.first().copied().unwrap_or(0);
            dispatch(
                inner,
                Dispatch::Status(format!(
                    "Received new cipher keys from publisher (cipher index {cipher_index})"
                )),
            )
            .await;
            Ok(())
        }
        ServerResponse::DATA_START_TIME => {
            if body.len() >= 8 {
                let ticks = i64::from_be_bytes(body[..8].try_into().unwrap_or_default());
                dispatch(inner, Dispatch::DataStartTime(ticks)).await;
            }
            Ok(())
        }
        ServerResponse::PROCESSING_COMPLETE => {
            let message = String::from_utf8_lossy(&body).into_owned();
            dispatch(inner, Dispatch::ProcessingComplete(message)).await;
            Ok(())
        }
        ServerResponse::NOTIFY => handle_notify(inner, &body).await,
        ServerResponse::CONFIGURATION_CHANGED => {
            dispatch(inner, Dispatch::ConfigurationChanged).await;
            Ok(())
        }
        ServerResponse::NO_OP => Ok(()),
        other => {
            dispatch(
                inner,
                Dispatch::ErrorMessage(format!(
                    "Encountered unexpected server response code: {other:#04X}"
                )),
            )
            .await;
            Ok(())
        }
    }
}

async fn handle_succeeded(inner: &Arc<Inner>, command: u8, body: &Bytes) -> Result<()> {
    match command {
        ServerCommand::METADATA_REFRESH => {
            // The response body is the metadata itself, not a message.
            let blob = if inner.compress_metadata.load(Ordering::Relaxed) {
                gzip::inflate(body)?
            } else {
                body.to_vec()
            };
            dispatch(inner, Dispatch::Metadata(blob)).await;
        }
        ServerCommand::SUBSCRIBE | ServerCommand::UNSUBSCRIBE => {
            inner
                .subscribed
                .store(command == ServerCommand::SUBSCRIBE, Ordering::Release);
            dispatch_success_message(inner, command, body).await;
        }
        ServerCommand::AUTHENTICATE
        | ServerCommand::ROTATE_CIPHER_KEYS
        | ServerCommand::UPDATE_PROCESSING_INTERVAL => {
            dispatch_success_message(inner, command, body).await;
        }
        unknown => {
            // The data that rides an unknown success response cannot be
            // interpreted.
            dispatch(
                inner,
                Dispatch::ErrorMessage(format!(
                    "Received success code in response to unknown server command {unknown:#04X}"
                )),
            )
            .await;
        }
    }
    Ok(())
}

async fn dispatch_success_message(inner: &Arc<Inner>, command: u8, body: &Bytes) {
    let message = String::from_utf8_lossy(body);
    dispatch(
        inner,
        Dispatch::Status(format!(
            "Received success code in response to server command {command:#04X}: {message}"
        )),
    )
    .await;
}

async fn handle_update_signal_index_cache(inner: &Arc<Inner>, body: &Bytes) -> Result<()> {
    let raw = if inner.compress_signal_index_cache.load(Ordering::Relaxed) {
        gzip::inflate(body)?
    } else {
        body.to_vec()
    };

    let (cache, subscriber_id) = SignalIndexCache::parse(&raw)?;
    debug!(signals = cache.len(), "signal index cache updated");

    // Replacement is atomic: decoding in flight keeps the old handle.
    *inner.cache.lock().expect("cache lock") = Arc::new(cache);
    *inner.subscriber_id.lock().expect("subscriber id lock") = subscriber_id;

    Ok(())
}

async fn handle_update_base_times(inner: &Arc<Inner>, body: &Bytes) -> Result<()> {
    let update = BaseTimeUpdate::parse(body)?;
    *inner.base_times.lock().expect("base times lock") = update;

    dispatch(
        inner,
        Dispatch::Status(format!(
            "Received new base time offset from publisher: {} ticks",
            update.offsets[update.time_index ^ 1]
        )),
    )
    .await;

    Ok(())
}

async fn handle_notify(inner: &Arc<Inner>, body: &Bytes) -> Result<()> {
    if body.len() < 4 {
        return Err(Error::malformed("notification", "body shorter than its hash"));
    }

    let hash = &body[..4];
    let message = String::from_utf8_lossy(&body[4..]).into_owned();

    dispatch(inner, Dispatch::Status(format!("NOTIFICATION: {message}"))).await;

    // Confirm so the publisher stops redelivering.
    let subscriber = DataSubscriber {
        inner: inner.clone(),
    };
    subscriber
        .send_server_command(ServerCommand::CONFIRM_NOTIFICATION, hash)
        .await
}

// ============================================================================
// Data packet decoding (inline on the reader)
// ============================================================================

async fn handle_data_packet(inner: &Arc<Inner>, body: Bytes) -> Result<()> {
    if body.is_empty() {
        return Err(Error::malformed("data packet", "missing flags byte"));
    }

    let (mut include_time, use_millisecond_resolution) = {
        let info = inner.subscription.lock().expect("subscription lock");
        (info.include_time, info.use_millisecond_resolution)
    };

    let flags = body[0];
    let mut offset = 1;

    // A synchronized packet stamps the whole frame; records inherit it.
    let mut frame_level_timestamp = None;

    if flags & DataPacketFlags::SYNCHRONIZED != 0 {
        if body.len() < offset + 8 {
            return Err(Error::malformed("data packet", "truncated frame timestamp"));
        }
        frame_level_timestamp = Some(i64::from_be_bytes(
            body[offset..offset + 8].try_into().unwrap_or_default(),
        ));
        include_time = false;
        offset += 8;
    }

    if body.len() < offset + 4 {
        return Err(Error::malformed("data packet", "truncated measurement count"));
    }
    let count = u32::from_be_bytes(body[offset..offset + 4].try_into().unwrap_or_default());
    offset += 4;

    inner
        .stats
        .measurements
        .fetch_add(u64::from(count), Ordering::Relaxed);

    let measurements = if flags & DataPacketFlags::COMPRESSED != 0 {
        parse_tssc_measurements(inner, body.slice(offset..)).await?
    } else {
        parse_compact_measurements(
            inner,
            &body[offset..],
            include_time,
            use_millisecond_resolution,
            frame_level_timestamp,
        )
        .await
    };

    if !measurements.is_empty() {
        dispatch(inner, Dispatch::Measurements(measurements)).await;
    }

    Ok(())
}

async fn parse_tssc_measurements(inner: &Arc<Inner>, data: Bytes) -> Result<Vec<Measurement>> {
    if data.len() < 3 {
        return Err(Error::malformed("TSSC payload", "truncated header"));
    }

    if data[0] != TSSC_VERSION {
        return Err(Error::malformed(
            "TSSC payload",
            format!("version not recognized: {:#04X}", data[0]),
        ));
    }

    let sequence_number = u16::from_be_bytes([data[1], data[2]]);
    let cache = inner.cache.lock().expect("cache lock").clone();

    // The tracker lock never crosses an await: decode fully, then report.
    let (measurements, status, failure) =
        decode_tssc_block(inner, &cache, sequence_number, data);

    if let Some(message) = status {
        dispatch(inner, Dispatch::Status(message)).await;
    }
    if let Some(message) = failure {
        dispatch(inner, Dispatch::ErrorMessage(message)).await;
    }

    Ok(measurements)
}

fn decode_tssc_block(
    inner: &Arc<Inner>,
    cache: &SignalIndexCache,
    sequence_number: u16,
    data: Bytes,
) -> (Vec<Measurement>, Option<String>, Option<String>) {
    let mut tracker = inner.tssc.lock().expect("tssc lock");

    let mut status = None;
    let mut failure = None;
    let mut measurements = Vec::new();

    if sequence_number == 0 && tracker.sequence_number > 0 {
        if !tracker.reset_requested {
            status = Some(format!(
                "TSSC algorithm reset before sequence number: {}",
                tracker.sequence_number
            ));
        }
        tracker.decoder.reset();
        tracker.sequence_number = 0;
        tracker.reset_requested = false;
    }

    if tracker.sequence_number != sequence_number {
        if !tracker.reset_requested {
            failure = Some(
                Error::OutOfSequence {
                    expected: tracker.sequence_number,
                    actual: sequence_number,
                }
                .to_string(),
            );
        }
        // Drop packets until the reset arrives.
        return (measurements, status, failure);
    }

    tracker.decoder.set_buffer(data.slice(3..));

    loop {
        match tracker.decoder.try_get_measurement() {
            Ok(Some((id, timestamp, quality, value))) => {
                let Some((signal_id, source, point_id)) = cache.measurement_key(id) else {
                    // Unknown indices thin the stream silently.
                    continue;
                };
                measurements.push(Measurement {
                    signal_id,
                    source: source.to_string(),
                    id: point_id,
                    timestamp,
                    flags: quality,
                    value: f64::from(value),
                    ..Default::default()
                });
            }
            Ok(None) => break,
            Err(e) => {
                failure = Some(format!("Decompression failure: {e}"));
                break;
            }
        }
    }

    tracker.sequence_number = tracker.sequence_number.wrapping_add(1);
    // Zero is reserved for reset; skip it on roll-over.
    if tracker.sequence_number == 0 {
        tracker.sequence_number = 1;
    }

    (measurements, status, failure)
}

async fn parse_compact_measurements(
    inner: &Arc<Inner>,
    data: &[u8],
    include_time: bool,
    use_millisecond_resolution: bool,
    frame_level_timestamp: Option<i64>,
) -> Vec<Measurement> {
    let cache = inner.cache.lock().expect("cache lock").clone();
    let base_times = *inner.base_times.lock().expect("base times lock");

    let codec = CompactMeasurement::new(
        &cache,
        base_times.offsets,
        include_time,
        use_millisecond_resolution,
    );

    let mut measurements = Vec::new();
    let mut errors = Vec::new();
    let mut offset = 0;

    while offset < data.len() {
        match codec.try_parse(data, &mut offset) {
            Ok(mut measurement) => {
                if let Some(timestamp) = frame_level_timestamp {
                    measurement.timestamp = timestamp;
                }
                measurements.push(measurement);
            }
            Err(Error::UnknownSignalIndex(index)) => {
                // Skipped silently; the cache update is likely in flight.
                warn!(signal_index = index, "measurement for unknown signal index");
            }
            Err(e @ Error::MissingBaseTime(_)) => {
                errors.push(e.to_string());
            }
            Err(_) => {
                errors.push("Error parsing measurement".to_string());
                break;
            }
        }
    }

    for message in errors {
        dispatch(inner, Dispatch::ErrorMessage(message)).await;
    }

    measurements
}

// ============================================================================
// Callback execution
// ============================================================================

async fn dispatch(inner: &Arc<Inner>, event: Dispatch) {
    let tx = inner.callback_tx.lock().expect("callback tx lock").clone();
    if let Some(tx) = tx {
        // Receipt order is delivery order; the queue preserves it.
        let _ = tx.send(event).await;
    }
}

async fn run_callbacks(inner: Arc<Inner>, mut rx: mpsc::Receiver<Dispatch>) {
    while let Some(event) = rx.recv().await {
        match event {
            Dispatch::Status(message) => {
                invoke_message(&inner, &inner.handlers.on_status_message, &message);
            }
            Dispatch::ErrorMessage(message) => {
                invoke_message(&inner, &inner.handlers.on_error_message, &message);
            }
            Dispatch::Measurements(batch) => {
                if let Some(f) = &inner.handlers.on_measurements {
                    guard_callback(&inner, || f(batch));
                }
            }
            Dispatch::Metadata(blob) => {
                if let Some(f) = &inner.handlers.on_metadata {
                    guard_callback(&inner, || f(blob));
                }
            }
            Dispatch::DataStartTime(ticks) => {
                if let Some(f) = &inner.handlers.on_data_start_time {
                    guard_callback(&inner, || f(ticks));
                }
            }
            Dispatch::ProcessingComplete(message) => {
                if let Some(f) = &inner.handlers.on_processing_complete {
                    guard_callback(&inner, || f(&message));
                }
            }
            Dispatch::ConfigurationChanged => {
                invoke_notification(&inner, &inner.handlers.on_configuration_changed);
            }
        }
    }
}

fn invoke_message(inner: &Arc<Inner>, handler: &Option<MessageCallback>, message: &str) {
    if let Some(f) = handler {
        guard_callback(inner, || f(message));
    }
}

fn invoke_notification(inner: &Arc<Inner>, handler: &Option<NotificationCallback>) {
    if let Some(f) = handler {
        guard_callback(inner, || f());
    }
}

/// Run a user callback, translating a panic into an error message rather
/// than letting it tear through the engine's tasks.
fn guard_callback(inner: &Arc<Inner>, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        if let Some(on_error) = &inner.handlers.on_error_message {
            let _ = catch_unwind(AssertUnwindSafe(|| {
                on_error("Exception in user callback");
            }));
        }
    }
}
