//! The publisher engine.
//!
//! [`DataPublisher`] is the server side of the protocol: it listens for
//! subscribers, negotiates operational modes, assigns each client a
//! signal index cache over the signals the publisher has defined, and
//! fans measurement batches out as compact or TSSC data packets over TCP
//! or UDP per client. Cipher-key rotation is carried as protocol
//! plumbing; payloads themselves are not encrypted.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::compact::CompactMeasurement;
use super::config::ConnectionString;
use super::constants::{
    CompressionModes, DataPacketFlags, MAX_PACKET_SIZE, OperationalModes, PAYLOAD_HEADER_SIZE,
    ServerCommand, ServerResponse, TSSC_VERSION,
};
use super::error::{Error, Result};
use super::frame::{self, BaseTimeUpdate, PayloadHeader};
use super::signal_index_cache::SignalIndexCache;
use super::subscriber::MessageCallback;
use super::tssc;
use super::types::Measurement;
use crate::util::gzip;
use crate::util::time::{TICKS_PER_MILLISECOND, TICKS_PER_SECOND, ticks_now};

/// Callback invoked with a client's subscriber UUID and connection id.
pub type ClientCallback = Box<dyn Fn(Uuid, &str) + Send + Sync>;

/// Room reserved for packet headers inside [`MAX_PACKET_SIZE`].
const DATA_PACKET_BODY_LIMIT: usize = MAX_PACKET_SIZE - 16;

/// Publisher behavior configuration.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Listen on IPv6 instead of IPv4.
    pub ipv6: bool,
    /// Maximum concurrent client connections; -1 means unlimited.
    pub max_allowed_connections: i32,
    /// Honor metadata refresh requests.
    pub metadata_refresh_allowed: bool,
    /// Let clients request NaN-value filtering.
    pub nan_value_filter_allowed: bool,
    /// Filter NaN values for every client, requested or not.
    pub nan_value_filter_forced: bool,
    /// Period between automatic cipher key rotations; zero disables the
    /// feature entirely, including manual rotation requests.
    pub cipher_key_rotation_period: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            ipv6: false,
            max_allowed_connections: -1,
            metadata_refresh_allowed: true,
            nan_value_filter_allowed: true,
            nan_value_filter_forced: false,
            cipher_key_rotation_period: Duration::ZERO,
        }
    }
}

/// The closure set a [`DataPublisher`] reports through.
#[derive(Default)]
pub struct PublisherHandlers {
    /// Informational messages.
    pub on_status_message: Option<MessageCallback>,
    /// Error messages.
    pub on_error_message: Option<MessageCallback>,
    /// A client finished connecting.
    pub on_client_connected: Option<ClientCallback>,
    /// A client disconnected or was dropped.
    pub on_client_disconnected: Option<ClientCallback>,
}

impl PublisherHandlers {
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

    /// Set the client connected handler.
    pub fn on_client_connected(
        mut self,
        f: impl Fn(Uuid, &str) + Send + Sync + 'static,
    ) -> Self {
        self.on_client_connected = Some(Box::new(f));
        self
    }

    /// Set the client disconnected handler.
    pub fn on_client_disconnected(
        mut self,
        f: impl Fn(Uuid, &str) + Send + Sync + 'static,
    ) -> Self {
        self.on_client_disconnected = Some(Box::new(f));
        self
    }
}

/// One signal the publisher can serve: the cache tuple subscribers are
/// given for it.
#[derive(Debug, Clone)]
pub struct SignalDefinition {
    /// Globally unique signal identifier.
    pub signal_id: Uuid,
    /// Source half of the measurement key.
    pub source: String,
    /// Numeric half of the measurement key.
    pub id: u32,
}

/// TSSC encode state for one client.
struct ClientTssc {
    encoder: tssc::Encoder,
    sequence_number: u16,
}

/// Per-client connection state.
struct ClientState {
    client_id: u64,
    subscriber_id: Uuid,
    connection_id: String,
    remote_addr: SocketAddr,

    operational_modes: AtomicU32,
    subscribed: AtomicBool,
    include_time: AtomicBool,
    use_millisecond_resolution: AtomicBool,
    request_nan_filter: AtomicBool,
    processing_interval: AtomicI32,
    cipher_index: AtomicBool,
    start_time_sent: AtomicBool,

    udp_port: StdMutex<Option<u16>>,
    cache: StdMutex<Option<Arc<SignalIndexCache>>>,
    base_times: StdMutex<BaseTimeUpdate>,
    tssc: StdMutex<ClientTssc>,

    writer: AsyncMutex<OwnedWriteHalf>,
}

impl ClientState {
    fn uses_tssc(&self) -> bool {
        let modes = self.operational_modes.load(Ordering::Relaxed);
        modes & OperationalModes::COMPRESS_PAYLOAD_DATA != 0
            && modes & CompressionModes::TSSC != 0
    }

    fn compresses_cache(&self) -> bool {
        self.operational_modes.load(Ordering::Relaxed)
            & OperationalModes::COMPRESS_SIGNAL_INDEX_CACHE
            != 0
    }

    fn compresses_metadata(&self) -> bool {
        self.operational_modes.load(Ordering::Relaxed) & OperationalModes::COMPRESS_METADATA != 0
    }
}

#[derive(Default)]
struct PubStatistics {
    command_channel_bytes: AtomicU64,
    data_channel_bytes: AtomicU64,
    measurements: AtomicU64,
}

struct PubInner {
    config: PublisherConfig,
    handlers: PublisherHandlers,

    metadata: StdMutex<Arc<Vec<u8>>>,
    signals: StdMutex<Arc<Vec<SignalDefinition>>>,

    clients: StdMutex<HashMap<u64, Arc<ClientState>>>,
    next_client_id: AtomicU64,

    started: AtomicBool,
    local_port: AtomicU32,
    listener_task: StdMutex<Option<JoinHandle<()>>>,
    rotation_task: StdMutex<Option<JoinHandle<()>>>,
    client_tasks: StdMutex<HashMap<u64, JoinHandle<()>>>,
    udp_socket: StdMutex<Option<Arc<UdpSocket>>>,

    stats: PubStatistics,
}

/// A publisher endpoint of the Gateway Exchange Protocol.
///
/// Cheap to clone; clones share the same server.
///
/// # Example
///
/// ```ignore
/// use gep::transport::{DataPublisher, PublisherConfig, PublisherHandlers, SignalDefinition};
///
/// let publisher = DataPublisher::new(
///     PublisherConfig::default(),
///     PublisherHandlers::new().on_status(|msg| println!("{msg}")),
/// );
///
/// publisher.define_signals(signals);
/// publisher.start(7165).await?;
///
/// loop {
///     publisher.publish_measurements(&acquire_frame()).await?;
/// }
/// ```
#[derive(Clone)]
pub struct DataPublisher {
    inner: Arc<PubInner>,
}

impl DataPublisher {
    /// Create a publisher with the given configuration and handlers.
    pub fn new(config: PublisherConfig, handlers: PublisherHandlers) -> Self {
        Self {
            inner: Arc::new(PubInner {
                config,
                handlers,
                metadata: StdMutex::new(Arc::new(Vec::new())),
                signals: StdMutex::new(Arc::new(Vec::new())),
                clients: StdMutex::new(HashMap::new()),
                next_client_id: AtomicU64::new(1),
                started: AtomicBool::new(false),
                local_port: AtomicU32::new(0),
                listener_task: StdMutex::new(None),
                rotation_task: StdMutex::new(None),
                client_tasks: StdMutex::new(HashMap::new()),
                udp_socket: StdMutex::new(None),
                stats: PubStatistics::default(),
            }),
        }
    }

    /// Define the metadata blob served to metadata refresh requests. The
    /// content is opaque to the transport.
    pub fn define_metadata(&self, metadata: Vec<u8>) {
        *self.inner.metadata.lock().expect("metadata lock") = Arc::new(metadata);
    }

    /// Define the signals this publisher serves. New subscriptions are
    /// granted a cache over exactly these signals.
    pub fn define_signals(&self, signals: Vec<SignalDefinition>) {
        *self.inner.signals.lock().expect("signals lock") = Arc::new(signals);
    }

    /// Bind the listener and start accepting subscribers. Port 0 binds an
    /// ephemeral port, readable afterwards via [`local_port`](Self::local_port).
    pub async fn start(&self, port: u16) -> Result<()> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(Error::InvalidState("publisher is already started"));
        }

        let bind_addr: SocketAddr = if self.inner.config.ipv6 {
            (std::net::Ipv6Addr::UNSPECIFIED, port).into()
        } else {
            (std::net::Ipv4Addr::UNSPECIFIED, port).into()
        };

        let listener = match TcpListener::bind(bind_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.inner.started.store(false, Ordering::Release);
                return Err(e.into());
            }
        };

        let local_port = listener.local_addr().map(|a| a.port()).unwrap_or(port);
        self.inner
            .local_port
            .store(u32::from(local_port), Ordering::Release);

        status(&self.inner, &format!("Listening on port {local_port}..."));

        let accept_inner = self.inner.clone();
        let listener_task = tokio::spawn(run_listener(accept_inner, listener));
        *self.inner.listener_task.lock().expect("listener task lock") = Some(listener_task);

        if !self.inner.config.cipher_key_rotation_period.is_zero() {
            let rotation_inner = self.inner.clone();
            let rotation_task = tokio::spawn(run_cipher_rotation(rotation_inner));
            *self.inner.rotation_task.lock().expect("rotation task lock") = Some(rotation_task);
        }

        Ok(())
    }

    /// The port the listener is bound to, zero before [`start`](Self::start).
    pub fn local_port(&self) -> u16 {
        self.inner.local_port.load(Ordering::Acquire) as u16
    }

    /// Stop accepting clients and drop every connection. Does not return
    /// until all server tasks have exited.
    pub async fn stop(&self) {
        if !self.inner.started.swap(false, Ordering::AcqRel) {
            return;
        }

        let listener_task = self.inner.listener_task.lock().expect("listener task lock").take();
        if let Some(task) = listener_task {
            task.abort();
            let _ = task.await;
        }

        let rotation_task = self.inner.rotation_task.lock().expect("rotation task lock").take();
        if let Some(task) = rotation_task {
            task.abort();
            let _ = task.await;
        }

        let client_tasks: Vec<_> = {
            let mut tasks = self.inner.client_tasks.lock().expect("client tasks lock");
            tasks.drain().map(|(_, task)| task).collect()
        };
        for task in client_tasks {
            task.abort();
            let _ = task.await;
        }

        self.inner.clients.lock().expect("clients lock").clear();
        self.inner.udp_socket.lock().expect("udp socket lock").take();
    }

    /// Whether at least one client is connected.
    pub fn is_connected(&self) -> bool {
        !self.inner.clients.lock().expect("clients lock").is_empty()
    }

    /// Number of connected clients.
    pub fn client_count(&self) -> usize {
        self.inner.clients.lock().expect("clients lock").len()
    }

    /// Total bytes sent on command channels.
    pub fn total_command_channel_bytes_sent(&self) -> u64 {
        self.inner
            .stats
            .command_channel_bytes
            .load(Ordering::Relaxed)
    }

    /// Total bytes sent on data channels.
    pub fn total_data_channel_bytes_sent(&self) -> u64 {
        self.inner.stats.data_channel_bytes.load(Ordering::Relaxed)
    }

    /// Total measurements sent.
    pub fn total_measurements_sent(&self) -> u64 {
        self.inner.stats.measurements.load(Ordering::Relaxed)
    }

    /// Encode and send a measurement batch to every subscribed client,
    /// compact or TSSC per the client's negotiated modes, over TCP or the
    /// client's UDP data channel.
    pub async fn publish_measurements(&self, measurements: &[Measurement]) -> Result<()> {
        if !self.inner.started.load(Ordering::Acquire) {
            return Err(Error::InvalidState("publisher is not started"));
        }

        let clients: Vec<Arc<ClientState>> = {
            let clients = self.inner.clients.lock().expect("clients lock");
            clients.values().cloned().collect()
        };

        for client in clients {
            if !client.subscribed.load(Ordering::Acquire) {
                continue;
            }

            if let Err(e) = publish_to_client(&self.inner, &client, measurements).await {
                error(
                    &self.inner,
                    &format!(
                        "Failed to publish to client {}: {e}",
                        client.connection_id
                    ),
                );
                drop_client(&self.inner, client.client_id).await;
            }
        }

        Ok(())
    }
}

// ============================================================================
// Accept loop and client lifecycle
// ============================================================================

async fn run_listener(inner: Arc<PubInner>, listener: TcpListener) {
    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error(&inner, &format!("Error accepting client connection: {e}"));
                continue;
            }
        };

        let max = inner.config.max_allowed_connections;
        if max >= 0 && inner.clients.lock().expect("clients lock").len() >= max as usize {
            status(
                &inner,
                &format!(
                    "Connection refused for {remote_addr}: maximum connections ({max}) reached"
                ),
            );
            continue;
        }

        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();

        let client_id = inner.next_client_id.fetch_add(1, Ordering::Relaxed);
        let client = Arc::new(ClientState {
            client_id,
            subscriber_id: Uuid::new_v4(),
            connection_id: remote_addr.to_string(),
            remote_addr,
            operational_modes: AtomicU32::new(0),
            subscribed: AtomicBool::new(false),
            include_time: AtomicBool::new(true),
            use_millisecond_resolution: AtomicBool::new(false),
            request_nan_filter: AtomicBool::new(false),
            processing_interval: AtomicI32::new(-1),
            cipher_index: AtomicBool::new(false),
            start_time_sent: AtomicBool::new(false),
            udp_port: StdMutex::new(None),
            cache: StdMutex::new(None),
            base_times: StdMutex::new(BaseTimeUpdate {
                time_index: 0,
                offsets: [0, 0],
            }),
            tssc: StdMutex::new(ClientTssc {
                encoder: tssc::Encoder::new(),
                sequence_number: 0,
            }),
            writer: AsyncMutex::new(write_half),
        });

        inner
            .clients
            .lock()
            .expect("clients lock")
            .insert(client_id, client.clone());

        if let Some(f) = &inner.handlers.on_client_connected {
            f(client.subscriber_id, &client.connection_id);
        }

        let task_inner = inner.clone();
        let task = tokio::spawn(async move {
            run_client(task_inner.clone(), client.clone(), read_half).await;
            drop_client(&task_inner, client.client_id).await;
        });
        inner
            .client_tasks
            .lock()
            .expect("client tasks lock")
            .insert(client_id, task);
    }
}

async fn drop_client(inner: &Arc<PubInner>, client_id: u64) {
    let client = inner
        .clients
        .lock()
        .expect("clients lock")
        .remove(&client_id);
    inner
        .client_tasks
        .lock()
        .expect("client tasks lock")
        .remove(&client_id);

    if let Some(client) = client {
        if let Some(f) = &inner.handlers.on_client_disconnected {
            f(client.subscriber_id, &client.connection_id);
        }
    }
}

async fn run_client(inner: Arc<PubInner>, client: Arc<ClientState>, mut read_half: OwnedReadHalf) {
    let mut header = [0u8; PAYLOAD_HEADER_SIZE];

    loop {
        if read_half.read_exact(&mut header).await.is_err() {
            return;
        }

        let payload = match PayloadHeader::from_bytes(&header) {
            Ok(payload) => payload,
            Err(_) => return,
        };

        if payload.verify_marker().is_err() {
            warn!(client = %client.connection_id, "bad payload marker; dropping client");
            return;
        }

        let size = payload.payload_size();
        if size == 0 || size > MAX_PACKET_SIZE {
            warn!(client = %client.connection_id, size, "unreasonable payload size");
            return;
        }

        let mut packet = BytesMut::zeroed(size);
        if read_half.read_exact(&mut packet).await.is_err() {
            return;
        }

        let (command, body) = match frame::split_request(&packet) {
            Ok(split) => split,
            Err(_) => return,
        };

        if let Err(e) = handle_command(&inner, &client, command, body).await {
            error(
                &inner,
                &format!(
                    "Error handling command {command:#04X} from {}: {e}",
                    client.connection_id
                ),
            );
            return;
        }
    }
}

// ============================================================================
// Command handling
// ============================================================================

async fn handle_command(
    inner: &Arc<PubInner>,
    client: &Arc<ClientState>,
    command: u8,
    body: &[u8],
) -> Result<()> {
    match command {
        ServerCommand::DEFINE_OPERATIONAL_MODES => {
            if body.len() < 4 {
                return Err(Error::malformed("operational modes", "body shorter than a word"));
            }
            let modes = u32::from_be_bytes(body[..4].try_into().unwrap_or_default());
            client.operational_modes.store(modes, Ordering::Relaxed);
            debug!(client = %client.connection_id, modes, "operational modes defined");
            Ok(())
        }
        ServerCommand::METADATA_REFRESH => handle_metadata_refresh(inner, client).await,
        ServerCommand::SUBSCRIBE => handle_subscribe(inner, client, body).await,
        ServerCommand::UNSUBSCRIBE => {
            client.subscribed.store(false, Ordering::Release);
            status(
                inner,
                &format!("Client {} unsubscribed.", client.connection_id),
            );
            send_response(
                inner,
                client,
                ServerResponse::SUCCEEDED,
                ServerCommand::UNSUBSCRIBE,
                b"Client unsubscribed.",
            )
            .await
        }
        ServerCommand::UPDATE_PROCESSING_INTERVAL => {
            if body.len() < 4 {
                return Err(Error::malformed("processing interval", "body shorter than a word"));
            }
            let interval = i32::from_be_bytes(body[..4].try_into().unwrap_or_default());
            client.processing_interval.store(interval, Ordering::Relaxed);
            send_response(
                inner,
                client,
                ServerResponse::SUCCEEDED,
                ServerCommand::UPDATE_PROCESSING_INTERVAL,
                format!("New processing interval of {interval} assigned.").as_bytes(),
            )
            .await
        }
        ServerCommand::ROTATE_CIPHER_KEYS => {
            if inner.config.cipher_key_rotation_period.is_zero() {
                send_response(
                    inner,
                    client,
                    ServerResponse::FAILED,
                    ServerCommand::ROTATE_CIPHER_KEYS,
                    b"Cipher key rotation is disabled by the publisher.",
                )
                .await
            } else {
                rotate_cipher_keys(inner, client).await
            }
        }
        ServerCommand::CONFIRM_NOTIFICATION | ServerCommand::CONFIRM_BUFFER_BLOCK => {
            debug!(client = %client.connection_id, command, "confirmation received");
            Ok(())
        }
        ServerCommand::AUTHENTICATE => {
            send_response(
                inner,
                client,
                ServerResponse::FAILED,
                ServerCommand::AUTHENTICATE,
                b"Authentication is deprecated; secure the channel with TLS instead.",
            )
            .await
        }
        other => {
            send_response(
                inner,
                client,
                ServerResponse::FAILED,
                other,
                format!("Command {other:#04X} is not recognized by this publisher.").as_bytes(),
            )
            .await
        }
    }
}

async fn handle_metadata_refresh(inner: &Arc<PubInner>, client: &Arc<ClientState>) -> Result<()> {
    if !inner.config.metadata_refresh_allowed {
        return send_response(
            inner,
            client,
            ServerResponse::FAILED,
            ServerCommand::METADATA_REFRESH,
            b"Meta-data refresh has been disallowed by the publisher.",
        )
        .await;
    }

    let metadata = inner.metadata.lock().expect("metadata lock").clone();
    let body = if client.compresses_metadata() {
        gzip::deflate(&metadata)?
    } else {
        metadata.to_vec()
    };

    status(
        inner,
        &format!(
            "Sending {} bytes of metadata to client {}",
            body.len(),
            client.connection_id
        ),
    );

    send_response(
        inner,
        client,
        ServerResponse::SUCCEEDED,
        ServerCommand::METADATA_REFRESH,
        &body,
    )
    .await
}

async fn handle_subscribe(
    inner: &Arc<PubInner>,
    client: &Arc<ClientState>,
    body: &[u8],
) -> Result<()> {
    if body.len() < 5 {
        return Err(Error::malformed("subscribe request", "body shorter than its header"));
    }

    let _data_packet_flags = body[0];
    let string_length =
        u32::from_be_bytes(body[1..5].try_into().unwrap_or_default()) as usize;

    if body.len() < 5 + string_length {
        return Err(Error::malformed(
            "subscribe request",
            "connection string extends past the body",
        ));
    }

    let connection_string = String::from_utf8_lossy(&body[5..5 + string_length]);
    let settings = ConnectionString::parse(&connection_string);

    client
        .include_time
        .store(settings.get_bool("includeTime", true), Ordering::Relaxed);
    client.use_millisecond_resolution.store(
        settings.get_bool("useMillisecondResolution", false),
        Ordering::Relaxed,
    );
    client.request_nan_filter.store(
        settings.get_bool("requestNaNValueFilter", false),
        Ordering::Relaxed,
    );
    client.processing_interval.store(
        settings.get_i32("processingInterval", -1),
        Ordering::Relaxed,
    );

    let udp_port = settings
        .get("dataChannel")
        .map(|channel| ConnectionString::parse(channel).get_u16("localport", 0))
        .filter(|&port| port > 0);
    *client.udp_port.lock().expect("udp port lock") = udp_port;

    if udp_port.is_some() {
        ensure_udp_socket(inner).await?;
    }

    // The filter expression is opaque to the transport; every defined
    // signal is granted. Assign indices in definition order.
    let signals = inner.signals.lock().expect("signals lock").clone();
    let mut cache = SignalIndexCache::new();
    for (index, signal) in signals.iter().enumerate() {
        cache.add_measurement_key(
            index as u16,
            signal.signal_id,
            signal.source.clone(),
            signal.id,
        );
    }
    let signal_count = cache.len();

    let cache_body = cache.serialize(client.subscriber_id);
    let cache_body = if client.compresses_cache() {
        gzip::deflate(&cache_body)?
    } else {
        cache_body
    };

    *client.cache.lock().expect("cache lock") = Some(Arc::new(cache));

    // Fresh subscription, fresh compression stream.
    {
        let mut client_tssc = client.tssc.lock().expect("tssc lock");
        client_tssc.encoder.reset();
        client_tssc.sequence_number = 0;
    }
    client.start_time_sent.store(false, Ordering::Release);

    send_response(
        inner,
        client,
        ServerResponse::UPDATE_SIGNAL_INDEX_CACHE,
        0,
        &cache_body,
    )
    .await?;

    if client.include_time.load(Ordering::Relaxed) {
        // Anchor the base time a minute back, on a millisecond boundary,
        // so compact records fit their offsets for a long while.
        let base = (ticks_now() / TICKS_PER_MILLISECOND) * TICKS_PER_MILLISECOND
            - 60 * TICKS_PER_SECOND;
        let update = BaseTimeUpdate {
            time_index: 0,
            offsets: [base, 0],
        };
        *client.base_times.lock().expect("base times lock") = update;

        send_response(
            inner,
            client,
            ServerResponse::UPDATE_BASE_TIMES,
            0,
            &update.to_bytes(),
        )
        .await?;
    }

    client.subscribed.store(true, Ordering::Release);

    status(
        inner,
        &format!(
            "Client {} subscribed to {signal_count} signals",
            client.connection_id
        ),
    );

    send_response(
        inner,
        client,
        ServerResponse::SUCCEEDED,
        ServerCommand::SUBSCRIBE,
        format!("Client subscribed as {}.", client.subscriber_id).as_bytes(),
    )
    .await
}

async fn rotate_cipher_keys(inner: &Arc<PubInner>, client: &Arc<ClientState>) -> Result<()> {
    let new_index = !client.cipher_index.load(Ordering::Relaxed);
    client.cipher_index.store(new_index, Ordering::Relaxed);

    // Key and IV material; the cipher itself is not applied to payloads.
    let mut body = Vec::with_capacity(1 + 4 + 32 + 4 + 16);
    body.push(u8::from(new_index));

    let key: Vec<u8> = Uuid::new_v4()
        .as_bytes()
        .iter()
        .chain(Uuid::new_v4().as_bytes())
        .copied()
        .collect();
    body.extend_from_slice(&(key.len() as u32).to_be_bytes());
    body.extend_from_slice(&key);

    let iv = *Uuid::new_v4().as_bytes();
    body.extend_from_slice(&(iv.len() as u32).to_be_bytes());
    body.extend_from_slice(&iv);

    send_response(inner, client, ServerResponse::UPDATE_CIPHER_KEYS, 0, &body).await
}

async fn run_cipher_rotation(inner: Arc<PubInner>) {
    let mut ticker = tokio::time::interval(inner.config.cipher_key_rotation_period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // the first tick fires immediately

    loop {
        ticker.tick().await;

        let clients: Vec<Arc<ClientState>> = {
            let clients = inner.clients.lock().expect("clients lock");
            clients.values().cloned().collect()
        };

        for client in clients {
            if client.subscribed.load(Ordering::Acquire) {
                if let Err(e) = rotate_cipher_keys(&inner, &client).await {
                    error(
                        &inner,
                        &format!(
                            "Failed to rotate cipher keys for {}: {e}",
                            client.connection_id
                        ),
                    );
                }
            }
        }
    }
}

// ============================================================================
// Data packet emission
// ============================================================================

async fn publish_to_client(
    inner: &Arc<PubInner>,
    client: &Arc<ClientState>,
    measurements: &[Measurement],
) -> Result<()> {
    let cache = client.cache.lock().expect("cache lock").clone();
    let Some(cache) = cache else {
        return Ok(());
    };

    let filter_nan = inner.config.nan_value_filter_forced
        || (inner.config.nan_value_filter_allowed
            && client.request_nan_filter.load(Ordering::Relaxed));

    let selected: Vec<&Measurement> = measurements
        .iter()
        .filter(|m| !(filter_nan && m.value.is_nan()))
        .filter(|m| cache.signal_index_of(m.signal_id).is_some())
        .collect();

    if selected.is_empty() {
        return Ok(());
    }

    if !client.start_time_sent.swap(true, Ordering::AcqRel) {
        let start_time = selected
            .iter()
            .map(|m| m.timestamp)
            .min()
            .unwrap_or_else(ticks_now);
        send_response(
            inner,
            client,
            ServerResponse::DATA_START_TIME,
            0,
            &start_time.to_be_bytes(),
        )
        .await?;
    }

    let packets = if client.uses_tssc() {
        encode_tssc_packets(client, &cache, &selected)
    } else {
        encode_compact_packets(client, &cache, &selected)
    };

    for packet in packets {
        send_data_packet(inner, client, &packet).await?;
    }

    inner
        .stats
        .measurements
        .fetch_add(selected.len() as u64, Ordering::Relaxed);

    Ok(())
}

fn data_packet_body(flags: u8, count: u32, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(5 + payload.len());
    body.push(flags);
    body.extend_from_slice(&count.to_be_bytes());
    body.extend_from_slice(payload);
    body
}

fn encode_compact_packets(
    client: &ClientState,
    cache: &SignalIndexCache,
    measurements: &[&Measurement],
) -> Vec<Vec<u8>> {
    let base_times = *client.base_times.lock().expect("base times lock");
    let codec = CompactMeasurement::new(
        cache,
        base_times.offsets,
        client.include_time.load(Ordering::Relaxed),
        client.use_millisecond_resolution.load(Ordering::Relaxed),
    );

    let mut packets = Vec::new();
    let mut records = Vec::new();
    let mut count = 0u32;

    for measurement in measurements {
        let Some(index) = cache.signal_index_of(measurement.signal_id) else {
            continue;
        };

        codec.encode(index, measurement, base_times.time_index, &mut records);
        count += 1;

        if records.len() >= DATA_PACKET_BODY_LIMIT {
            packets.push(data_packet_body(
                DataPacketFlags::COMPACT,
                count,
                &records,
            ));
            records.clear();
            count = 0;
        }
    }

    if count > 0 {
        packets.push(data_packet_body(DataPacketFlags::COMPACT, count, &records));
    }

    packets
}

fn encode_tssc_packets(
    client: &ClientState,
    cache: &SignalIndexCache,
    measurements: &[&Measurement],
) -> Vec<Vec<u8>> {
    let mut tracker = client.tssc.lock().expect("tssc lock");
    let mut packets = Vec::new();

    let mut pending: Vec<(u16, i64, u32, f32)> = measurements
        .iter()
        .filter_map(|m| {
            cache
                .signal_index_of(m.signal_id)
                .map(|index| (index, m.timestamp, m.flags, m.value as f32))
        })
        .collect();

    while !pending.is_empty() {
        tracker.encoder.begin_block(DATA_PACKET_BODY_LIMIT);

        let mut added = 0;
        for &(index, timestamp, quality, value) in &pending {
            if !tracker
                .encoder
                .try_add_measurement(index, timestamp, quality, value)
            {
                break;
            }
            added += 1;
        }
        pending.drain(..added);

        let block = tracker.encoder.finish_block();
        let sequence_number = tracker.sequence_number;

        let mut payload = Vec::with_capacity(3 + block.len());
        payload.push(TSSC_VERSION);
        payload.extend_from_slice(&sequence_number.to_be_bytes());
        payload.extend_from_slice(&block);

        packets.push(data_packet_body(
            DataPacketFlags::COMPACT | DataPacketFlags::COMPRESSED,
            added as u32,
            &payload,
        ));

        tracker.sequence_number = tracker.sequence_number.wrapping_add(1);
        // Zero is reserved for reset; skip it on roll-over.
        if tracker.sequence_number == 0 {
            tracker.sequence_number = 1;
        }
    }

    packets
}

async fn ensure_udp_socket(inner: &Arc<PubInner>) -> Result<()> {
    let already_bound = inner
        .udp_socket
        .lock()
        .expect("udp socket lock")
        .is_some();
    if already_bound {
        return Ok(());
    }

    let bind_addr: SocketAddr = if inner.config.ipv6 {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    } else {
        (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
    };

    let socket = UdpSocket::bind(bind_addr).await?;
    *inner.udp_socket.lock().expect("udp socket lock") = Some(Arc::new(socket));
    Ok(())
}

async fn send_data_packet(
    inner: &Arc<PubInner>,
    client: &Arc<ClientState>,
    body: &[u8],
) -> Result<()> {
    let udp_port = *client.udp_port.lock().expect("udp port lock");

    if let Some(port) = udp_port {
        let socket = inner.udp_socket.lock().expect("udp socket lock").clone();
        if let Some(socket) = socket {
            let datagram = frame::response_packet(ServerResponse::DATA_PACKET, 0, body);
            let target = SocketAddr::new(client.remote_addr.ip(), port);
            socket.send_to(&datagram, target).await?;
            inner
                .stats
                .data_channel_bytes
                .fetch_add(datagram.len() as u64, Ordering::Relaxed);
            return Ok(());
        }
    }

    send_response(inner, client, ServerResponse::DATA_PACKET, 0, body).await?;
    inner
        .stats
        .data_channel_bytes
        .fetch_add(body.len() as u64, Ordering::Relaxed);
    Ok(())
}

// ============================================================================
// Shared send path
// ============================================================================

async fn send_response(
    inner: &Arc<PubInner>,
    client: &Arc<ClientState>,
    response: u8,
    command: u8,
    body: &[u8],
) -> Result<()> {
    let mut frame_bytes = Vec::with_capacity(PAYLOAD_HEADER_SIZE + 6 + body.len());
    frame::write_response_frame(&mut frame_bytes, response, command, body);

    let mut writer = client.writer.lock().await;
    writer.write_all(&frame_bytes).await?;

    inner
        .stats
        .command_channel_bytes
        .fetch_add(frame_bytes.len() as u64, Ordering::Relaxed);

    Ok(())
}

fn status(inner: &Arc<PubInner>, message: &str) {
    if let Some(f) = &inner.handlers.on_status_message {
        f(message);
    }
}

fn error(inner: &Arc<PubInner>, message: &str) {
    if let Some(f) = &inner.handlers.on_error_message {
        f(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_requires_start() {
        let publisher = DataPublisher::new(PublisherConfig::default(), PublisherHandlers::new());
        let err = publisher.publish_measurements(&[]).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let publisher = DataPublisher::new(PublisherConfig::default(), PublisherHandlers::new());
        publisher.start(0).await.unwrap();
        assert!(publisher.local_port() != 0);
        assert!(matches!(
            publisher.start(0).await,
            Err(Error::InvalidState(_))
        ));
        publisher.stop().await;
    }

    #[tokio::test]
    async fn test_stop_without_start_is_a_no_op() {
        let publisher = DataPublisher::new(PublisherConfig::default(), PublisherHandlers::new());
        publisher.stop().await;
        assert!(!publisher.is_connected());
    }

    #[test]
    fn test_default_config() {
        let config = PublisherConfig::default();
        assert_eq!(config.max_allowed_connections, -1);
        assert!(config.metadata_refresh_allowed);
        assert!(config.nan_value_filter_allowed);
        assert!(!config.nan_value_filter_forced);
        assert!(config.cipher_key_rotation_period.is_zero());
    }
}
