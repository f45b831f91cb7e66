//! The multiplexing socket: owns one UDP endpoint, demultiplexes inbound
//! datagrams by tag, and owns the lifecycle of every `Stream` (spec §4.2).
//!
//! Realized as a single-task actor (SPEC_FULL.md §4): `Socket` is a
//! configuration-phase builder (handler registration happens here,
//! synchronously, so `DuplicateRegistration` surfaces directly to the
//! caller per spec §7). `Socket::listen` consumes the builder, binds the
//! transport, and spawns one exclusive driver task that owns every `Stream`
//! outright — callers only ever hold a cheap, `Clone`, `Send` `SocketHandle`
//! / `StreamHandle` that talk to the driver over an unbounded
//! `tokio::sync::mpsc` channel. Every inbound datagram, every retry-timer
//! firing, and every connect-handler resolution funnels through that same
//! channel, so the driver drains them strictly in order — this is what
//! gives every `Stream` the "no reordering of enqueue vs. receive vs.
//! timer" guarantee spec §5 asks for, without a `Mutex` anywhere.

use std::any::Any;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, instrument, warn};

use crate::error::{RelayStreamError, Result};
use crate::frame::{decode_datagram_tag, decode_stream_frame, encode_general_datagram, DatagramTag};
use crate::oracle::{Message, Oracle, TypeId};
use crate::stream::{ReceiveOutcome, Stream, StreamConfig, TickOutcome};
use crate::transport::DatagramSocket;

/// Opaque per-connection user data, as returned by a connect handler.
pub type UserData = Arc<dyn Any + Send + Sync>;

/// A future returned by a connect handler.
pub type ConnectFuture = std::pin::Pin<Box<dyn std::future::Future<Output = Option<UserData>> + Send>>;

pub type GeneralHandler = Arc<dyn Fn(Box<dyn Message>, SocketAddr) + Send + Sync>;
pub type ConnectHandler = Arc<dyn Fn(Box<dyn Message>, SocketAddr) -> ConnectFuture + Send + Sync>;
pub type StreamMessageHandler = Arc<dyn Fn(Box<dyn Message>, SocketAddr, UserData) + Send + Sync>;
pub type OpenHandler = Arc<dyn Fn(SocketAddr, UserData) + Send + Sync>;
pub type CloseHandler = Arc<dyn Fn(SocketAddr, UserData) + Send + Sync>;

/// `Socket`-wide tunables, mirroring the teacher's `ConnectionConfig`.
#[derive(Clone)]
pub struct SocketConfig {
    /// Default protocol version used for outbound streams this socket originates.
    pub version: u8,
    /// Outbound datagram body budget handed to the frame encoder.
    pub max_frame_size: usize,
    pub stream_config: StreamConfig,
}

impl Default for SocketConfig {
    fn default() -> Self {
        let stream_config = StreamConfig::default();
        Self {
            version: 1,
            max_frame_size: stream_config.max_frame_size,
            stream_config,
        }
    }
}

#[derive(Default)]
struct Handlers {
    general: HashMap<TypeId, GeneralHandler>,
    connect: HashMap<TypeId, ConnectHandler>,
    stream: HashMap<TypeId, StreamMessageHandler>,
    open: Option<OpenHandler>,
    close: Option<CloseHandler>,
}

/// The no-user-data value used for the client-side outbound stream, which
/// has no accept-time payload (spec §4.2: "user-data is not applicable on
/// the client side").
fn unit_user_data() -> UserData {
    Arc::new(())
}

/// Configuration-phase socket. Register handlers, then call `listen`.
pub struct Socket {
    oracle: Arc<dyn Oracle>,
    config: SocketConfig,
    handlers: Handlers,
}

impl Socket {
    pub fn new(oracle: Arc<dyn Oracle>, config: SocketConfig) -> Self {
        Self {
            oracle,
            config,
            handlers: Handlers::default(),
        }
    }

    /// Install a connectionless handler. Exactly one per `TypeId`.
    pub fn register_general(&mut self, type_id: TypeId, handler: GeneralHandler) -> Result<()> {
        if self.handlers.general.contains_key(&type_id) {
            return Err(RelayStreamError::DuplicateRegistration(type_id));
        }
        self.handlers.general.insert(type_id, handler);
        Ok(())
    }

    /// Install the async accept decision handler for a new inbound stream's
    /// first message type.
    pub fn register_connect(&mut self, type_id: TypeId, handler: ConnectHandler) -> Result<()> {
        if self.handlers.connect.contains_key(&type_id) {
            return Err(RelayStreamError::DuplicateRegistration(type_id));
        }
        self.handlers.connect.insert(type_id, handler);
        Ok(())
    }

    /// Install the handler for subsequent messages on an accepted stream.
    pub fn register_stream(&mut self, type_id: TypeId, handler: StreamMessageHandler) -> Result<()> {
        if self.handlers.stream.contains_key(&type_id) {
            return Err(RelayStreamError::DuplicateRegistration(type_id));
        }
        self.handlers.stream.insert(type_id, handler);
        Ok(())
    }

    pub fn register_open(&mut self, handler: OpenHandler) -> Result<()> {
        if self.handlers.open.is_some() {
            return Err(RelayStreamError::DuplicateLifecycleHandler);
        }
        self.handlers.open = Some(handler);
        Ok(())
    }

    pub fn register_close(&mut self, handler: CloseHandler) -> Result<()> {
        if self.handlers.close.is_some() {
            return Err(RelayStreamError::DuplicateLifecycleHandler);
        }
        self.handlers.close = Some(handler);
        Ok(())
    }

}

/// Identifies which of a socket's (at most two) streams a command targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum StreamKey {
    Client,
    Server(SocketAddr),
}

struct ServerEntry {
    stream: Stream,
    user_data: UserData,
}

enum DriverEvent {
    Inbound(Bytes, SocketAddr),
    Tick(StreamKey, SocketAddr),
    ConnectResolved {
        remote: SocketAddr,
        provisional: Box<Stream>,
        first_type: TypeId,
        user_data: Option<UserData>,
    },
    Connect(SocketAddr, Box<dyn Message>, oneshot::Sender<Result<StreamHandle>>),
    Send(SocketAddr, Box<dyn Message>, oneshot::Sender<Result<()>>),
    Broadcast(u16, Box<dyn Message>, oneshot::Sender<Result<()>>),
    Enqueue(StreamKey, Box<dyn Message>, oneshot::Sender<Result<()>>),
    CloseStream(StreamKey, oneshot::Sender<()>),
    Close(oneshot::Sender<()>),
}

/// Cheap, `Clone`, `Send` handle to a running socket's driver task.
#[derive(Clone)]
pub struct SocketHandle {
    tx: mpsc::UnboundedSender<DriverEvent>,
    local_addr: SocketAddr,
}

/// Cheap, `Clone`, `Send` handle to one stream (client or accepted server
/// stream) owned by a running socket's driver task.
#[derive(Clone)]
pub struct StreamHandle {
    tx: mpsc::UnboundedSender<DriverEvent>,
    key: StreamKey,
    remote: SocketAddr,
}

impl StreamHandle {
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub async fn enqueue(&self, msg: Box<dyn Message>) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(DriverEvent::Enqueue(self.key, msg, reply_tx))
            .map_err(|_| RelayStreamError::SocketClosing)?;
        reply_rx.await.map_err(|_| RelayStreamError::SocketClosing)?
    }

    pub async fn close(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(DriverEvent::CloseStream(self.key, reply_tx))
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }
}

impl SocketHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn connect(&self, remote: SocketAddr, first: Box<dyn Message>) -> Result<StreamHandle> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(DriverEvent::Connect(remote, first, reply_tx))
            .map_err(|_| RelayStreamError::SocketClosing)?;
        reply_rx.await.map_err(|_| RelayStreamError::SocketClosing)?
    }

    pub async fn send(&self, to: SocketAddr, msg: Box<dyn Message>) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(DriverEvent::Send(to, msg, reply_tx))
            .map_err(|_| RelayStreamError::SocketClosing)?;
        reply_rx.await.map_err(|_| RelayStreamError::SocketClosing)?
    }

    pub async fn broadcast(&self, port: u16, msg: Box<dyn Message>) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(DriverEvent::Broadcast(port, msg, reply_tx))
            .map_err(|_| RelayStreamError::SocketClosing)?;
        reply_rx.await.map_err(|_| RelayStreamError::SocketClosing)?
    }

    pub async fn close(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(DriverEvent::Close(reply_tx)).is_ok() {
            let _ = reply_rx.await;
        }
    }
}

pub const BROADCAST_ADDR: IpAddr = IpAddr::V4(Ipv4Addr::new(255, 255, 255, 255));

impl Socket {
    /// Take ownership of an already-bound transport and spawn the driver
    /// task, enabling inbound stream acceptance as well as outbound
    /// `connect`. Pair with `UdpTransport::bind` for real sockets, or an
    /// in-memory `DatagramSocket` in tests.
    pub async fn listen<T: DatagramSocket>(self, transport: T) -> Result<SocketHandle> {
        let local_addr = transport.local_addr()?;
        if let Err(err) = transport.enable_broadcast(true) {
            debug!(%err, "broadcast enable not available on this transport/platform");
        }
        let transport = Arc::new(transport);
        let (tx, rx) = mpsc::unbounded_channel();

        let recv_transport = Arc::clone(&transport);
        let recv_tx = tx.clone();
        tokio::spawn(async move {
            loop {
                match recv_transport.recv_from().await {
                    Ok((data, from)) => {
                        if recv_tx.send(DriverEvent::Inbound(data, from)).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(%err, "datagram receive failed");
                    }
                }
            }
        });

        let driver = Driver {
            oracle: self.oracle,
            config: self.config,
            handlers: self.handlers,
            transport,
            client_stream: None,
            server_streams: HashMap::new(),
            scheduled: HashMap::new(),
            closing: false,
            tx: tx.clone(),
            rx,
        };
        tokio::spawn(driver.run());

        Ok(SocketHandle { tx, local_addr })
    }
}

struct Driver<T: DatagramSocket> {
    oracle: Arc<dyn Oracle>,
    config: SocketConfig,
    handlers: Handlers,
    transport: Arc<T>,
    client_stream: Option<Stream>,
    server_streams: HashMap<SocketAddr, ServerEntry>,
    /// The one outstanding coalesced-send task per stream (an immediate tick
    /// or an armed retry timer), mirroring `Stream`'s own at-most-one
    /// bookkeeping (invariant #4). Aborted and replaced whenever a new tick
    /// is scheduled or a retry is cancelled by progress on the stream.
    scheduled: HashMap<StreamKey, tokio::task::JoinHandle<()>>,
    closing: bool,
    tx: mpsc::UnboundedSender<DriverEvent>,
    rx: mpsc::UnboundedReceiver<DriverEvent>,
}

impl<T: DatagramSocket> Driver<T> {
    async fn run(mut self) {
        while let Some(event) = self.rx.recv().await {
            self.handle(event).await;
            if self.closing && self.client_stream.is_none() && self.server_streams.is_empty() {
                info!("socket drained, releasing transport");
                break;
            }
        }
    }

    async fn handle(&mut self, event: DriverEvent) {
        match event {
            DriverEvent::Inbound(data, from) => self.on_inbound(data, from).await,
            DriverEvent::Tick(key, remote) => self.on_tick(key, remote).await,
            DriverEvent::ConnectResolved {
                remote,
                provisional,
                first_type,
                user_data,
            } => self.on_connect_resolved(remote, *provisional, first_type, user_data).await,
            DriverEvent::Connect(remote, first, reply) => {
                let _ = reply.send(self.on_connect(remote, first).await);
            }
            DriverEvent::Send(to, msg, reply) => {
                let _ = reply.send(self.on_send(to, msg.as_ref()).await);
            }
            DriverEvent::Broadcast(port, msg, reply) => {
                let target = SocketAddr::new(BROADCAST_ADDR, port);
                let _ = reply.send(self.on_send(target, msg.as_ref()).await);
            }
            DriverEvent::Enqueue(key, msg, reply) => {
                let _ = reply.send(self.on_enqueue(key, msg).await);
            }
            DriverEvent::CloseStream(key, reply) => {
                self.on_close_stream(key).await;
                let _ = reply.send(());
            }
            DriverEvent::Close(reply) => {
                self.on_close_socket().await;
                let _ = reply.send(());
            }
        }
    }

    fn stream_mut(&mut self, key: StreamKey) -> Option<&mut Stream> {
        match key {
            StreamKey::Client => self.client_stream.as_mut(),
            StreamKey::Server(addr) => self.server_streams.get_mut(&addr).map(|e| &mut e.stream),
        }
    }

    /// Record the task backing the stream's one outstanding coalesced send,
    /// aborting whatever was there before. `Stream`'s own `send_scheduled`/
    /// `retry_armed` gating (invariant #4) ensures this normally replaces
    /// nothing live, but a stale completed handle costs nothing to abort.
    fn set_scheduled(&mut self, key: StreamKey, handle: tokio::task::JoinHandle<()>) {
        if let Some(old) = self.scheduled.insert(key, handle) {
            old.abort();
        }
    }

    fn schedule_tick(&mut self, key: StreamKey, remote: SocketAddr) {
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            tokio::task::yield_now().await;
            let _ = tx.send(DriverEvent::Tick(key, remote));
        });
        self.set_scheduled(key, handle);
    }

    fn schedule_retry(&mut self, key: StreamKey, remote: SocketAddr, delay: std::time::Duration) {
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(DriverEvent::Tick(key, remote));
        });
        self.set_scheduled(key, handle);
    }

    /// Cancel the stream's outstanding retry timer, if any (spec §4.1
    /// receive step 3: progress was observed, so the still-counting-down
    /// timer must not fire a stale tick on top of it).
    fn cancel_retry(&mut self, key: StreamKey) {
        if let Some(handle) = self.scheduled.remove(&key) {
            handle.abort();
        }
    }

    async fn transmit(&self, remote: SocketAddr, bytes: Bytes) {
        if let Err(err) = self.transport.send_to(&bytes, remote).await {
            warn!(%remote, %err, "transport send failed, retry machinery will retry");
        }
    }

    #[instrument(skip(self, outcome))]
    async fn apply_tick_outcome(&mut self, key: StreamKey, remote: SocketAddr, outcome: TickOutcome) {
        if let Some(bytes) = outcome.bytes {
            self.transmit(remote, bytes).await;
        }
        if let Some(delay) = outcome.next_retry {
            self.schedule_retry(key, remote, delay);
        }
        if outcome.ended {
            self.end_stream(key, remote).await;
        }
    }

    async fn apply_receive_outcome(&mut self, key: StreamKey, remote: SocketAddr, outcome: ReceiveOutcome) {
        if outcome.cancel_retry {
            self.cancel_retry(key);
        }
        if outcome.need_schedule {
            self.schedule_tick(key, remote);
        }
        let user_data = match key {
            StreamKey::Client => unit_user_data(),
            StreamKey::Server(addr) => self
                .server_streams
                .get(&addr)
                .map(|e| e.user_data.clone())
                .unwrap_or_else(unit_user_data),
        };
        for (seq, msg) in outcome.delivered {
            let type_id = msg.type_id();
            if let Some(handler) = self.handlers.stream.get(&type_id).cloned() {
                handler(msg, remote, user_data.clone());
            } else {
                debug!(seq, type_id, %remote, "no stream handler registered, message dropped");
            }
        }
        if outcome.ended {
            self.end_stream(key, remote).await;
        }
    }

    async fn end_stream(&mut self, key: StreamKey, remote: SocketAddr) {
        self.cancel_retry(key);
        match key {
            StreamKey::Client => {
                if self.client_stream.take().is_some() {
                    if let Some(close) = self.handlers.close.clone() {
                        close(remote, unit_user_data());
                    }
                }
            }
            StreamKey::Server(addr) => {
                if let Some(entry) = self.server_streams.remove(&addr) {
                    if let Some(close) = self.handlers.close.clone() {
                        close(addr, entry.user_data);
                    }
                }
            }
        }
    }

    async fn on_tick(&mut self, key: StreamKey, remote: SocketAddr) {
        // This tick is the task that was tracked under `scheduled`; it has
        // now fired, so the old handle (if still present) is stale.
        self.scheduled.remove(&key);
        let oracle = Arc::clone(&self.oracle);
        let outcome = match self.stream_mut(key) {
            Some(stream) => stream.on_tick(oracle.as_ref()),
            None => return, // stream already ended/evicted; stale timer
        };
        self.apply_tick_outcome(key, remote, outcome).await;
    }

    async fn on_inbound(&mut self, data: Bytes, from: SocketAddr) {
        let (tag, body) = match decode_datagram_tag(&data) {
            Ok(v) => v,
            Err(err) => {
                debug!(%from, %err, "malformed datagram dropped");
                return;
            }
        };
        match tag {
            DatagramTag::General => self.on_general_datagram(body, from).await,
            DatagramTag::Stream => self.on_stream_datagram(body, from).await,
        }
    }

    async fn on_general_datagram(&mut self, body: &[u8], from: SocketAddr) {
        let (msg, _) = match self.oracle.decode(body) {
            Ok(v) => v,
            Err(err) => {
                debug!(%from, %err, "undecodable GENERAL datagram dropped");
                return;
            }
        };
        let type_id = msg.type_id();
        match self.handlers.general.get(&type_id).cloned() {
            Some(handler) => handler(msg, from),
            None => warn!(type_id, %from, "no general handler registered, datagram dropped"),
        }
    }

    async fn on_stream_datagram(&mut self, body: &[u8], from: SocketAddr) {
        let is_client_remote = self
            .client_stream
            .as_ref()
            .map(|s| s.remote() == from)
            .unwrap_or(false);

        let key = if is_client_remote {
            Some(StreamKey::Client)
        } else if self.server_streams.contains_key(&from) {
            Some(StreamKey::Server(from))
        } else {
            None
        };

        if let Some(key) = key {
            let decoded = match decode_stream_frame(self.oracle.as_ref(), body) {
                Ok(d) => d,
                Err(err) => {
                    debug!(%from, %err, "malformed STREAM frame dropped");
                    return;
                }
            };
            let outcome = match self.stream_mut(key) {
                Some(stream) => stream.on_receive(decoded),
                None => return,
            };
            self.apply_receive_outcome(key, from, outcome).await;
            return;
        }

        // First contact: build a provisional stream and await the connect handler.
        let decoded = match decode_stream_frame(self.oracle.as_ref(), body) {
            Ok(d) => d,
            Err(err) => {
                debug!(%from, %err, "malformed first-contact STREAM frame dropped");
                return;
            }
        };
        let mut provisional = Stream::new(from, 0, self.config.stream_config);
        let outcome = provisional.on_receive(decoded);

        let Some((seq, first_msg)) = outcome.delivered.into_iter().next() else {
            // Nothing decoded yet (pure ack/empty frame from an unknown
            // remote); nothing to connect on, drop the provisional.
            return;
        };
        let _ = seq;
        let first_type = first_msg.type_id();

        match self.handlers.connect.get(&first_type).cloned() {
            Some(handler) => {
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let user_data = handler(first_msg, from).await;
                    let _ = tx.send(DriverEvent::ConnectResolved {
                        remote: from,
                        provisional: Box::new(provisional),
                        first_type,
                        user_data,
                    });
                });
            }
            None => {
                warn!(type_id = first_type, %from, "no connect handler registered, rejecting");
                self.reject_provisional(provisional, from).await;
            }
        }
    }

    async fn reject_provisional(&mut self, mut provisional: Stream, remote: SocketAddr) {
        provisional.close();
        let outcome = provisional.on_tick(self.oracle.as_ref());
        if let Some(bytes) = outcome.bytes {
            self.transmit(remote, bytes).await;
        }
        provisional.end();
    }

    async fn on_connect_resolved(
        &mut self,
        remote: SocketAddr,
        provisional: Stream,
        first_type: TypeId,
        user_data: Option<UserData>,
    ) {
        match user_data {
            Some(ud) => {
                if self.server_streams.contains_key(&remote) {
                    // Lost the accept race: another provisional won first.
                    // Silently discard; no open/close events for this one.
                    debug!(%remote, type_id = first_type, "losing provisional stream discarded");
                    let mut provisional = provisional;
                    provisional.end();
                    return;
                }
                self.server_streams.insert(
                    remote,
                    ServerEntry {
                        stream: provisional,
                        user_data: ud.clone(),
                    },
                );
                if let Some(open) = self.handlers.open.clone() {
                    open(remote, ud);
                }
                // The accept frame itself still owes the peer an ack.
                self.schedule_tick(StreamKey::Server(remote), remote);
            }
            None => {
                self.reject_provisional(provisional, remote).await;
            }
        }
    }

    async fn on_connect(&mut self, remote: SocketAddr, first: Box<dyn Message>) -> Result<StreamHandle> {
        if self.client_stream.is_some() {
            return Err(RelayStreamError::OutboundStreamExists);
        }
        let mut stream = Stream::new(remote, self.config.version, self.config.stream_config);
        stream.enqueue(first)?;
        self.client_stream = Some(stream);
        self.schedule_tick(StreamKey::Client, remote);
        Ok(StreamHandle {
            tx: self.tx.clone(),
            key: StreamKey::Client,
            remote,
        })
    }

    async fn on_send(&mut self, to: SocketAddr, msg: &dyn Message) -> Result<()> {
        let datagram = encode_general_datagram(self.oracle.as_ref(), msg)?;
        self.transport.send_to(&datagram, to).await
    }

    async fn on_enqueue(&mut self, key: StreamKey, msg: Box<dyn Message>) -> Result<()> {
        let remote = match key {
            StreamKey::Client => self.client_stream.as_ref().map(|s| s.remote()),
            StreamKey::Server(addr) => Some(addr),
        }
        .ok_or(RelayStreamError::StreamNotFound(match key {
            StreamKey::Client => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            StreamKey::Server(addr) => addr,
        }))?;
        let stream = self
            .stream_mut(key)
            .ok_or(RelayStreamError::StreamNotFound(remote))?;
        let need_schedule = stream.enqueue(msg)?;
        if need_schedule {
            self.schedule_tick(key, remote);
        }
        Ok(())
    }

    async fn on_close_stream(&mut self, key: StreamKey) {
        let remote = match key {
            StreamKey::Client => self.client_stream.as_ref().map(|s| s.remote()),
            StreamKey::Server(addr) => Some(addr),
        };
        let Some(remote) = remote else { return };
        if let Some(stream) = self.stream_mut(key) {
            let need_schedule = stream.close();
            if need_schedule {
                self.schedule_tick(key, remote);
            }
        }
    }

    async fn on_close_socket(&mut self) {
        self.closing = true;
        if let Some(remote) = self.client_stream.as_ref().map(|s| s.remote()) {
            let need_schedule = self.client_stream.as_mut().unwrap().close();
            if need_schedule {
                self.schedule_tick(StreamKey::Client, remote);
            }
        }
        let remotes: Vec<SocketAddr> = self.server_streams.keys().copied().collect();
        for remote in remotes {
            if let Some(entry) = self.server_streams.get_mut(&remote) {
                let need_schedule = entry.stream.close();
                if need_schedule {
                    self.schedule_tick(StreamKey::Server(remote), remote);
                }
            }
        }
    }
}
