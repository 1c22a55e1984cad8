//! # Gossip Network Node
//!
//! [`Network`] owns the peer set and every background task of a node:
//!
//! | Task | Count | Role |
//! |------|-------|------|
//! | Acceptor | 0-1 | Accept connections, run the server handshake |
//! | Dispatcher | 2 | Fan node-level broadcasts (high, bulk) out to peer queues |
//! | Reader worker | `incoming_threads` | Drain the inbound buffer through the multiplexer |
//! | Mesh | 1 | Keep outbound connectivity at `gossip_fanout` |
//! | Monitor | 1 | Evict peers whose writer is stalled |
//! | Eventual ready | 1 | Resolve `ready()` after a delay |
//!
//! ## Message Flow
//!
//! ```text
//!  broadcast() ──► [high | bulk] ──► dispatcher ──► peer queues ──► writer ──► wire
//!
//!  wire ──► reader ──► inbound filter ──► inbound buffer ──► worker ──► handler
//!                                                               │
//!                                           Broadcast ◄─────────┤ ──► Disconnect
//! ```
//!
//! ## Handshake
//!
//! The dialer sends the gossip path and its headers; the acceptor checks
//! path, protocol version, genesis id, node random (self-connection) and
//! connection limits, then answers with its own headers and, if it has a
//! priority scheme, a challenge. The dialer checks the response headers the
//! same way and answers the challenge with an `NP` message.
//!
//! ## Security
//!
//! - Handshakes are bounded in size and time before a peer exists.
//! - Inbound connections are limited in total and per IP.
//! - Stalled writers are evicted so one slow peer cannot hold queues hostage.
//! - A priority address proven by two connections only counts once.

use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use lru::LruCache;
use rand::RngCore;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::config::NetworkConfig;
use crate::filter::{Digest, MessageFilter, message_digest};
use crate::metrics::NetworkMetrics;
use crate::multiplexer::{
    ForwardingPolicy, IncomingMessage, MessageHandler, Multiplexer, TaggedMessageHandler,
};
use crate::peer::{
    Direction, Peer, PeerContext, PeerId, PeerParams, PeerRegistry, SendMessage, SendPriority,
    is_stale,
};
use crate::phonebook::{EmptyPhonebook, Phonebook};
use crate::priority::{PrioScheme, PrioTracker};
use crate::protocol::{
    ADDRESS_HEADER, GENESIS_HEADER, HandshakeRequest, HandshakeResponse, HandshakeStatus, Headers,
    INSTANCE_NAME_HEADER, MESSAGE_FILTER_SIZE, NODE_RANDOM_HEADER, PRIORITY_CHALLENGE_HEADER,
    PROTOCOL_VERSION, PROTOCOL_VERSION_HEADER, SUPPORTED_PROTOCOL_VERSIONS, TELEMETRY_ID_HEADER,
    Tag, addr_to_gossip_addr, deserialize_bounded, gossip_path, serialize_bounded, tags,
};
use crate::transport::{Connection, Dialer, Listener, TcpDialer, TcpListener};

/// Upper bound on waiting for tasks during `stop()`; stragglers are aborted.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Addresses remembered for reconnect backoff.
const MAX_BACKOFF_ENTRIES: usize = 1024;

/// Pause after a failed `accept` before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

// ============================================================================
// Errors
// ============================================================================

/// Why a handshake was refused. Sent on the wire as a short string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    GenesisMismatch,
    UnsupportedVersion,
    SelfConnection,
    BadPath,
    TooManyConnections,
    Malformed,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::GenesisMismatch => "genesis-mismatch",
            RejectReason::UnsupportedVersion => "unsupported-version",
            RejectReason::SelfConnection => "self-connection",
            RejectReason::BadPath => "bad-path",
            RejectReason::TooManyConnections => "too-many-connections",
            RejectReason::Malformed => "malformed",
        }
    }

    /// Unknown strings map to `Malformed`.
    pub fn from_wire(s: &str) -> Self {
        match s {
            "genesis-mismatch" => RejectReason::GenesisMismatch,
            "unsupported-version" => RejectReason::UnsupportedVersion,
            "self-connection" => RejectReason::SelfConnection,
            "bad-path" => RejectReason::BadPath,
            "too-many-connections" => RejectReason::TooManyConnections,
            _ => RejectReason::Malformed,
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    HandshakeRejected(RejectReason),
    QueueFull,
    StaleMessage,
    SlowPeer,
    ConnectionError(String),
    DialFailure(String),
    Closed,
    NotStarted,
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkError::HandshakeRejected(reason) => write!(f, "handshake rejected: {reason}"),
            NetworkError::QueueFull => write!(f, "queue full"),
            NetworkError::StaleMessage => write!(f, "message too old to send"),
            NetworkError::SlowPeer => write!(f, "peer is not keeping up"),
            NetworkError::ConnectionError(e) => write!(f, "connection error: {e}"),
            NetworkError::DialFailure(e) => write!(f, "dial failed: {e}"),
            NetworkError::Closed => write!(f, "closed"),
            NetworkError::NotStarted => write!(f, "network not started"),
        }
    }
}

impl std::error::Error for NetworkError {}

// ============================================================================
// Public Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerOption {
    ConnectedIn,
    ConnectedOut,
    PhonebookKnown,
}

#[derive(Debug, Clone)]
pub enum KnownPeer {
    Connected(Arc<Peer>),
    Phonebook(String),
}

impl KnownPeer {
    pub fn address(&self) -> &str {
        match self {
            KnownPeer::Connected(peer) => peer.address(),
            KnownPeer::Phonebook(addr) => addr,
        }
    }
}

#[derive(Debug, Clone)]
struct BroadcastRequest {
    tag: Tag,
    data: Arc<[u8]>,
    enqueued_at: SystemTime,
    exclude: Option<PeerId>,
    digest: Option<Digest>,
}

// ============================================================================
// Header Checks
// ============================================================================

/// Validate the headers of a handshake request or response against local
/// state: protocol version, genesis id and node random.
pub fn check_headers(headers: &Headers, genesis_id: &str, node_random: &str) -> Result<(), RejectReason> {
    let version = headers.get(PROTOCOL_VERSION_HEADER).unwrap_or_default();
    if !SUPPORTED_PROTOCOL_VERSIONS.contains(&version) {
        return Err(RejectReason::UnsupportedVersion);
    }
    if headers.get(GENESIS_HEADER) != Some(genesis_id) {
        return Err(RejectReason::GenesisMismatch);
    }
    if headers.get(NODE_RANDOM_HEADER) == Some(node_random) {
        return Err(RejectReason::SelfConnection);
    }
    Ok(())
}

/// The address an inbound peer claims, with its host replaced by the first
/// IP of the trusted forwarded header when one is configured and present.
pub fn claimed_address(headers: &Headers, forwarded_field: Option<&str>) -> Option<String> {
    let claimed = headers.get(ADDRESS_HEADER).filter(|a| !a.is_empty())?;
    if let Some(ip) = forwarded_ip(headers, forwarded_field)
        && let Ok(rewritten) = update_url_host(claimed, ip)
    {
        return Some(rewritten);
    }
    Some(claimed.to_string())
}

/// First IP listed in the forwarded header, if configured.
pub fn forwarded_ip(headers: &Headers, forwarded_field: Option<&str>) -> Option<IpAddr> {
    let field = forwarded_field?;
    let value = headers.get(field)?;
    value.split(',').next()?.trim().parse().ok()
}

/// Replace the host of `original` (a URL or bare `host:port`) with `ip`,
/// keeping scheme, port and path.
pub fn update_url_host(original: &str, ip: IpAddr) -> Result<String> {
    if original.contains("://") {
        let mut url = Url::parse(original).with_context(|| format!("invalid url {original}"))?;
        url.set_ip_host(ip)
            .map_err(|_| anyhow!("cannot set host of {original}"))?;
        return Ok(url.to_string());
    }
    let url = Url::parse(&format!("ws://{original}"))
        .with_context(|| format!("invalid address {original}"))?;
    let host = match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{v6}]"),
    };
    Ok(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host,
    })
}

fn build_filter(bucket_count: usize, bucket_size: usize, rotation: Option<Duration>) -> MessageFilter {
    let filter = MessageFilter::new(bucket_count, bucket_size);
    match rotation {
        Some(interval) => filter.with_rotation_interval(interval),
        None => filter,
    }
}

fn host_ip(addr: &str) -> Option<IpAddr> {
    addr.parse::<SocketAddr>()
        .map(|s| s.ip())
        .ok()
        .or_else(|| addr.parse::<IpAddr>().ok())
}

async fn write_handshake<T: Serialize>(conn: &mut Connection, msg: &T) -> Result<()> {
    let bytes = serialize_bounded(msg).context("failed to encode handshake")?;
    conn.send_message(&bytes).await
}

async fn read_handshake<T: DeserializeOwned>(conn: &mut Connection) -> Result<T> {
    let frame = conn
        .recv_message()
        .await?
        .ok_or_else(|| anyhow!("connection closed during handshake"))?;
    deserialize_bounded(&frame).context("malformed handshake")
}

// ============================================================================
// Builder
// ============================================================================

pub struct NetworkBuilder {
    genesis_id: String,
    config: NetworkConfig,
    phonebook: Arc<dyn Phonebook>,
    dialer: Option<Arc<dyn Dialer>>,
    listener: Option<Box<dyn Listener>>,
    prio_scheme: Option<Arc<dyn PrioScheme>>,
    prio_observer: Option<mpsc::Sender<Arc<Peer>>>,
    metrics: Option<Arc<NetworkMetrics>>,
    handlers: Vec<TaggedMessageHandler>,
}

impl NetworkBuilder {
    pub fn new(genesis_id: impl Into<String>) -> Self {
        Self {
            genesis_id: genesis_id.into(),
            config: NetworkConfig::default(),
            phonebook: Arc::new(EmptyPhonebook),
            dialer: None,
            listener: None,
            prio_scheme: None,
            prio_observer: None,
            metrics: None,
            handlers: Vec::new(),
        }
    }

    pub fn config(mut self, config: NetworkConfig) -> Self {
        self.config = config;
        self
    }

    pub fn phonebook(mut self, phonebook: Arc<dyn Phonebook>) -> Self {
        self.phonebook = phonebook;
        self
    }

    /// Defaults to TCP.
    pub fn dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    /// Use an existing listener instead of binding `listen_address`.
    /// A node with a listener relays messages.
    pub fn listener(mut self, listener: Box<dyn Listener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn prio_scheme(mut self, scheme: Arc<dyn PrioScheme>) -> Self {
        self.prio_scheme = Some(scheme);
        self
    }

    /// Receives every peer whose priority was just verified.
    pub fn prio_observer(mut self, observer: mpsc::Sender<Arc<Peer>>) -> Self {
        self.prio_observer = Some(observer);
        self
    }

    pub fn metrics(mut self, metrics: Arc<NetworkMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn handlers(mut self, handlers: impl IntoIterator<Item = TaggedMessageHandler>) -> Self {
        self.handlers.extend(handlers);
        self
    }

    pub fn build(self) -> Result<Network> {
        self.config.validate()?;
        let config = self.config;

        let (broadcast_high, high_rx) = mpsc::channel(config.broadcast_queue_high);
        let (broadcast_bulk, bulk_rx) = mpsc::channel(config.broadcast_queue_bulk);
        let (incoming_tx, incoming_rx) = mpsc::channel(config.incoming_buffer_size);

        let incoming_filter = config.enable_incoming_message_filter.then(|| {
            Arc::new(build_filter(
                config.incoming_message_filter_bucket_count,
                config.incoming_message_filter_bucket_size,
                config.incoming_message_filter_rotation_interval,
            ))
        });

        let mut random = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut random);

        let relay = config.relay_messages() || self.listener.is_some();
        let multiplexer = Multiplexer::new();
        multiplexer.register_handlers(self.handlers);

        let inner = Arc::new_cyclic(|weak: &Weak<NetworkInner>| {
            if self.prio_scheme.is_some() {
                multiplexer.register_handlers([TaggedMessageHandler::new(
                    tags::NET_PRIO_RESPONSE,
                    Arc::new(PrioResponseHandler { net: weak.clone() }),
                )]);
            }
            NetworkInner {
                genesis_id: self.genesis_id,
                node_random: hex::encode(random),
                dialer: self
                    .dialer
                    .unwrap_or_else(|| Arc::new(TcpDialer::new(config.max_message_size))),
                config,
                phonebook: RwLock::new(self.phonebook),
                listener: Mutex::new(self.listener),
                prio_scheme: self.prio_scheme,
                prio_observer: self.prio_observer,
                metrics: self.metrics.unwrap_or_default(),
                multiplexer,
                incoming_filter,
                relay_messages: AtomicBool::new(relay),
                peers: RwLock::new(PeerSet::default()),
                next_peer_id: AtomicU64::new(1),
                dialing: Mutex::new(HashSet::new()),
                backoff: Mutex::new(LruCache::new(
                    NonZeroUsize::new(MAX_BACKOFF_ENTRIES).expect("capacity must be non-zero"),
                )),
                broadcast_high,
                broadcast_bulk,
                incoming_tx,
                queues: Mutex::new(Some(NodeQueues {
                    high: high_rx,
                    bulk: bulk_rx,
                    incoming: incoming_rx,
                })),
                mesh_notify: Notify::new(),
                shutdown: watch::channel(false).0,
                ready: watch::channel(false).0,
                started: AtomicBool::new(false),
                local_addr: RwLock::new(None),
                tasks: Mutex::new(Vec::new()),
            }
        });
        Ok(Network { inner })
    }
}

// ============================================================================
// Node State
// ============================================================================

#[derive(Default)]
struct PeerSet {
    peers: Vec<Arc<Peer>>,
    prio: PrioTracker,
    /// Origin IPs of inbound handshakes admitted but not yet peers.
    pending_inbound: Vec<Option<IpAddr>>,
}

impl PeerSet {
    fn find(&self, id: PeerId) -> Option<&Arc<Peer>> {
        self.peers.iter().find(|p| p.id() == id)
    }

    fn release_pending(&mut self, ip: Option<IpAddr>) {
        if let Some(pos) = self.pending_inbound.iter().position(|p| *p == ip) {
            self.pending_inbound.swap_remove(pos);
        }
    }
}

/// An inbound connection slot held from admission until the peer is
/// registered, so concurrent handshakes cannot overshoot the limits.
struct InboundSlot<'a> {
    inner: &'a NetworkInner,
    ip: Option<IpAddr>,
    held: bool,
}

impl InboundSlot<'_> {
    fn claim(mut self, set: &mut PeerSet) {
        set.release_pending(self.ip);
        self.held = false;
    }
}

impl Drop for InboundSlot<'_> {
    fn drop(&mut self) {
        if self.held {
            self.inner
                .peers
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .release_pending(self.ip);
        }
    }
}

struct NodeQueues {
    high: mpsc::Receiver<BroadcastRequest>,
    bulk: mpsc::Receiver<BroadcastRequest>,
    incoming: mpsc::Receiver<IncomingMessage>,
}

struct NetworkInner {
    genesis_id: String,
    node_random: String,
    config: NetworkConfig,
    phonebook: RwLock<Arc<dyn Phonebook>>,
    dialer: Arc<dyn Dialer>,
    listener: Mutex<Option<Box<dyn Listener>>>,
    prio_scheme: Option<Arc<dyn PrioScheme>>,
    prio_observer: Option<mpsc::Sender<Arc<Peer>>>,
    metrics: Arc<NetworkMetrics>,
    multiplexer: Multiplexer,
    incoming_filter: Option<Arc<MessageFilter>>,
    relay_messages: AtomicBool,

    peers: RwLock<PeerSet>,
    next_peer_id: AtomicU64,
    /// Gossip addresses with a dial in progress.
    dialing: Mutex<HashSet<String>>,
    /// Gossip address -> earliest time to dial again.
    backoff: Mutex<LruCache<String, Instant>>,

    broadcast_high: mpsc::Sender<BroadcastRequest>,
    broadcast_bulk: mpsc::Sender<BroadcastRequest>,
    incoming_tx: mpsc::Sender<IncomingMessage>,
    queues: Mutex<Option<NodeQueues>>,

    mesh_notify: Notify,
    shutdown: watch::Sender<bool>,
    ready: watch::Sender<bool>,
    started: AtomicBool,
    local_addr: RwLock<Option<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Verifies `NP` answers to the challenge we sent an inbound peer.
struct PrioResponseHandler {
    net: Weak<NetworkInner>,
}

#[async_trait]
impl MessageHandler for PrioResponseHandler {
    async fn handle(&self, message: &IncomingMessage) -> ForwardingPolicy {
        match self.net.upgrade() {
            Some(net) => net.handle_prio_response(message),
            None => ForwardingPolicy::Ignore,
        }
    }
}

impl PeerRegistry for NetworkInner {
    fn remove_peer(&self, peer: &Arc<Peer>, reason: &'static str) {
        let removed = {
            let mut set = self.peers.write().unwrap_or_else(|e| e.into_inner());
            let before = set.peers.len();
            set.peers.retain(|p| p.id() != peer.id());
            peer.close();
            if let Some(addr) = peer.prio_address() {
                set.prio.remove_peer(peer.id(), &addr);
            }
            set.peers.len() != before
        };
        if !removed {
            return;
        }
        debug!(peer = %peer, reason, "removed peer");
        if peer.is_outgoing() && !self.is_shutting_down() {
            if let Some(url) = peer.root_url() {
                self.back_off(url);
            }
            self.mesh_notify.notify_one();
        }
    }
}

impl NetworkInner {
    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn snapshot_peers(&self) -> Vec<Arc<Peer>> {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .peers
            .clone()
    }

    fn count_peers(&self, direction: Direction) -> usize {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .peers
            .iter()
            .filter(|p| p.direction() == direction)
            .count()
    }

    fn phonebook(&self) -> Arc<dyn Phonebook> {
        self.phonebook
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn peer_context(self: &Arc<Self>) -> Arc<PeerContext> {
        let weak: Weak<NetworkInner> = Arc::downgrade(self);
        let registry: Weak<dyn PeerRegistry> = weak;
        Arc::new(PeerContext {
            incoming: self.incoming_tx.clone(),
            incoming_filter: self.incoming_filter.clone(),
            metrics: self.metrics.clone(),
            registry,
            max_message_queue_duration: self.config.max_message_queue_duration,
        })
    }

    fn new_outgoing_filter(&self) -> Option<MessageFilter> {
        self.config.enable_outgoing_message_filter.then(|| {
            build_filter(
                self.config.outgoing_message_filter_bucket_count,
                self.config.outgoing_message_filter_bucket_size,
                self.config.outgoing_message_filter_rotation_interval,
            )
        })
    }

    fn next_peer_id(&self) -> PeerId {
        self.next_peer_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Address announced to peers in the location header.
    fn public_address(&self) -> Option<String> {
        self.config.public_address.clone().or_else(|| {
            self.local_addr
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
        })
    }

    fn local_headers(&self) -> Headers {
        let mut headers = Headers::new();
        headers.set(PROTOCOL_VERSION_HEADER, PROTOCOL_VERSION);
        headers.set(GENESIS_HEADER, self.genesis_id.as_str());
        headers.set(NODE_RANDOM_HEADER, self.node_random.as_str());
        headers.set(TELEMETRY_ID_HEADER, self.config.telemetry_id.as_str());
        headers.set(INSTANCE_NAME_HEADER, self.config.instance_name.as_str());
        if let Some(addr) = self.public_address() {
            headers.set(ADDRESS_HEADER, addr);
        }
        headers
    }

    /// Register `peer` and start its loops under the peer-set lock, so
    /// `stop()` either drains it with its tasks or the add fails.
    fn add_peer(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        conn: Connection,
        slot: Option<InboundSlot<'_>>,
    ) -> Result<(), NetworkError> {
        let ctx = self.peer_context();
        let mut set = self.peers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = slot {
            slot.claim(&mut set);
        }
        if self.is_shutting_down() {
            peer.close();
            return Err(NetworkError::Closed);
        }
        set.peers.push(peer.clone());
        let (source, sink, _) = conn.into_split();
        peer.start(source, sink, ctx);
        Ok(())
    }

    fn back_off(&self, gossip_addr: &str) {
        let until = Instant::now() + self.config.reconnect_backoff;
        self.backoff
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .put(gossip_addr.to_string(), until);
    }

    fn in_backoff(&self, gossip_addr: &str) -> bool {
        let mut backoff = self.backoff.lock().unwrap_or_else(|e| e.into_inner());
        match backoff.get(gossip_addr) {
            Some(until) if *until > Instant::now() => true,
            Some(_) => {
                backoff.pop(gossip_addr);
                false
            }
            None => false,
        }
    }

    fn update_ready(&self) {
        if self.count_peers(Direction::Outbound) >= self.config.gossip_fanout {
            self.ready.send_replace(true);
        }
    }

    // ========================================================================
    // Broadcast
    // ========================================================================

    fn make_request(
        &self,
        tag: Tag,
        data: Arc<[u8]>,
        enqueued_at: SystemTime,
        exclude: Option<PeerId>,
    ) -> BroadcastRequest {
        let digest = (self.config.enable_outgoing_message_filter && data.len() >= MESSAGE_FILTER_SIZE)
            .then(|| message_digest(tag, &data));
        BroadcastRequest {
            tag,
            data,
            enqueued_at,
            exclude,
            digest,
        }
    }

    fn check_running(&self) -> Result<(), NetworkError> {
        if self.is_shutting_down() {
            return Err(NetworkError::Closed);
        }
        if !self.started.load(Ordering::Acquire) {
            return Err(NetworkError::NotStarted);
        }
        Ok(())
    }

    fn queue_for(&self, tag: Tag) -> &mpsc::Sender<BroadcastRequest> {
        match SendPriority::for_tag(tag) {
            SendPriority::High => &self.broadcast_high,
            SendPriority::Bulk => &self.broadcast_bulk,
        }
    }

    fn try_broadcast(&self, request: BroadcastRequest) -> Result<(), NetworkError> {
        self.check_running()?;
        match self.queue_for(request.tag).try_send(request) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(req)) => {
                NetworkMetrics::incr(&self.metrics.broadcast_queue_full);
                debug!(tag = %req.tag, "broadcast queue full");
                Err(NetworkError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(NetworkError::Closed),
        }
    }

    fn relay(&self, tag: Tag, data: Arc<[u8]>, exclude: Option<PeerId>) -> Result<(), NetworkError> {
        if !self.relay_messages.load(Ordering::Relaxed) {
            return Ok(());
        }
        self.try_broadcast(self.make_request(tag, data, SystemTime::now(), exclude))
    }

    /// Peers eligible for a broadcast, in send order.
    fn broadcast_targets(&self, exclude: Option<PeerId>) -> Vec<Arc<Peer>> {
        let mut peers: Vec<Arc<Peer>> = self
            .snapshot_peers()
            .into_iter()
            .filter(|p| Some(p.id()) != exclude)
            .collect();
        if self.prio_scheme.is_some()
            && let Some(limit) = self.config.broadcast_connections_limit
        {
            // Outbound first, then by descending weight.
            peers.sort_by_key(|p| (!p.is_outgoing(), std::cmp::Reverse(p.prio_weight())));
            peers.truncate(limit);
        }
        peers
    }

    fn dispatch(&self, request: BroadcastRequest, priority: SendPriority) {
        if is_stale(
            request.enqueued_at,
            SystemTime::now(),
            self.config.max_message_queue_duration,
        ) {
            NetworkMetrics::incr(&self.metrics.stale_messages_dropped);
            trace!(tag = %request.tag, "dropping stale broadcast");
            return;
        }
        let msg = SendMessage {
            tag: request.tag,
            data: request.data,
            enqueued_at: request.enqueued_at,
            digest: request.digest,
        };
        for peer in self.broadcast_targets(request.exclude) {
            match peer.enqueue(msg.clone(), priority) {
                Ok(()) => {}
                Err(NetworkError::QueueFull) => {
                    NetworkMetrics::incr(&self.metrics.peer_queue_full);
                    trace!(peer = %peer, tag = %msg.tag, "peer queue full");
                }
                Err(_) => {}
            }
        }
    }

    // ========================================================================
    // Inbound Handling
    // ========================================================================

    async fn handle_incoming(&self, msg: IncomingMessage) {
        let policy = self.multiplexer.handle(&msg).await;
        match policy {
            ForwardingPolicy::Ignore => {}
            ForwardingPolicy::Disconnect => {
                info!(peer = %msg.sender, tag = %msg.tag, "handler requested disconnect");
                self.remove_peer(&msg.sender, "handler requested disconnect");
                return;
            }
            ForwardingPolicy::Broadcast => {
                if let Err(e) = self.relay(msg.tag, msg.data.clone(), Some(msg.sender.id())) {
                    trace!(tag = %msg.tag, error = %e, "relay failed");
                }
            }
        }
        if self.config.enable_outgoing_message_filter && msg.data.len() >= MESSAGE_FILTER_SIZE {
            let digest = message_digest(msg.tag, &msg.data);
            let request = self.make_request(
                tags::MSG_DIGEST_SKIP,
                Arc::from(&digest[..]),
                SystemTime::now(),
                Some(msg.sender.id()),
            );
            let _ = self.try_broadcast(request);
        }
    }

    fn handle_prio_response(&self, msg: &IncomingMessage) -> ForwardingPolicy {
        let Some(scheme) = &self.prio_scheme else {
            return ForwardingPolicy::Ignore;
        };
        let Some(challenge) = msg.sender.prio_challenge() else {
            return ForwardingPolicy::Ignore;
        };
        if msg.sender.prio_address().is_some() {
            return ForwardingPolicy::Ignore;
        }
        match scheme.verify_prio_response(challenge, &msg.data) {
            Ok(addr) => {
                let weight = scheme.get_prio_weight(&addr);
                self.set_peer_priority(&msg.sender, addr, weight);
                ForwardingPolicy::Ignore
            }
            Err(e) => {
                warn!(peer = %msg.sender, error = %e, "invalid priority response");
                ForwardingPolicy::Disconnect
            }
        }
    }

    fn set_peer_priority(&self, peer: &Arc<Peer>, addr: crate::priority::PrioAddress, weight: u64) {
        {
            let mut set = self.peers.write().unwrap_or_else(|e| e.into_inner());
            if set.find(peer.id()).is_none() {
                return;
            }
            peer.set_prio(addr, weight);
            if let Some(old) = set.prio.set_priority(peer.id(), addr)
                && let Some(old_peer) = set.find(old)
            {
                debug!(peer = %old_peer, "priority address claimed by newer connection");
                old_peer.reset_prio_weight();
            }
        }
        debug!(peer = %peer, addr = %addr, weight, "peer priority verified");
        if let Some(observer) = &self.prio_observer {
            let _ = observer.try_send(peer.clone());
        }
        self.enforce_connection_budget();
    }

    /// Close the lowest-weight inbound peers beyond the configured budget.
    /// Peers without a verified priority weigh zero and go first.
    fn enforce_connection_budget(&self) {
        let Some(budget) = self.config.connection_budget else {
            return;
        };
        let victims = {
            let set = self.peers.read().unwrap_or_else(|e| e.into_inner());
            let mut inbound: Vec<Arc<Peer>> =
                set.peers.iter().filter(|p| !p.is_outgoing()).cloned().collect();
            if inbound.len() <= budget {
                return;
            }
            inbound.sort_by_key(|p| {
                let weight = if p.prio_address().is_some() { p.prio_weight() } else { 0 };
                (std::cmp::Reverse(weight), p.prio_address().is_none(), p.id())
            });
            inbound.split_off(budget)
        };
        for peer in victims {
            info!(peer = %peer, weight = peer.prio_weight(), "closing peer over connection budget");
            self.remove_peer(&peer, "over connection budget");
        }
    }

    // ========================================================================
    // Handshakes
    // ========================================================================

    /// Checks on an inbound request that precede peer creation. On success
    /// the returned slot counts against the limits until the peer is added
    /// or the slot is dropped.
    fn check_incoming(
        &self,
        request: &HandshakeRequest,
        origin_ip: Option<IpAddr>,
    ) -> Result<InboundSlot<'_>, RejectReason> {
        if request.path != gossip_path(&self.genesis_id) {
            return Err(RejectReason::BadPath);
        }
        check_headers(&request.headers, &self.genesis_id, &self.node_random)?;

        let mut set = self.peers.write().unwrap_or_else(|e| e.into_inner());
        let inbound = set.peers.iter().filter(|p| !p.is_outgoing());
        if let Some(limit) = self.config.incoming_connections_limit
            && inbound.clone().count() + set.pending_inbound.len() >= limit
        {
            return Err(RejectReason::TooManyConnections);
        }
        if let Some(ip) = origin_ip {
            let connected = inbound.filter(|p| host_ip(p.remote_addr()) == Some(ip)).count();
            let pending = set.pending_inbound.iter().filter(|p| **p == Some(ip)).count();
            if connected + pending >= self.config.max_connections_per_ip {
                return Err(RejectReason::TooManyConnections);
            }
        }
        set.pending_inbound.push(origin_ip);
        Ok(InboundSlot {
            inner: self,
            ip: origin_ip,
            held: true,
        })
    }

    async fn accept_connection(self: &Arc<Self>, mut conn: Connection) -> Result<()> {
        let request: Result<HandshakeRequest> =
            match timeout(self.config.handshake_timeout, read_handshake(&mut conn)).await {
                Ok(r) => r,
                Err(_) => Err(anyhow!("handshake timed out")),
            };
        let forwarded = self.config.use_x_forwarded_for_address_field.as_deref();
        let verdict = match &request {
            Ok(req) => {
                let origin_ip = forwarded_ip(&req.headers, forwarded).or_else(|| host_ip(conn.remote_addr()));
                self.check_incoming(req, origin_ip)
            }
            Err(_) => Err(RejectReason::Malformed),
        };

        let (request, slot) = match (request, verdict) {
            (Ok(req), Ok(slot)) => (req, slot),
            (request, verdict) => {
                let reason = verdict.err().unwrap_or(RejectReason::Malformed);
                NetworkMetrics::incr(&self.metrics.handshake_rejections);
                debug!(remote = %conn.remote_addr(), reason = %reason, "rejecting inbound connection");
                let response = HandshakeResponse {
                    status: HandshakeStatus::Rejected {
                        reason: reason.as_str().to_string(),
                    },
                    headers: self.local_headers(),
                };
                let _ = timeout(self.config.handshake_timeout, write_handshake(&mut conn, &response)).await;
                let _ = conn.close().await;
                return match request {
                    Err(e) => Err(e),
                    Ok(_) => Err(NetworkError::HandshakeRejected(reason).into()),
                };
            }
        };

        let challenge = self.prio_scheme.as_ref().map(|s| s.new_prio_challenge());
        let mut headers = self.local_headers();
        if let Some(challenge) = &challenge {
            headers.set(PRIORITY_CHALLENGE_HEADER, challenge.as_str());
        }
        let response = HandshakeResponse {
            status: HandshakeStatus::Accepted,
            headers,
        };
        timeout(self.config.handshake_timeout, write_handshake(&mut conn, &response))
            .await
            .map_err(|_| anyhow!("handshake response timed out"))??;

        let remote_addr = match forwarded_ip(&request.headers, forwarded) {
            Some(ip) => ip.to_string(),
            None => conn.remote_addr().to_string(),
        };
        let peer = Peer::new(PeerParams {
            id: self.next_peer_id(),
            direction: Direction::Inbound,
            remote_addr,
            root_url: claimed_address(&request.headers, forwarded),
            queue_high: self.config.peer_queue_high,
            queue_bulk: self.config.peer_queue_bulk,
            telemetry_id: request.headers.get(TELEMETRY_ID_HEADER).unwrap_or_default().to_string(),
            instance_name: request.headers.get(INSTANCE_NAME_HEADER).unwrap_or_default().to_string(),
            prio_challenge: challenge,
            outgoing_filter: self.new_outgoing_filter(),
        });
        self.add_peer(&peer, conn, Some(slot))?;
        info!(peer = %peer, "accepted peer");
        Ok(())
    }

    async fn client_handshake(&self, conn: &mut Connection, gossip_addr: &str) -> Result<HandshakeResponse> {
        let path = Url::parse(gossip_addr)
            .map(|u| u.path().to_string())
            .unwrap_or_else(|_| gossip_path(&self.genesis_id));
        let request = HandshakeRequest {
            path,
            headers: self.local_headers(),
        };
        write_handshake(conn, &request).await?;
        read_handshake(conn).await
    }

    async fn connect_to(self: &Arc<Self>, gossip_addr: &str) -> Result<Arc<Peer>, NetworkError> {
        let result = self.try_connect(gossip_addr).await;
        match &result {
            Err(NetworkError::HandshakeRejected(reason)) => {
                NetworkMetrics::incr(&self.metrics.handshake_rejections);
                debug!(addr = %gossip_addr, reason = %reason, "handshake rejected");
            }
            Err(e) => {
                NetworkMetrics::incr(&self.metrics.dial_failures);
                debug!(addr = %gossip_addr, error = %e, "connection attempt failed");
            }
            Ok(_) => self.update_ready(),
        }
        result
    }

    async fn try_connect(self: &Arc<Self>, gossip_addr: &str) -> Result<Arc<Peer>, NetworkError> {
        let mut conn = match timeout(self.config.dial_timeout, self.dialer.dial(gossip_addr)).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => return Err(NetworkError::DialFailure(format!("{e:#}"))),
            Err(_) => return Err(NetworkError::DialFailure(format!("dial {gossip_addr} timed out"))),
        };
        let response = match timeout(
            self.config.handshake_timeout,
            self.client_handshake(&mut conn, gossip_addr),
        )
        .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                let _ = conn.close().await;
                return Err(NetworkError::ConnectionError(format!("{e:#}")));
            }
            Err(_) => {
                let _ = conn.close().await;
                return Err(NetworkError::ConnectionError("handshake timed out".into()));
            }
        };
        if let HandshakeStatus::Rejected { reason } = &response.status {
            return Err(NetworkError::HandshakeRejected(RejectReason::from_wire(reason)));
        }
        if let Err(reason) = check_headers(&response.headers, &self.genesis_id, &self.node_random) {
            let _ = conn.close().await;
            return Err(NetworkError::HandshakeRejected(reason));
        }

        let peer = Peer::new(PeerParams {
            id: self.next_peer_id(),
            direction: Direction::Outbound,
            remote_addr: conn.remote_addr().to_string(),
            root_url: Some(gossip_addr.to_string()),
            queue_high: self.config.peer_queue_high,
            queue_bulk: self.config.peer_queue_bulk,
            telemetry_id: response.headers.get(TELEMETRY_ID_HEADER).unwrap_or_default().to_string(),
            instance_name: response.headers.get(INSTANCE_NAME_HEADER).unwrap_or_default().to_string(),
            prio_challenge: None,
            outgoing_filter: self.new_outgoing_filter(),
        });
        self.add_peer(&peer, conn, None)?;
        info!(peer = %peer, "connected to peer");

        if let Some(challenge) = response.headers.get(PRIORITY_CHALLENGE_HEADER)
            && let Some(scheme) = &self.prio_scheme
            && let Some(answer) = scheme.make_prio_response(challenge)
        {
            if let Err(e) = peer.send(tags::NET_PRIO_RESPONSE, answer, SendPriority::High) {
                debug!(peer = %peer, error = %e, "failed to queue priority response");
            }
        }
        Ok(peer)
    }

    // ========================================================================
    // Background Tasks
    // ========================================================================

    async fn accept_loop(self: Arc<Self>, mut listener: Box<dyn Listener>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let conn = tokio::select! {
                biased;
                _ = shutdown.wait_for(|s| *s) => break,
                conn = listener.accept() => conn,
            };
            match conn {
                Ok(conn) => {
                    let net = self.clone();
                    tokio::spawn(async move {
                        let remote = conn.remote_addr().to_string();
                        if let Err(e) = net.accept_connection(conn).await {
                            debug!(remote = %remote, error = %e, "inbound handshake failed");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }

    async fn dispatch_loop(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<BroadcastRequest>,
        priority: SendPriority,
    ) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let request = tokio::select! {
                biased;
                _ = shutdown.wait_for(|s| *s) => break,
                r = rx.recv() => match r {
                    Some(r) => r,
                    None => break,
                },
            };
            self.dispatch(request, priority);
        }
    }

    async fn reader_worker(
        self: Arc<Self>,
        rx: Arc<tokio::sync::Mutex<mpsc::Receiver<IncomingMessage>>>,
    ) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let msg = {
                let mut rx = rx.lock().await;
                tokio::select! {
                    biased;
                    _ = shutdown.wait_for(|s| *s) => return,
                    msg = rx.recv() => msg,
                }
            };
            let Some(msg) = msg else {
                return;
            };
            tokio::select! {
                biased;
                _ = shutdown.wait_for(|s| *s) => return,
                _ = self.handle_incoming(msg) => {}
            }
        }
    }

    async fn mesh_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.config.mesh_interval);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait_for(|s| *s) => break,
                _ = ticker.tick() => {}
                _ = self.mesh_notify.notified() => {}
            }
            tokio::select! {
                biased;
                _ = shutdown.wait_for(|s| *s) => break,
                _ = self.mesh_round() => {}
            }
        }
    }

    async fn mesh_round(self: &Arc<Self>) {
        self.enforce_connection_budget();
        let outgoing = self.count_peers(Direction::Outbound);
        let fanout = self.config.gossip_fanout;
        if outgoing >= fanout {
            self.ready.send_replace(true);
            return;
        }
        let needed = fanout - outgoing;
        let phonebook = self.phonebook();

        let mut attempts = JoinSet::new();
        for addr in phonebook.get_addresses(fanout + outgoing) {
            if attempts.len() >= needed {
                break;
            }
            let gossip_addr = match addr_to_gossip_addr(&addr, &self.genesis_id) {
                Ok(a) => a,
                Err(e) => {
                    debug!(addr = %addr, error = %e, "skipping unparseable phonebook address");
                    continue;
                }
            };
            if self.is_connected_to(&gossip_addr) || self.in_backoff(&gossip_addr) {
                continue;
            }
            if !self
                .dialing
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(gossip_addr.clone())
            {
                continue;
            }
            let net = self.clone();
            let phonebook = phonebook.clone();
            attempts.spawn(async move {
                let result = net.connect_to(&gossip_addr).await;
                net.dialing
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&gossip_addr);
                if result.is_err() {
                    net.back_off(&gossip_addr);
                    phonebook.update_retry_after(&addr, Instant::now() + net.config.reconnect_backoff);
                }
            });
        }
        while attempts.join_next().await.is_some() {}
        self.update_ready();
    }

    fn is_connected_to(&self, gossip_addr: &str) -> bool {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .peers
            .iter()
            .any(|p| p.is_outgoing() && p.root_url() == Some(gossip_addr))
    }

    async fn monitor_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.config.slow_writing_peer_monitor_interval);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait_for(|s| *s) => break,
                _ = ticker.tick() => {}
            }
            let now = SystemTime::now();
            for peer in self.snapshot_peers() {
                if peer.check_slow_writing(now, self.config.max_message_queue_duration) {
                    warn!(peer = %peer, "disconnecting slow peer");
                    NetworkMetrics::incr(&self.metrics.slow_peers_disconnected);
                    self.remove_peer(&peer, "slow writer");
                }
            }
        }
    }

    async fn eventual_ready(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        tokio::select! {
            _ = shutdown.wait_for(|s| *s) => {}
            _ = tokio::time::sleep(self.config.eventual_ready_delay) => {
                self.ready.send_replace(true);
            }
        }
    }
}

// ============================================================================
// Public Handle
// ============================================================================

/// Handle to a gossip node. Cheap to clone.
#[derive(Clone)]
pub struct Network {
    inner: Arc<NetworkInner>,
}

impl Network {
    pub fn builder(genesis_id: impl Into<String>) -> NetworkBuilder {
        NetworkBuilder::new(genesis_id)
    }

    /// Bind the listener (if any) and spawn every background task.
    pub async fn start(&self) -> Result<(), NetworkError> {
        let inner = &self.inner;
        if inner.is_shutting_down() {
            return Err(NetworkError::Closed);
        }
        let Some(queues) = inner.queues.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            return Ok(());
        };

        let provided = inner.listener.lock().unwrap_or_else(|e| e.into_inner()).take();
        let listener: Option<Box<dyn Listener>> = match (provided, &inner.config.listen_address) {
            (Some(l), _) => Some(l),
            (None, Some(addr)) => {
                let l = TcpListener::bind(addr, inner.config.max_message_size)
                    .await
                    .map_err(|e| NetworkError::ConnectionError(format!("{e:#}")))?;
                Some(Box::new(l))
            }
            (None, None) => None,
        };

        let mut tasks = Vec::new();
        if let Some(listener) = listener {
            let local = listener
                .local_addr()
                .map_err(|e| NetworkError::ConnectionError(format!("{e:#}")))?;
            info!(addr = %local, genesis = %inner.genesis_id, "gossip network listening");
            *inner.local_addr.write().unwrap_or_else(|e| e.into_inner()) = Some(local);
            tasks.push(tokio::spawn(inner.clone().accept_loop(listener)));
        }

        tasks.push(tokio::spawn(
            inner.clone().dispatch_loop(queues.high, SendPriority::High),
        ));
        tasks.push(tokio::spawn(
            inner.clone().dispatch_loop(queues.bulk, SendPriority::Bulk),
        ));
        let incoming = Arc::new(tokio::sync::Mutex::new(queues.incoming));
        for _ in 0..inner.config.incoming_threads {
            tasks.push(tokio::spawn(inner.clone().reader_worker(incoming.clone())));
        }
        tasks.push(tokio::spawn(inner.clone().mesh_loop()));
        tasks.push(tokio::spawn(inner.clone().monitor_loop()));
        tasks.push(tokio::spawn(inner.clone().eventual_ready()));

        inner
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(tasks);
        inner.started.store(true, Ordering::Release);
        debug!(
            workers = inner.config.incoming_threads,
            fanout = inner.config.gossip_fanout,
            "gossip network started"
        );
        Ok(())
    }

    /// Close every peer and wait (bounded) for all tasks to finish.
    pub async fn stop(&self) {
        let inner = &self.inner;
        if inner.shutdown.send_replace(true) {
            return;
        }
        let peers = {
            let mut set = inner.peers.write().unwrap_or_else(|e| e.into_inner());
            let peers = std::mem::take(&mut set.peers);
            set.prio = PrioTracker::new();
            for peer in &peers {
                peer.close();
            }
            peers
        };
        let mut handles: Vec<JoinHandle<()>> =
            std::mem::take(&mut *inner.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for peer in &peers {
            handles.extend(peer.take_tasks());
        }

        let joined = timeout(STOP_TIMEOUT, async {
            for handle in handles.iter_mut() {
                let _ = handle.await;
            }
        })
        .await;
        if joined.is_err() {
            warn!("tasks did not stop in time; aborting");
            for handle in &handles {
                handle.abort();
            }
        }
        info!(peers = peers.len(), "gossip network stopped");
    }

    /// Queue a broadcast to every peer except `exclude`. Never blocks;
    /// delivery happens asynchronously.
    pub fn broadcast(
        &self,
        tag: Tag,
        data: impl Into<Arc<[u8]>>,
        exclude: Option<PeerId>,
    ) -> Result<(), NetworkError> {
        self.broadcast_at(tag, data, SystemTime::now(), exclude)
    }

    /// Like [`broadcast`](Self::broadcast) with an explicit enqueue time,
    /// which decides when the message becomes too old to send.
    pub fn broadcast_at(
        &self,
        tag: Tag,
        data: impl Into<Arc<[u8]>>,
        enqueued_at: SystemTime,
        exclude: Option<PeerId>,
    ) -> Result<(), NetworkError> {
        let request = self.inner.make_request(tag, data.into(), enqueued_at, exclude);
        self.inner.try_broadcast(request)
    }

    /// Queue a broadcast, waiting for queue space until the node stops.
    pub async fn broadcast_wait(
        &self,
        tag: Tag,
        data: impl Into<Arc<[u8]>>,
        exclude: Option<PeerId>,
    ) -> Result<(), NetworkError> {
        let inner = &self.inner;
        inner.check_running()?;
        let request = inner.make_request(tag, data.into(), SystemTime::now(), exclude);
        let mut shutdown = inner.shutdown.subscribe();
        tokio::select! {
            biased;
            _ = shutdown.wait_for(|s| *s) => Err(NetworkError::Closed),
            r = inner.queue_for(tag).send(request) => r.map_err(|_| NetworkError::Closed),
        }
    }

    /// Broadcast only if this node relays; otherwise a successful no-op.
    pub fn relay(
        &self,
        tag: Tag,
        data: impl Into<Arc<[u8]>>,
        exclude: Option<PeerId>,
    ) -> Result<(), NetworkError> {
        self.inner.check_running()?;
        self.inner.relay(tag, data.into(), exclude)
    }

    /// Send directly to one peer.
    pub fn unicast(&self, peer: &Peer, tag: Tag, data: impl Into<Arc<[u8]>>) -> Result<(), NetworkError> {
        self.inner.check_running()?;
        peer.send(tag, data, SendPriority::for_tag(tag))
    }

    /// Dial `addr` now, outside of mesh maintenance.
    pub async fn connect(&self, addr: &str) -> Result<Arc<Peer>, NetworkError> {
        self.inner.check_running()?;
        let gossip_addr = addr_to_gossip_addr(addr, &self.inner.genesis_id)
            .map_err(|e| NetworkError::DialFailure(format!("invalid address {addr}: {e}")))?;
        self.inner.connect_to(&gossip_addr).await
    }

    /// Close and remove a connected peer.
    pub fn disconnect(&self, peer: &Arc<Peer>) {
        self.inner.remove_peer(peer, "disconnect requested");
    }

    pub fn register_handlers(&self, handlers: impl IntoIterator<Item = TaggedMessageHandler>) {
        self.inner.multiplexer.register_handlers(handlers);
    }

    /// Remove every application handler. The priority response handler
    /// stays installed.
    pub fn clear_handlers(&self) {
        self.inner
            .multiplexer
            .clear_handlers(&[tags::NET_PRIO_RESPONSE]);
    }

    pub fn peers(&self, options: &[PeerOption]) -> Vec<KnownPeer> {
        let snapshot = self.inner.snapshot_peers();
        let mut out = Vec::new();
        for option in options {
            match option {
                PeerOption::ConnectedIn => out.extend(
                    snapshot
                        .iter()
                        .filter(|p| !p.is_outgoing())
                        .cloned()
                        .map(KnownPeer::Connected),
                ),
                PeerOption::ConnectedOut => out.extend(
                    snapshot
                        .iter()
                        .filter(|p| p.is_outgoing())
                        .cloned()
                        .map(KnownPeer::Connected),
                ),
                PeerOption::PhonebookKnown => out.extend(
                    self.inner
                        .phonebook()
                        .get_addresses(usize::MAX)
                        .into_iter()
                        .map(KnownPeer::Phonebook),
                ),
            }
        }
        out
    }

    /// Resolves once outbound connectivity reaches the fanout or the
    /// eventual-ready delay has passed.
    pub async fn ready(&self) {
        let mut ready = self.inner.ready.subscribe();
        let _ = ready.wait_for(|r| *r).await;
    }

    /// Gossip URL of this node's listener, if it listens.
    pub fn address(&self) -> Option<String> {
        let addr = self.inner.public_address()?;
        addr_to_gossip_addr(&addr, &self.inner.genesis_id).ok()
    }

    pub fn genesis_id(&self) -> &str {
        &self.inner.genesis_id
    }

    pub fn relay_messages(&self) -> bool {
        self.inner.relay_messages.load(Ordering::Relaxed)
    }

    pub fn set_relay_messages(&self, relay: bool) {
        self.inner.relay_messages.store(relay, Ordering::Relaxed);
    }

    /// Replace the address source and trigger a mesh round.
    pub fn set_phonebook(&self, phonebook: Arc<dyn Phonebook>) {
        *self.inner.phonebook.write().unwrap_or_else(|e| e.into_inner()) = phonebook;
        self.inner.mesh_notify.notify_one();
    }

    /// Trigger a mesh round now.
    pub fn request_connect(&self) {
        self.inner.mesh_notify.notify_one();
    }

    pub fn metrics(&self) -> Arc<NetworkMetrics> {
        self.inner.metrics.clone()
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.inner.config
    }
}

impl fmt::Debug for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Network")
            .field("genesis_id", &self.inner.genesis_id)
            .field("address", &self.address())
            .field("peers", &self.inner.snapshot_peers().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use std::net::Ipv4Addr;
    use std::sync::atomic::AtomicUsize;

    const WAIT: Duration = Duration::from_secs(5);

    fn request_headers(genesis: &str, random: &str) -> Headers {
        let mut headers = Headers::new();
        headers.set(PROTOCOL_VERSION_HEADER, PROTOCOL_VERSION);
        headers.set(GENESIS_HEADER, genesis);
        headers.set(NODE_RANDOM_HEADER, random);
        headers
    }

    #[test]
    fn header_checks() {
        let ok = request_headers("net", "remote");
        assert_eq!(check_headers(&ok, "net", "local"), Ok(()));
        assert_eq!(
            check_headers(&ok, "other", "local"),
            Err(RejectReason::GenesisMismatch)
        );
        assert_eq!(
            check_headers(&ok, "net", "remote"),
            Err(RejectReason::SelfConnection)
        );

        let mut old = request_headers("net", "remote");
        old.set(PROTOCOL_VERSION_HEADER, "0");
        assert_eq!(
            check_headers(&old, "net", "local"),
            Err(RejectReason::UnsupportedVersion)
        );
        assert_eq!(
            check_headers(&Headers::new(), "net", "local"),
            Err(RejectReason::UnsupportedVersion)
        );
    }

    #[test]
    fn reject_reasons_round_trip_on_the_wire() {
        for reason in [
            RejectReason::GenesisMismatch,
            RejectReason::UnsupportedVersion,
            RejectReason::SelfConnection,
            RejectReason::BadPath,
            RejectReason::TooManyConnections,
            RejectReason::Malformed,
        ] {
            assert_eq!(RejectReason::from_wire(reason.as_str()), reason);
        }
        assert_eq!(RejectReason::from_wire("nonsense"), RejectReason::Malformed);
    }

    #[test]
    fn url_host_rewriting() {
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9));
        assert_eq!(
            update_url_host("ws://relay.example:4160/v1/g/gossip", ip).unwrap(),
            "ws://10.0.0.9:4160/v1/g/gossip"
        );
        assert_eq!(update_url_host("relay.example:4160", ip).unwrap(), "10.0.0.9:4160");
        assert_eq!(
            update_url_host("relay.example:4160", "::1".parse().unwrap()).unwrap(),
            "[::1]:4160"
        );
        assert!(update_url_host("ws://[bad", ip).is_err());
    }

    #[test]
    fn claimed_address_uses_forwarded_ip() {
        let mut headers = Headers::new();
        assert_eq!(claimed_address(&headers, Some("X-Forwarded-For")), None);

        headers.set(ADDRESS_HEADER, "relay.example:4160");
        assert_eq!(
            claimed_address(&headers, None).as_deref(),
            Some("relay.example:4160")
        );

        headers.set("X-Forwarded-For", "192.168.1.7, 10.0.0.1");
        assert_eq!(
            claimed_address(&headers, Some("X-Forwarded-For")).as_deref(),
            Some("192.168.1.7:4160")
        );
        // Header not trusted: ignored.
        assert_eq!(
            claimed_address(&headers, None).as_deref(),
            Some("relay.example:4160")
        );

        headers.set("X-Forwarded-For", "not-an-ip");
        assert_eq!(
            claimed_address(&headers, Some("X-Forwarded-For")).as_deref(),
            Some("relay.example:4160")
        );
    }

    fn memory_config() -> NetworkConfig {
        NetworkConfig {
            incoming_threads: 2,
            gossip_fanout: 1,
            mesh_interval: Duration::from_millis(50),
            reconnect_backoff: Duration::from_millis(50),
            eventual_ready_delay: Duration::from_millis(200),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn operations_require_start() {
        let net = Network::builder("g").config(memory_config()).build().unwrap();
        assert_eq!(
            net.broadcast(tags::TXN, &b"x"[..], None),
            Err(NetworkError::NotStarted)
        );
        net.start().await.unwrap();
        assert_eq!(net.broadcast(tags::TXN, &b"x"[..], None), Ok(()));
        net.stop().await;
        assert_eq!(net.broadcast(tags::TXN, &b"x"[..], None), Err(NetworkError::Closed));
        assert_eq!(net.start().await, Err(NetworkError::Closed));
    }

    #[tokio::test]
    async fn configured_filter_rotation_reaches_both_filters() {
        let net = Network::builder("g")
            .config(NetworkConfig {
                incoming_message_filter_rotation_interval: Some(Duration::from_secs(3)),
                outgoing_message_filter_rotation_interval: Some(Duration::from_secs(7)),
                ..memory_config()
            })
            .build()
            .unwrap();
        let incoming = net.inner.incoming_filter.as_ref().unwrap();
        assert_eq!(incoming.rotation_interval(), Some(Duration::from_secs(3)));
        let outgoing = net.inner.new_outgoing_filter().unwrap();
        assert_eq!(outgoing.rotation_interval(), Some(Duration::from_secs(7)));

        let plain = Network::builder("g").config(memory_config()).build().unwrap();
        assert_eq!(plain.inner.new_outgoing_filter().unwrap().rotation_interval(), None);
    }

    fn loose_peer(net: &Network, direction: Direction) -> Arc<Peer> {
        Peer::new(PeerParams {
            id: net.inner.next_peer_id(),
            direction,
            remote_addr: "mem9:1".into(),
            root_url: None,
            queue_high: 4,
            queue_bulk: 4,
            telemetry_id: String::new(),
            instance_name: String::new(),
            prio_challenge: None,
            outgoing_filter: None,
        })
    }

    #[tokio::test]
    async fn registered_peers_are_started_and_drained_by_stop() {
        let net = Network::builder("g").config(memory_config()).build().unwrap();
        net.start().await.unwrap();

        let (ours, _theirs) = Connection::memory_pair(1024, 1024, "mem9:0", "mem9:1");
        let peer = loose_peer(&net, Direction::Inbound);
        net.inner.add_peer(&peer, ours, None).unwrap();
        assert!(!peer.is_closed());
        net.stop().await;
        assert!(peer.is_closed());
        assert!(peer.take_tasks().is_empty());

        // Registration after stop fails and never spawns loops.
        let (ours, _theirs) = Connection::memory_pair(1024, 1024, "mem9:0", "mem9:1");
        let late = loose_peer(&net, Direction::Inbound);
        assert_eq!(net.inner.add_peer(&late, ours, None), Err(NetworkError::Closed));
        assert!(late.is_closed());
        assert!(late.take_tasks().is_empty());
        assert!(net.peers(&[PeerOption::ConnectedIn]).is_empty());
    }

    #[tokio::test]
    async fn relay_is_noop_without_listener() {
        let net = Network::builder("g").config(memory_config()).build().unwrap();
        net.start().await.unwrap();
        assert!(!net.relay_messages());
        assert_eq!(net.relay(tags::TXN, &b"x"[..], None), Ok(()));
        assert_eq!(net.metrics().snapshot().broadcast_queue_full, 0);
        net.stop().await;
    }

    #[tokio::test]
    async fn clear_handlers_keeps_priority_handler() {
        let scheme = Arc::new(crate::priority::Ed25519PrioScheme::new(
            crate::identity::Keypair::generate(),
        ));
        let net = Network::builder("g")
            .config(memory_config())
            .prio_scheme(scheme)
            .handlers([TaggedMessageHandler::from_fn(tags::TXN, |_| {
                ForwardingPolicy::Ignore
            })])
            .build()
            .unwrap();
        assert!(net.inner.multiplexer.has_handler(tags::TXN));
        net.clear_handlers();
        assert!(!net.inner.multiplexer.has_handler(tags::TXN));
        assert!(net.inner.multiplexer.has_handler(tags::NET_PRIO_RESPONSE));
    }

    #[tokio::test]
    async fn mesh_connects_from_phonebook_and_becomes_ready() {
        let transport = MemoryTransport::new();
        let a = Network::builder("g")
            .config(memory_config())
            .listener(Box::new(transport.listen()))
            .dialer(Arc::new(transport.clone()))
            .build()
            .unwrap();
        a.start().await.unwrap();
        let a_addr = a.address().unwrap();

        let b = Network::builder("g")
            .config(NetworkConfig {
                eventual_ready_delay: Duration::from_secs(60),
                ..memory_config()
            })
            .dialer(Arc::new(transport.clone()))
            .phonebook(Arc::new(crate::phonebook::StaticPhonebook::new([a_addr.clone()])))
            .build()
            .unwrap();
        b.start().await.unwrap();

        timeout(WAIT, b.ready()).await.expect("b never became ready");
        let out = b.peers(&[PeerOption::ConnectedOut]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].address(), a_addr);
        assert_eq!(b.peers(&[PeerOption::PhonebookKnown]).len(), 1);

        b.stop().await;
        a.stop().await;
    }

    #[tokio::test]
    async fn slow_handler_occupies_only_one_worker() {
        let transport = MemoryTransport::new();
        let fast_hits = Arc::new(AtomicUsize::new(0));
        let counter = fast_hits.clone();

        struct Sleepy;
        #[async_trait]
        impl MessageHandler for Sleepy {
            async fn handle(&self, _message: &IncomingMessage) -> ForwardingPolicy {
                tokio::time::sleep(Duration::from_secs(30)).await;
                ForwardingPolicy::Ignore
            }
        }

        let a = Network::builder("g")
            .config(memory_config())
            .listener(Box::new(transport.listen()))
            .handlers([
                TaggedMessageHandler::new(tags::TXN, Arc::new(Sleepy)),
                TaggedMessageHandler::from_fn(tags::AGREEMENT_VOTE, move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    ForwardingPolicy::Ignore
                }),
            ])
            .build()
            .unwrap();
        a.start().await.unwrap();

        let b = Network::builder("g")
            .config(memory_config())
            .dialer(Arc::new(transport.clone()))
            .build()
            .unwrap();
        b.start().await.unwrap();
        b.connect(&a.address().unwrap()).await.unwrap();

        b.broadcast(tags::TXN, &b"slow"[..], None).unwrap();
        for i in 0..3u8 {
            b.broadcast(tags::AGREEMENT_VOTE, vec![i], None).unwrap();
        }
        timeout(WAIT, async {
            while fast_hits.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("fast handler starved by slow one");

        b.stop().await;
        a.stop().await;
    }
}
