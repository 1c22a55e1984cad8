//! # Peer Connections
//!
//! A [`Peer`] owns one framed connection and runs two tasks over it:
//!
//! | Task | Responsibility |
//! |------|----------------|
//! | Write loop | Drain the high-priority queue, then one bulk message; frame and write |
//! | Read loop | Decode frames, apply the inbound filter, push to the node's inbound buffer |
//!
//! ## Outbound Queues
//!
//! Each peer has two bounded queues. [`Peer::send`] never blocks: a full
//! queue is reported as [`NetworkError::QueueFull`]. The write loop always
//! empties the high-priority queue before taking a single bulk message, so
//! urgent traffic is never stuck behind bulk once a slot frees up.
//!
//! ## Slow Writers
//!
//! While a message is being written the peer records its enqueue time. If
//! that time falls further behind than the queue-duration limit, or the
//! high-priority queue has been full for that long, the peer reports itself
//! slow and the node's monitor evicts it.
//!
//! ## Lifecycle
//!
//! Closing is a one-way `watch` flag. Both loops select on it, so `close()`
//! interrupts a write stuck on a peer that stopped reading. A loop that hits
//! an I/O error asks the node (through [`PeerRegistry`]) to remove the peer;
//! the node removes and closes it under its peer-set lock.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::filter::{Digest, MessageFilter};
use crate::identity::Identity;
use crate::metrics::NetworkMetrics;
use crate::multiplexer::IncomingMessage;
use crate::network::NetworkError;
use crate::protocol::{Tag, decode_frame, encode_frame, is_dedup_safe, is_high_priority, tags};
use crate::transport::{MessageSink, MessageSource};

/// Bound on flushing and shutting down the write half after the loop exits.
const SINK_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

pub type PeerId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The remote dialed us.
    Inbound,
    /// We dialed the remote.
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPriority {
    High,
    Bulk,
}

impl SendPriority {
    pub fn for_tag(tag: Tag) -> Self {
        if is_high_priority(tag) {
            SendPriority::High
        } else {
            SendPriority::Bulk
        }
    }
}

/// One queued outbound message.
#[derive(Clone, Debug)]
pub struct SendMessage {
    pub tag: Tag,
    pub data: Arc<[u8]>,
    pub enqueued_at: SystemTime,
    /// Unsalted digest, set for messages large enough to be subject to the
    /// peer's outgoing filter.
    pub digest: Option<Digest>,
}

/// Callback from a peer's loops into the owning node.
pub(crate) trait PeerRegistry: Send + Sync {
    /// Remove `peer` from the peer set and close it.
    fn remove_peer(&self, peer: &Arc<Peer>, reason: &'static str);
}

/// Node-wide resources shared by every peer's loops.
pub(crate) struct PeerContext {
    pub incoming: mpsc::Sender<IncomingMessage>,
    pub incoming_filter: Option<Arc<MessageFilter>>,
    pub metrics: Arc<NetworkMetrics>,
    pub registry: Weak<dyn PeerRegistry>,
    pub max_message_queue_duration: Duration,
}

impl PeerContext {
    fn remove(&self, peer: &Arc<Peer>, reason: &'static str) {
        match self.registry.upgrade() {
            Some(registry) => registry.remove_peer(peer, reason),
            None => {
                peer.close();
            }
        }
    }
}

pub(crate) struct PeerParams {
    pub id: PeerId,
    pub direction: Direction,
    pub remote_addr: String,
    pub root_url: Option<String>,
    pub queue_high: usize,
    pub queue_bulk: usize,
    pub telemetry_id: String,
    pub instance_name: String,
    pub prio_challenge: Option<String>,
    pub outgoing_filter: Option<MessageFilter>,
}

#[derive(Debug, Default, Clone, Copy)]
struct PeerPrio {
    address: Option<Identity>,
    weight: u64,
}

type Queues = (mpsc::Receiver<SendMessage>, mpsc::Receiver<SendMessage>);

pub struct Peer {
    id: PeerId,
    direction: Direction,
    remote_addr: String,
    root_url: Option<String>,
    telemetry_id: String,
    instance_name: String,
    prio_challenge: Option<String>,

    high_tx: mpsc::Sender<SendMessage>,
    bulk_tx: mpsc::Sender<SendMessage>,
    queues: Mutex<Option<Queues>>,
    closing: watch::Sender<bool>,

    /// Unix nanos; zero means never / idle.
    last_send: AtomicU64,
    intermittent_enqueue: AtomicU64,
    high_full_since: AtomicU64,

    prio: Mutex<PeerPrio>,
    outgoing_filter: Option<MessageFilter>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn unix_nanos(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(1)
        .max(1)
}

fn from_unix_nanos(n: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_nanos(n)
}

/// True if `stamp` (unix nanos, 0 = unset) is more than `max` before `now`.
fn older_than(stamp: u64, now: SystemTime, max: Duration) -> bool {
    stamp != 0
        && now
            .duration_since(from_unix_nanos(stamp))
            .is_ok_and(|age| age > max)
}

pub(crate) fn is_stale(enqueued_at: SystemTime, now: SystemTime, max: Duration) -> bool {
    now.duration_since(enqueued_at).is_ok_and(|age| age > max)
}

impl Peer {
    pub(crate) fn new(params: PeerParams) -> Arc<Self> {
        let (high_tx, high_rx) = mpsc::channel(params.queue_high.max(1));
        let (bulk_tx, bulk_rx) = mpsc::channel(params.queue_bulk.max(1));
        let (closing, _) = watch::channel(false);
        Arc::new(Self {
            id: params.id,
            direction: params.direction,
            remote_addr: params.remote_addr,
            root_url: params.root_url,
            telemetry_id: params.telemetry_id,
            instance_name: params.instance_name,
            prio_challenge: params.prio_challenge,
            high_tx,
            bulk_tx,
            queues: Mutex::new(Some((high_rx, bulk_rx))),
            closing,
            last_send: AtomicU64::new(0),
            intermittent_enqueue: AtomicU64::new(0),
            high_full_since: AtomicU64::new(0),
            prio: Mutex::new(PeerPrio::default()),
            outgoing_filter: params.outgoing_filter,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// A peer with no connection, for exercising handlers in isolation.
    #[cfg(test)]
    pub(crate) fn detached(remote_addr: &str) -> Arc<Self> {
        Self::new(PeerParams {
            id: 0,
            direction: Direction::Inbound,
            remote_addr: remote_addr.to_string(),
            root_url: None,
            queue_high: 1,
            queue_bulk: 1,
            telemetry_id: String::new(),
            instance_name: String::new(),
            prio_challenge: None,
            outgoing_filter: None,
        })
    }

    /// Spawn the read and write loops over the two connection halves.
    pub(crate) fn start(
        self: &Arc<Self>,
        source: Box<dyn MessageSource>,
        sink: Box<dyn MessageSink>,
        ctx: Arc<PeerContext>,
    ) {
        let Some((high, bulk)) = self.queues.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            warn!(peer = %self, "peer started twice");
            return;
        };
        let writer = tokio::spawn(self.clone().write_loop(sink, high, bulk, ctx.clone()));
        let reader = tokio::spawn(self.clone().read_loop(source, ctx));
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend([writer, reader]);
    }

    pub(crate) fn take_tasks(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()))
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    #[inline]
    pub fn id(&self) -> PeerId {
        self.id
    }

    #[inline]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    #[inline]
    pub fn is_outgoing(&self) -> bool {
        self.direction == Direction::Outbound
    }

    /// Gossip URL we dialed, or the address an inbound peer claimed.
    pub fn root_url(&self) -> Option<&str> {
        self.root_url.as_deref()
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    /// Best address for this peer: `root_url`, else the remote address.
    pub fn address(&self) -> &str {
        self.root_url.as_deref().unwrap_or(&self.remote_addr)
    }

    pub fn telemetry_id(&self) -> &str {
        &self.telemetry_id
    }

    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    pub(crate) fn prio_challenge(&self) -> Option<&str> {
        self.prio_challenge.as_deref()
    }

    pub fn prio_address(&self) -> Option<Identity> {
        self.prio.lock().unwrap_or_else(|e| e.into_inner()).address
    }

    pub fn prio_weight(&self) -> u64 {
        self.prio.lock().unwrap_or_else(|e| e.into_inner()).weight
    }

    pub(crate) fn set_prio(&self, address: Identity, weight: u64) {
        *self.prio.lock().unwrap_or_else(|e| e.into_inner()) = PeerPrio {
            address: Some(address),
            weight,
        };
    }

    pub(crate) fn reset_prio_weight(&self) {
        self.prio.lock().unwrap_or_else(|e| e.into_inner()).weight = 0;
    }

    /// Time of the last successful write, if any.
    pub fn last_activity(&self) -> Option<SystemTime> {
        match self.last_send.load(Ordering::Relaxed) {
            0 => None,
            n => Some(from_unix_nanos(n)),
        }
    }

    // ========================================================================
    // Sending and Closing
    // ========================================================================

    /// Queue a message without blocking.
    pub fn send(
        &self,
        tag: Tag,
        data: impl Into<Arc<[u8]>>,
        priority: SendPriority,
    ) -> Result<(), NetworkError> {
        self.enqueue(
            SendMessage {
                tag,
                data: data.into(),
                enqueued_at: SystemTime::now(),
                digest: None,
            },
            priority,
        )
    }

    pub(crate) fn enqueue(&self, msg: SendMessage, priority: SendPriority) -> Result<(), NetworkError> {
        if self.is_closed() {
            return Err(NetworkError::Closed);
        }
        let tx = match priority {
            SendPriority::High => &self.high_tx,
            SendPriority::Bulk => &self.bulk_tx,
        };
        match tx.try_send(msg) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                if priority == SendPriority::High {
                    let now = unix_nanos(SystemTime::now());
                    let _ = self.high_full_since.compare_exchange(
                        0,
                        now,
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    );
                }
                Err(NetworkError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(NetworkError::Closed),
        }
    }

    /// Signal both loops to stop. Returns true for the call that actually
    /// closed the peer.
    pub fn close(&self) -> bool {
        let was_closed = self.closing.send_replace(true);
        if !was_closed {
            debug!(peer = %self, "closing peer");
        }
        !was_closed
    }

    pub fn is_closed(&self) -> bool {
        *self.closing.borrow()
    }

    /// Resolves once the peer is closed.
    pub async fn closed(&self) {
        let mut rx = self.closing.subscribe();
        let _ = rx.wait_for(|c| *c).await;
    }

    /// Whether the writer has fallen behind by more than `max`.
    pub fn check_slow_writing(&self, now: SystemTime, max: Duration) -> bool {
        older_than(self.intermittent_enqueue.load(Ordering::Relaxed), now, max)
            || older_than(self.high_full_since.load(Ordering::Relaxed), now, max)
    }

    // ========================================================================
    // Loops
    // ========================================================================

    async fn write_loop(
        self: Arc<Self>,
        mut sink: Box<dyn MessageSink>,
        mut high: mpsc::Receiver<SendMessage>,
        mut bulk: mpsc::Receiver<SendMessage>,
        ctx: Arc<PeerContext>,
    ) {
        let mut closing = self.closing.subscribe();
        loop {
            let msg = match high.try_recv() {
                Ok(msg) => msg,
                Err(_) => {
                    tokio::select! {
                        biased;
                        _ = closing.wait_for(|c| *c) => break,
                        Some(msg) = high.recv() => msg,
                        Some(msg) = bulk.recv() => msg,
                        else => break,
                    }
                }
            };

            let now = SystemTime::now();
            if is_stale(msg.enqueued_at, now, ctx.max_message_queue_duration) {
                NetworkMetrics::incr(&ctx.metrics.stale_messages_dropped);
                trace!(peer = %self, tag = %msg.tag, "dropping stale message");
                continue;
            }
            if let Some(filter) = &self.outgoing_filter
                && let Some(digest) = &msg.digest
                && filter.contains(digest)
            {
                NetworkMetrics::incr(&ctx.metrics.outgoing_messages_filtered);
                trace!(peer = %self, tag = %msg.tag, "peer already has message");
                continue;
            }

            self.intermittent_enqueue
                .store(unix_nanos(msg.enqueued_at), Ordering::Relaxed);
            let frame = encode_frame(msg.tag, &msg.data);
            let result = tokio::select! {
                biased;
                _ = closing.wait_for(|c| *c) => break,
                r = sink.send_message(&frame) => r,
            };
            self.intermittent_enqueue.store(0, Ordering::Relaxed);

            match result {
                Ok(()) => {
                    self.last_send
                        .store(unix_nanos(SystemTime::now()), Ordering::Relaxed);
                    self.high_full_since.store(0, Ordering::Relaxed);
                    NetworkMetrics::incr(&ctx.metrics.messages_sent);
                    NetworkMetrics::add(&ctx.metrics.bytes_sent, frame.len() as u64);
                }
                Err(e) => {
                    debug!(peer = %self, error = %e, "write failed");
                    ctx.remove(&self, "write error");
                    break;
                }
            }
        }
        self.close();
        let _ = tokio::time::timeout(SINK_CLOSE_TIMEOUT, sink.close()).await;
    }

    async fn read_loop(
        self: Arc<Self>,
        mut source: Box<dyn MessageSource>,
        ctx: Arc<PeerContext>,
    ) {
        let mut closing = self.closing.subscribe();
        loop {
            let frame = tokio::select! {
                biased;
                _ = closing.wait_for(|c| *c) => return,
                r = source.recv_message() => r,
            };
            let frame = match frame {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    debug!(peer = %self, "connection closed by remote");
                    ctx.remove(&self, "eof");
                    return;
                }
                Err(e) => {
                    debug!(peer = %self, error = %e, "read failed");
                    ctx.remove(&self, "read error");
                    return;
                }
            };
            NetworkMetrics::incr(&ctx.metrics.messages_received);
            NetworkMetrics::add(&ctx.metrics.bytes_received, frame.len() as u64);

            let Ok((tag, payload)) = decode_frame(&frame) else {
                warn!(peer = %self, "malformed frame");
                ctx.remove(&self, "malformed frame");
                return;
            };

            if tag == tags::MSG_DIGEST_SKIP {
                if let Some(filter) = &self.outgoing_filter
                    && let Ok(digest) = <Digest>::try_from(payload)
                {
                    filter.check_digest(&digest, true, true);
                }
                continue;
            }

            if is_dedup_safe(tag)
                && let Some(filter) = &ctx.incoming_filter
                && filter.check_incoming_message(tag, payload, true, true)
            {
                NetworkMetrics::incr(&ctx.metrics.duplicate_messages_received);
                trace!(peer = %self, tag = %tag, "duplicate message");
                continue;
            }

            let msg = IncomingMessage {
                sender: self.clone(),
                tag,
                data: Arc::from(payload),
                received_at: SystemTime::now(),
            };
            tokio::select! {
                biased;
                _ = closing.wait_for(|c| *c) => return,
                r = ctx.incoming.send(msg) => {
                    if r.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.address(), self.id)
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("address", &self.address())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::message_digest;
    use crate::transport::Connection;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    #[derive(Default)]
    struct RecordingRegistry {
        removed: Mutex<Vec<(PeerId, &'static str)>>,
    }

    impl PeerRegistry for RecordingRegistry {
        fn remove_peer(&self, peer: &Arc<Peer>, reason: &'static str) {
            peer.close();
            self.removed
                .lock()
                .unwrap()
                .push((peer.id(), reason));
        }
    }

    struct Harness {
        peer: Arc<Peer>,
        remote: Connection,
        incoming: mpsc::Receiver<IncomingMessage>,
        registry: Arc<RecordingRegistry>,
        metrics: Arc<NetworkMetrics>,
    }

    fn peer_params(outgoing_filter: bool) -> PeerParams {
        PeerParams {
            id: 7,
            direction: Direction::Outbound,
            remote_addr: "remote:1".into(),
            root_url: Some("ws://remote:1/v1/g/gossip".into()),
            queue_high: 16,
            queue_bulk: 16,
            telemetry_id: "tel".into(),
            instance_name: "inst".into(),
            prio_challenge: None,
            outgoing_filter: outgoing_filter.then(|| MessageFilter::new(3, 128)),
        }
    }

    fn harness(peer: Arc<Peer>, max_age: Duration, start: bool) -> Harness {
        let (local, remote) = Connection::memory_pair(64 * 1024, 1 << 20, "local:1", "remote:1");
        let (incoming_tx, incoming) = mpsc::channel(16);
        let registry = Arc::new(RecordingRegistry::default());
        let metrics = Arc::new(NetworkMetrics::new());
        let weak: Weak<dyn PeerRegistry> = Arc::downgrade(&(registry.clone() as Arc<dyn PeerRegistry>));
        let ctx = Arc::new(PeerContext {
            incoming: incoming_tx,
            incoming_filter: Some(Arc::new(MessageFilter::new(5, 512))),
            metrics: metrics.clone(),
            registry: weak,
            max_message_queue_duration: max_age,
        });
        if start {
            let (source, sink, _) = local.into_split();
            peer.start(source, sink, ctx);
        } else {
            drop(local);
        }
        Harness {
            peer,
            remote,
            incoming,
            registry,
            metrics,
        }
    }

    async fn recv_tag(conn: &mut Connection) -> (Tag, Vec<u8>) {
        let frame = timeout(WAIT, conn.recv_message())
            .await
            .expect("timed out")
            .expect("read failed")
            .expect("eof");
        let (tag, payload) = decode_frame(&frame).unwrap();
        (tag, payload.to_vec())
    }

    #[tokio::test]
    async fn high_priority_drains_before_bulk() {
        let peer = Peer::new(peer_params(false));
        for i in 0..3u8 {
            peer.send(tags::TXN, vec![i], SendPriority::Bulk).unwrap();
        }
        for i in 0..3u8 {
            peer.send(tags::AGREEMENT_VOTE, vec![i], SendPriority::High).unwrap();
        }
        let mut h = harness(peer, Duration::from_secs(60), true);

        let mut order = Vec::new();
        for _ in 0..6 {
            order.push(recv_tag(&mut h.remote).await.0);
        }
        assert_eq!(&order[..3], &[tags::AGREEMENT_VOTE; 3]);
        assert_eq!(&order[3..], &[tags::TXN; 3]);
        assert!(h.peer.last_activity().is_some());
    }

    #[tokio::test]
    async fn stale_messages_are_dropped() {
        let peer = Peer::new(peer_params(false));
        let old = SendMessage {
            tag: tags::TXN,
            data: Arc::from(&b"old"[..]),
            enqueued_at: SystemTime::now() - Duration::from_secs(3600),
            digest: None,
        };
        peer.enqueue(old, SendPriority::Bulk).unwrap();
        peer.send(tags::TXN, &b"fresh"[..], SendPriority::Bulk).unwrap();
        let mut h = harness(peer, Duration::from_secs(60), true);

        let (_, payload) = recv_tag(&mut h.remote).await;
        assert_eq!(payload, b"fresh");
        assert_eq!(h.metrics.snapshot().stale_messages_dropped, 1);
    }

    #[tokio::test]
    async fn digest_skip_suppresses_large_message() {
        let peer = Peer::new(peer_params(true));
        let mut h = harness(peer, Duration::from_secs(60), true);

        let big = vec![9u8; 6000];
        let digest = message_digest(tags::TXN, &big);
        h.remote
            .send_message(&encode_frame(tags::MSG_DIGEST_SKIP, &digest))
            .await
            .unwrap();
        // The digest is applied by the read loop; wait until it lands.
        timeout(WAIT, async {
            while !h.peer.outgoing_filter.as_ref().unwrap().contains(&digest) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let skipped = SendMessage {
            tag: tags::TXN,
            data: Arc::from(big),
            enqueued_at: SystemTime::now(),
            digest: Some(digest),
        };
        h.peer.enqueue(skipped, SendPriority::Bulk).unwrap();
        h.peer.send(tags::TXN, &b"small"[..], SendPriority::Bulk).unwrap();

        let (_, payload) = recv_tag(&mut h.remote).await;
        assert_eq!(payload, b"small");
        assert_eq!(h.metrics.snapshot().outgoing_messages_filtered, 1);
        // MS is consumed by the peer, never forwarded to handlers.
        assert!(h.incoming.try_recv().is_err());
    }

    #[tokio::test]
    async fn inbound_duplicates_are_filtered() {
        let peer = Peer::new(peer_params(false));
        let mut h = harness(peer, Duration::from_secs(60), true);

        for _ in 0..3 {
            h.remote
                .send_message(&encode_frame(tags::AGREEMENT_VOTE, b"vote"))
                .await
                .unwrap();
        }
        h.remote
            .send_message(&encode_frame(tags::TXN, b"tx"))
            .await
            .unwrap();

        let first = timeout(WAIT, h.incoming.recv()).await.unwrap().unwrap();
        assert_eq!(first.tag, tags::AGREEMENT_VOTE);
        assert_eq!(first.sender.id(), 7);
        let second = timeout(WAIT, h.incoming.recv()).await.unwrap().unwrap();
        assert_eq!(second.tag, tags::TXN);
        assert_eq!(h.metrics.snapshot().duplicate_messages_received, 2);
    }

    #[tokio::test]
    async fn remote_eof_reports_removal() {
        let peer = Peer::new(peer_params(false));
        let mut h = harness(peer, Duration::from_secs(60), true);
        h.remote.close().await.unwrap();

        timeout(WAIT, h.peer.closed()).await.unwrap();
        let removed = h.registry.removed.lock().unwrap().clone();
        assert_eq!(removed.first(), Some(&(7, "eof")));
    }

    #[tokio::test]
    async fn send_reports_full_and_closed() {
        let mut params = peer_params(false);
        params.queue_bulk = 1;
        let peer = Peer::new(params);
        let _h = harness(peer.clone(), Duration::from_secs(60), false);

        peer.send(tags::TXN, &b"a"[..], SendPriority::Bulk).unwrap();
        assert_eq!(
            peer.send(tags::TXN, &b"b"[..], SendPriority::Bulk),
            Err(NetworkError::QueueFull)
        );
        assert!(peer.close());
        assert!(!peer.close());
        assert_eq!(
            peer.send(tags::TXN, &b"c"[..], SendPriority::Bulk),
            Err(NetworkError::Closed)
        );
    }

    #[test]
    fn slow_writing_detection() {
        let peer = Peer::new(peer_params(false));
        let now = SystemTime::now();
        let max = Duration::from_secs(25);
        assert!(!peer.check_slow_writing(now, max));

        peer.intermittent_enqueue
            .store(unix_nanos(now - Duration::from_secs(10)), Ordering::Relaxed);
        assert!(!peer.check_slow_writing(now, max));

        peer.intermittent_enqueue
            .store(unix_nanos(now - Duration::from_secs(30)), Ordering::Relaxed);
        assert!(peer.check_slow_writing(now, max));

        peer.intermittent_enqueue.store(0, Ordering::Relaxed);
        peer.high_full_since
            .store(unix_nanos(now - Duration::from_secs(30)), Ordering::Relaxed);
        assert!(peer.check_slow_writing(now, max));
    }

    #[test]
    fn priority_classification() {
        assert_eq!(SendPriority::for_tag(tags::AGREEMENT_VOTE), SendPriority::High);
        assert_eq!(SendPriority::for_tag(tags::MSG_DIGEST_SKIP), SendPriority::High);
        assert_eq!(SendPriority::for_tag(tags::TXN), SendPriority::Bulk);
    }
}
