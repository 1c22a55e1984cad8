//! # Network Configuration
//!
//! [`NetworkConfig`] gathers every tunable of a gossip node. Defaults are
//! exposed as `DEFAULT_*` constants so that callers (and tests) can derive
//! related values from them.

use std::time::Duration;

use anyhow::{Result, bail};

use crate::protocol::MAX_MESSAGE_SIZE;

// ============================================================================
// Mesh and Workers
// ============================================================================

/// Target number of outbound connections.
pub const DEFAULT_GOSSIP_FANOUT: usize = 4;

/// Number of reader workers draining the shared inbound buffer.
pub const DEFAULT_INCOMING_THREADS: usize = 20;

/// Capacity of the shared inbound buffer.
pub const DEFAULT_INCOMING_BUFFER_SIZE: usize = 2048;

/// Interval between mesh maintenance rounds.
pub const DEFAULT_MESH_INTERVAL: Duration = Duration::from_secs(60);

/// Delay after which `ready()` resolves even without full fanout.
pub const DEFAULT_EVENTUAL_READY_DELAY: Duration = Duration::from_secs(6);

/// Time to establish a TCP connection to a candidate.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Time allowed for the handshake exchange in either direction.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a failed address is skipped by mesh maintenance.
pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_secs(10);

// ============================================================================
// Queues and Slow Peers
// ============================================================================

/// Node-level high-priority broadcast queue capacity.
pub const DEFAULT_BROADCAST_QUEUE_HIGH: usize = 1000;

/// Node-level bulk broadcast queue capacity.
pub const DEFAULT_BROADCAST_QUEUE_BULK: usize = 100;

/// Per-peer queue capacity, applied to both the high and bulk queues.
pub const DEFAULT_PEER_QUEUE_SIZE: usize = 64;

/// Messages older than this are dropped instead of sent, and a writer stuck
/// on a message this old is considered slow.
pub const DEFAULT_MAX_MESSAGE_QUEUE_DURATION: Duration = Duration::from_secs(25);

/// Interval between slow-writer checks.
pub const DEFAULT_SLOW_WRITING_PEER_MONITOR_INTERVAL: Duration = Duration::from_secs(5);

// ============================================================================
// Connection Limits
// ============================================================================

/// Inbound connections accepted from a single IP.
/// SECURITY: bounds how many slots one host can occupy.
pub const DEFAULT_MAX_CONNECTIONS_PER_IP: usize = 30;

// ============================================================================
// Deduplication Filters
// ============================================================================

pub const DEFAULT_INCOMING_MESSAGE_FILTER_BUCKET_COUNT: usize = 5;
pub const DEFAULT_INCOMING_MESSAGE_FILTER_BUCKET_SIZE: usize = 512;
pub const DEFAULT_OUTGOING_MESSAGE_FILTER_BUCKET_COUNT: usize = 3;
pub const DEFAULT_OUTGOING_MESSAGE_FILTER_BUCKET_SIZE: usize = 128;

#[derive(Clone, Debug)]
pub struct NetworkConfig {
    // ========================================================================
    // Identity and Addresses
    // ========================================================================
    /// Address to listen on (`host:port`). `None` makes this a client-only
    /// node that does not accept connections and does not relay.
    pub listen_address: Option<String>,
    /// Public address announced in the handshake. Falls back to the bound
    /// listen address.
    pub public_address: Option<String>,
    pub telemetry_id: String,
    pub instance_name: String,

    // ========================================================================
    // Mesh
    // ========================================================================
    pub gossip_fanout: usize,
    pub mesh_interval: Duration,
    pub eventual_ready_delay: Duration,
    pub dial_timeout: Duration,
    pub handshake_timeout: Duration,
    pub reconnect_backoff: Duration,
    /// Relay messages even without a listen address.
    pub force_relay_messages: bool,

    // ========================================================================
    // Workers and Queues
    // ========================================================================
    pub incoming_threads: usize,
    pub incoming_buffer_size: usize,
    pub broadcast_queue_high: usize,
    pub broadcast_queue_bulk: usize,
    pub peer_queue_high: usize,
    pub peer_queue_bulk: usize,
    pub max_message_queue_duration: Duration,
    pub slow_writing_peer_monitor_interval: Duration,
    pub max_message_size: usize,

    // ========================================================================
    // Limits
    // ========================================================================
    /// Reject inbound connections beyond this count.
    pub incoming_connections_limit: Option<usize>,
    pub max_connections_per_ip: usize,
    /// With a priority scheme, only the top-N peers by weight receive
    /// broadcasts.
    pub broadcast_connections_limit: Option<usize>,
    /// Inbound peers kept at most; the lowest-weight ones are closed first.
    pub connection_budget: Option<usize>,
    /// Header carrying the real client IP when behind a trusted proxy.
    pub use_x_forwarded_for_address_field: Option<String>,

    // ========================================================================
    // Filters
    // ========================================================================
    pub enable_incoming_message_filter: bool,
    pub incoming_message_filter_bucket_count: usize,
    pub incoming_message_filter_bucket_size: usize,
    /// Rotate inbound filter buckets on this timer as well as when full.
    pub incoming_message_filter_rotation_interval: Option<Duration>,
    pub enable_outgoing_message_filter: bool,
    pub outgoing_message_filter_bucket_count: usize,
    pub outgoing_message_filter_bucket_size: usize,
    pub outgoing_message_filter_rotation_interval: Option<Duration>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_address: None,
            public_address: None,
            telemetry_id: String::new(),
            instance_name: String::new(),

            gossip_fanout: DEFAULT_GOSSIP_FANOUT,
            mesh_interval: DEFAULT_MESH_INTERVAL,
            eventual_ready_delay: DEFAULT_EVENTUAL_READY_DELAY,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
            force_relay_messages: false,

            incoming_threads: DEFAULT_INCOMING_THREADS,
            incoming_buffer_size: DEFAULT_INCOMING_BUFFER_SIZE,
            broadcast_queue_high: DEFAULT_BROADCAST_QUEUE_HIGH,
            broadcast_queue_bulk: DEFAULT_BROADCAST_QUEUE_BULK,
            peer_queue_high: DEFAULT_PEER_QUEUE_SIZE,
            peer_queue_bulk: DEFAULT_PEER_QUEUE_SIZE,
            max_message_queue_duration: DEFAULT_MAX_MESSAGE_QUEUE_DURATION,
            slow_writing_peer_monitor_interval: DEFAULT_SLOW_WRITING_PEER_MONITOR_INTERVAL,
            max_message_size: MAX_MESSAGE_SIZE,

            incoming_connections_limit: None,
            max_connections_per_ip: DEFAULT_MAX_CONNECTIONS_PER_IP,
            broadcast_connections_limit: None,
            connection_budget: None,
            use_x_forwarded_for_address_field: None,

            enable_incoming_message_filter: true,
            incoming_message_filter_bucket_count: DEFAULT_INCOMING_MESSAGE_FILTER_BUCKET_COUNT,
            incoming_message_filter_bucket_size: DEFAULT_INCOMING_MESSAGE_FILTER_BUCKET_SIZE,
            incoming_message_filter_rotation_interval: None,
            enable_outgoing_message_filter: true,
            outgoing_message_filter_bucket_count: DEFAULT_OUTGOING_MESSAGE_FILTER_BUCKET_COUNT,
            outgoing_message_filter_bucket_size: DEFAULT_OUTGOING_MESSAGE_FILTER_BUCKET_SIZE,
            outgoing_message_filter_rotation_interval: None,
        }
    }
}

impl NetworkConfig {
    /// Whether `relay()` forwards anything.
    pub fn relay_messages(&self) -> bool {
        self.listen_address.is_some() || self.force_relay_messages
    }

    /// Reject configurations that would deadlock or never make progress.
    pub fn validate(&self) -> Result<()> {
        if self.incoming_threads == 0 {
            bail!("incoming_threads must be at least 1");
        }
        if self.incoming_buffer_size == 0 {
            bail!("incoming_buffer_size must be at least 1");
        }
        if self.broadcast_queue_high == 0 || self.broadcast_queue_bulk == 0 {
            bail!("broadcast queues must have non-zero capacity");
        }
        if self.peer_queue_high == 0 || self.peer_queue_bulk == 0 {
            bail!("peer queues must have non-zero capacity");
        }
        if self.mesh_interval.is_zero() || self.slow_writing_peer_monitor_interval.is_zero() {
            bail!("periodic intervals must be non-zero");
        }
        if self.incoming_message_filter_rotation_interval.is_some_and(|i| i.is_zero())
            || self.outgoing_message_filter_rotation_interval.is_some_and(|i| i.is_zero())
        {
            bail!("filter rotation intervals must be non-zero");
        }
        if self.max_message_size < 2 || self.max_message_size > u32::MAX as usize {
            bail!("max_message_size {} out of range", self.max_message_size);
        }
        Ok(())
    }
}
