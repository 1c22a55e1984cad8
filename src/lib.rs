//! # Meshcast - Gossip Broadcast Network
//!
//! Meshcast connects a node to a mesh of peers and spreads tagged messages
//! through it:
//!
//! - **Broadcast**: every message goes to every peer, via bounded queues split
//!   into high-priority and bulk traffic
//! - **Relay**: handlers decide per message whether to forward, ignore or
//!   disconnect the sender
//! - **Deduplication**: an inbound filter drops repeated votes and proposals,
//!   and digest-skip announcements stop large messages from being sent to a
//!   peer that already has them
//! - **Mesh maintenance**: outbound connections are kept at the configured
//!   fanout from a pluggable phonebook, with backoff on failed addresses
//! - **Priority**: inbound peers can prove a weighted identity that decides
//!   who keeps a slot when connections are scarce
//!
//! ## Architecture
//!
//! [`Network`] is a cheap-to-clone handle over shared node state. Each peer
//! owns a read task and a write task; the node runs dispatchers, a reader
//! worker pool, a mesh task and a slow-peer monitor. Peers report failures
//! back to the node, which is the only place peers are removed.
//!
//! ## Security Model
//!
//! - Handshakes are size- and time-bounded and checked for genesis id,
//!   protocol version and self-connection before a peer exists
//! - Inbound connections are limited in total and per IP
//! - Every queue is bounded; full queues drop instead of blocking
//! - Peers that stop reading are evicted by the monitor
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `network` | Node handle, handshake, broadcast dispatch, mesh and monitor |
//! | `peer` | Per-connection queues and read/write loops |
//! | `multiplexer` | Tag to handler routing and forwarding policy |
//! | `filter` | Rotating digest sets for duplicate suppression |
//! | `priority` | Challenge-response priority scheme and tracker |
//! | `phonebook` | Static, combined and DNS-backed address sources |
//! | `transport` | Framed connections over TCP and in-memory pipes |
//! | `protocol` | Tags, frames, handshake types, gossip URLs |
//! | `identity` | Ed25519 keypairs and domain-separated signatures |
//! | `config` | Node configuration and defaults |
//! | `metrics` | Per-node counters |

pub mod config;
pub mod filter;
pub mod identity;
pub mod metrics;
pub mod multiplexer;
pub mod network;
pub mod peer;
pub mod phonebook;
pub mod priority;
pub mod protocol;
pub mod transport;

pub use config::NetworkConfig;
pub use identity::{Identity, Keypair};
pub use metrics::{MetricsSnapshot, NetworkMetrics};
pub use multiplexer::{ForwardingPolicy, IncomingMessage, MessageHandler, TaggedMessageHandler};
pub use network::{
    KnownPeer, Network, NetworkBuilder, NetworkError, PeerOption, RejectReason,
};
pub use peer::{Direction, Peer, PeerId, SendPriority};
pub use phonebook::{DnsPhonebook, MultiPhonebook, Phonebook, StaticPhonebook};
pub use priority::{Ed25519PrioScheme, PrioScheme};
pub use protocol::{Tag, tags};
