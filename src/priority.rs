//! # Peer Priority
//!
//! Lets an accepting node learn which weighted participant is behind an
//! inbound connection, so it can favour important peers when its
//! connection budget or broadcast fanout is limited.
//!
//! ## Exchange
//!
//! ```text
//! Dialer                                   Acceptor
//!   |  handshake request                       |
//!   |----------------------------------------->|
//!   |  handshake response + challenge          |  new_prio_challenge()
//!   |<-----------------------------------------|
//!   |  "NP" message                            |  make_prio_response()
//!   |----------------------------------------->|  verify_prio_response()
//!   |                                          |  get_prio_weight()
//! ```
//!
//! [`PrioTracker`] remembers which peer currently holds each priority
//! address. When a second connection proves the same address, the older
//! claim loses its weight so one identity cannot occupy several
//! high-priority slots.

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::identity::{
    Identity, Keypair, PRIORITY_SIGNATURE_DOMAIN, SignatureError, sign_with_domain,
    verify_with_domain,
};
use crate::peer::PeerId;
use crate::protocol::{deserialize_bounded, serialize_bounded};

/// Random bytes in a priority challenge.
pub const PRIO_CHALLENGE_BYTES: usize = 32;

/// A priority address. With [`Ed25519PrioScheme`] this is a public key.
pub type PrioAddress = Identity;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrioError {
    Malformed,
    ChallengeMismatch,
    Signature(SignatureError),
}

impl fmt::Display for PrioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrioError::Malformed => write!(f, "malformed priority response"),
            PrioError::ChallengeMismatch => write!(f, "response answers a different challenge"),
            PrioError::Signature(e) => write!(f, "priority response signature: {e}"),
        }
    }
}

impl std::error::Error for PrioError {}

pub trait PrioScheme: Send + Sync {
    fn new_prio_challenge(&self) -> String;
    /// `None` if this node has nothing to prove.
    fn make_prio_response(&self, challenge: &str) -> Option<Vec<u8>>;
    fn verify_prio_response(&self, challenge: &str, response: &[u8]) -> Result<PrioAddress, PrioError>;
    fn get_prio_weight(&self, addr: &PrioAddress) -> u64;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrioResponse {
    pub nonce: String,
    pub sender: Identity,
    pub signature: Vec<u8>,
}

/// Challenge-response priority scheme signed with an Ed25519 key. Weights
/// are looked up in a table; unknown addresses get `default_weight`.
pub struct Ed25519PrioScheme {
    keypair: Keypair,
    weights: RwLock<HashMap<PrioAddress, u64>>,
    default_weight: u64,
}

impl Ed25519PrioScheme {
    pub fn new(keypair: Keypair) -> Self {
        Self {
            keypair,
            weights: RwLock::new(HashMap::new()),
            default_weight: 0,
        }
    }

    pub fn with_default_weight(mut self, weight: u64) -> Self {
        self.default_weight = weight;
        self
    }

    pub fn set_weight(&self, addr: PrioAddress, weight: u64) {
        self.weights
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(addr, weight);
    }

    pub fn identity(&self) -> Identity {
        self.keypair.identity()
    }
}

impl PrioScheme for Ed25519PrioScheme {
    fn new_prio_challenge(&self) -> String {
        let mut bytes = [0u8; PRIO_CHALLENGE_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    fn make_prio_response(&self, challenge: &str) -> Option<Vec<u8>> {
        let response = PrioResponse {
            nonce: challenge.to_string(),
            sender: self.keypair.identity(),
            signature: sign_with_domain(&self.keypair, PRIORITY_SIGNATURE_DOMAIN, challenge.as_bytes()),
        };
        serialize_bounded(&response).ok()
    }

    fn verify_prio_response(&self, challenge: &str, response: &[u8]) -> Result<PrioAddress, PrioError> {
        let response: PrioResponse = deserialize_bounded(response).map_err(|_| PrioError::Malformed)?;
        if response.nonce != challenge {
            return Err(PrioError::ChallengeMismatch);
        }
        verify_with_domain(
            &response.sender,
            PRIORITY_SIGNATURE_DOMAIN,
            challenge.as_bytes(),
            &response.signature,
        )
        .map_err(PrioError::Signature)?;
        Ok(response.sender)
    }

    fn get_prio_weight(&self, addr: &PrioAddress) -> u64 {
        self.weights
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(addr)
            .copied()
            .unwrap_or(self.default_weight)
    }
}

/// Maps priority addresses to the peer currently holding them.
#[derive(Debug, Default)]
pub struct PrioTracker {
    by_addr: HashMap<PrioAddress, PeerId>,
}

impl PrioTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `peer` proved `addr`. Returns the peer that previously
    /// held the address, whose weight the caller must reset to zero.
    pub fn set_priority(&mut self, peer: PeerId, addr: PrioAddress) -> Option<PeerId> {
        match self.by_addr.insert(addr, peer) {
            Some(old) if old != peer => Some(old),
            _ => None,
        }
    }

    /// Forget `peer`'s claim, if it still holds `addr`.
    pub fn remove_peer(&mut self, peer: PeerId, addr: &PrioAddress) {
        if self.by_addr.get(addr) == Some(&peer) {
            self.by_addr.remove(addr);
        }
    }

    pub fn holder(&self, addr: &PrioAddress) -> Option<PeerId> {
        self.by_addr.get(addr).copied()
    }

    pub fn len(&self) -> usize {
        self.by_addr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_addr.is_empty()
    }
}
