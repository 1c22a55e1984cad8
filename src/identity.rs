//! # Node Identities and Signatures
//!
//! Ed25519 keypairs and 32-byte identities used by the priority scheme.
//! A peer's priority address is its public key; priority responses are
//! signed with domain separation so a signature produced for one purpose
//! cannot be replayed for another.
//!
//! | Item | Purpose |
//! |------|---------|
//! | [`Keypair`] | Signing key held by a node |
//! | [`Identity`] | Public key, used as a priority address |
//! | [`sign_with_domain`] / [`verify_with_domain`] | Domain-separated signatures |

use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

/// Domain separation prefix for priority challenge responses.
pub const PRIORITY_SIGNATURE_DOMAIN: &[u8] = b"meshcast-prio-response-v1:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    Missing,
    InvalidLength,
    VerificationFailed,
    InvalidPublicKey,
}

impl fmt::Display for SignatureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignatureError::Missing => write!(f, "signature is missing"),
            SignatureError::InvalidLength => write!(f, "signature has invalid length"),
            SignatureError::VerificationFailed => write!(f, "signature verification failed"),
            SignatureError::InvalidPublicKey => write!(f, "invalid public key"),
        }
    }
}

impl std::error::Error for SignatureError {}

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn identity(&self) -> Identity {
        Identity::from_bytes(self.signing_key.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("identity", &self.identity())
            .finish_non_exhaustive()
    }
}

/// A 32-byte Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Identity([u8; 32]);

impl Identity {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", hex::encode(&self.0[..8]))
    }
}

/// Sign `data` with `domain` prepended.
///
/// Returns the 64-byte signature as a `Vec<u8>`.
pub fn sign_with_domain(keypair: &Keypair, domain: &[u8], data: &[u8]) -> Vec<u8> {
    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);
    keypair.sign(&prefixed).to_bytes().to_vec()
}

/// Verify a signature produced by [`sign_with_domain`].
pub fn verify_with_domain(
    identity: &Identity,
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }
    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| SignatureError::InvalidLength)?;

    let verifying_key = VerifyingKey::from_bytes(identity.as_bytes())
        .map_err(|_| SignatureError::InvalidPublicKey)?;
    let sig = Signature::from_bytes(&sig_bytes);

    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);

    verifying_key
        .verify_strict(&prefixed, &sig)
        .map_err(|_| SignatureError::VerificationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_round_trip() {
        let keypair = Keypair::generate();
        let sig = sign_with_domain(&keypair, PRIORITY_SIGNATURE_DOMAIN, b"challenge");
        assert_eq!(sig.len(), 64);
        assert!(
            verify_with_domain(&keypair.identity(), PRIORITY_SIGNATURE_DOMAIN, b"challenge", &sig)
                .is_ok()
        );
    }

    #[test]
    fn wrong_domain_is_rejected() {
        let keypair = Keypair::generate();
        let sig = sign_with_domain(&keypair, b"other-domain:", b"challenge");
        assert_eq!(
            verify_with_domain(&keypair.identity(), PRIORITY_SIGNATURE_DOMAIN, b"challenge", &sig),
            Err(SignatureError::VerificationFailed)
        );
    }

    #[test]
    fn malformed_signatures() {
        let identity = Keypair::generate().identity();
        assert_eq!(
            verify_with_domain(&identity, PRIORITY_SIGNATURE_DOMAIN, b"x", &[]),
            Err(SignatureError::Missing)
        );
        assert_eq!(
            verify_with_domain(&identity, PRIORITY_SIGNATURE_DOMAIN, b"x", &[1u8; 10]),
            Err(SignatureError::InvalidLength)
        );
    }

    #[test]
    fn identity_hex_round_trip() {
        let identity = Keypair::generate().identity();
        let parsed = Identity::from_hex(&identity.to_hex()).unwrap();
        assert_eq!(parsed, identity);
        assert!(Identity::default().is_zero());
        assert!(!identity.is_zero());
    }

    #[test]
    fn keypair_from_secret_is_deterministic() {
        let keypair = Keypair::generate();
        let restored = Keypair::from_secret_key_bytes(&keypair.secret_key_bytes());
        assert_eq!(restored.identity(), keypair.identity());
    }
}
