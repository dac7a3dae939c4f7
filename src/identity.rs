//! Peer identity and codec: key derivation, node addresses, and message
//! signatures.
//!
//! Every node is identified by a 160-bit [`PeerKey`], the SHA-1 digest of its
//! Ed25519 public key. Keys order the overlay through the XOR metric
//! ([`xor_distance`]) and partition the routing table through the highest
//! differing bit ([`bucket_index`]).
//!
//! Messages are authenticated with a 96-byte *peer signature*: the sender's
//! 32-byte public key followed by an Ed25519 signature over the SHA-256
//! digest of the message body. [`seal_payload`] produces the full
//! `[public key ‖ signature ‖ body]` payload and [`recover_peer_key`]
//! verifies one and yields the sender's peer key.

use std::net::Ipv4Addr;

use anyhow::{Context, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha1::Sha1;
use sha2::{Digest, Sha256};

/// Size of a peer key in bytes (SHA-1 digest).
pub const PEER_KEY_LEN: usize = 20;

/// Size of an Ed25519 public key in bytes.
pub const PUBLIC_KEY_LEN: usize = 32;

/// Size of an Ed25519 signature in bytes.
pub const SIGNATURE_LEN: usize = 64;

/// Size of a full peer signature: `[public key ‖ signature]`.
pub const PEER_SIGNATURE_LEN: usize = PUBLIC_KEY_LEN + SIGNATURE_LEN;

/// A 160-bit identifier for overlay peers.
///
/// Peer keys are the SHA-1 digest of the peer's Ed25519 public key, giving a
/// uniform spread across the identifier space. SHA-1 is used purely as an
/// identifier derivation; authenticity comes from the Ed25519 signatures.
pub type PeerKey = [u8; PEER_KEY_LEN];

/// Derive a peer key from an Ed25519 public key.
pub fn peer_key(public_key: &VerifyingKey) -> PeerKey {
    sha1_digest(public_key.as_bytes())
}

fn sha1_digest(data: &[u8]) -> PeerKey {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Compute the SHA-256 digest that message signatures are taken over.
pub fn body_digest(body: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(body);
    hasher.finalize().into()
}

// ============================================================================
// Distance Metric
// ============================================================================

/// Compute the XOR distance between two peer keys.
///
/// The result is a 20-byte big-endian unsigned value; compare two distances
/// with the array's lexicographic ordering. `xor_distance(a, a)` is all
/// zeroes and the metric is symmetric.
pub fn xor_distance(a: &PeerKey, b: &PeerKey) -> [u8; PEER_KEY_LEN] {
    let mut out = [0u8; PEER_KEY_LEN];
    for i in 0..PEER_KEY_LEN {
        out[i] = a[i] ^ b[i];
    }
    out
}

/// Find the routing bucket for a key relative to the locus key.
///
/// The bucket index is the position of the highest set bit of
/// `key XOR locus`, counted from the least significant bit (0..=159), so the
/// most distant keys land in bucket 159. A zero distance maps to bucket 0;
/// callers exclude the locus key itself before indexing.
pub fn bucket_index(locus: &PeerKey, key: &PeerKey) -> usize {
    let dist = xor_distance(locus, key);
    for (byte_idx, byte) in dist.iter().enumerate() {
        if *byte != 0 {
            let highest = 7 - byte.leading_zeros() as usize;
            return (PEER_KEY_LEN - 1 - byte_idx) * 8 + highest;
        }
    }
    0
}

// ============================================================================
// Node Address Codec
// ============================================================================

/// Format peer details as a `node://` address.
///
/// ```
/// use std::net::Ipv4Addr;
///
/// let key = [0u8; 20];
/// let addr = meshkad::format_node_address(&key, Ipv4Addr::new(10, 0, 0, 1), 4000);
/// assert_eq!(
///     addr,
///     "node://0000000000000000000000000000000000000000@10.0.0.1:4000"
/// );
/// ```
pub fn format_node_address(key: &PeerKey, ip: Ipv4Addr, port: u16) -> String {
    format!("node://{}@{}:{}", hex::encode(key), ip, port)
}

/// Parse a `node://` address into `(peer key, IPv4 address, port)`.
///
/// Fails on a malformed scheme, non-hex or odd-length key, a key that is not
/// 20 bytes, an invalid dotted-quad address, or an out-of-range port.
pub fn parse_node_address(address: &str) -> Result<(PeerKey, Ipv4Addr, u16)> {
    let rest = address
        .strip_prefix("node://")
        .context("invalid node address")?;
    let (key_part, host_part) = rest.split_once('@').context("invalid node address")?;
    let (ip_part, port_part) = host_part.rsplit_once(':').context("invalid node address")?;

    let key_bytes = hex::decode(key_part).context("invalid peer key encoding")?;
    let key: PeerKey = key_bytes
        .as_slice()
        .try_into()
        .ok()
        .context("invalid peer key")?;

    let ip: Ipv4Addr = ip_part.parse().context("invalid ip4 address")?;
    let port: u16 = port_part.parse().context("invalid port")?;

    Ok((key, ip, port))
}

// ============================================================================
// Peer Signatures
// ============================================================================

/// Error type for peer signature verification failures.
///
/// The `Display` text of [`SignatureError::VerificationFailed`] is the
/// wire-visible rejection reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// The peer signature is not exactly 96 bytes.
    InvalidLength,
    /// The leading 32 bytes are not a valid Ed25519 point.
    InvalidPublicKey,
    /// Cryptographic verification failed.
    VerificationFailed,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::InvalidLength => write!(f, "invalid peer signature length"),
            SignatureError::InvalidPublicKey => write!(f, "invalid peer public key"),
            SignatureError::VerificationFailed => write!(f, "invalid peer signature"),
        }
    }
}

impl std::error::Error for SignatureError {}

/// Assemble a signed payload: `[public key ‖ signature of SHA-256(body) ‖ body]`.
pub fn seal_payload(key: &SigningKey, body: &[u8]) -> Vec<u8> {
    let digest = body_digest(body);
    let signature = key.sign(&digest);

    let mut payload = Vec::with_capacity(PEER_SIGNATURE_LEN + body.len());
    payload.extend_from_slice(key.verifying_key().as_bytes());
    payload.extend_from_slice(&signature.to_bytes());
    payload.extend_from_slice(body);
    payload
}

/// Verify a 96-byte peer signature over a body digest and recover the
/// sender's peer key.
///
/// Succeeds only if the signature has the exact length, the embedded public
/// key is a valid Ed25519 point, and the signature verifies over `digest`.
/// The recovered key is the SHA-1 digest of the embedded public key.
pub fn recover_peer_key(signature: &[u8], digest: &[u8]) -> Result<PeerKey, SignatureError> {
    if signature.len() != PEER_SIGNATURE_LEN {
        return Err(SignatureError::InvalidLength);
    }

    let public: [u8; PUBLIC_KEY_LEN] = signature[..PUBLIC_KEY_LEN]
        .try_into()
        .map_err(|_| SignatureError::InvalidLength)?;
    let sig: [u8; SIGNATURE_LEN] = signature[PUBLIC_KEY_LEN..]
        .try_into()
        .map_err(|_| SignatureError::InvalidLength)?;

    let verifying = VerifyingKey::from_bytes(&public)
        .map_err(|_| SignatureError::InvalidPublicKey)?;
    verifying
        .verify(digest, &Signature::from_bytes(&sig))
        .map_err(|_| SignatureError::VerificationFailed)?;

    Ok(sha1_digest(&public))
}
