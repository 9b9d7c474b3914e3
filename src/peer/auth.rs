//! Authenticity proofs exchanged during the worker handshake
//!
//! A proof is an HMAC-SHA256 over one handshake nonce and the two worker ids,
//! keyed by the link key the two workers share:
//!
//! ```text
//! proof = hex(HMAC-SHA256(key, nonce || claimed_id || audience_id))
//! ```
//!
//! The initiator proves itself over its own nonce, the acceptor answers over
//! that nonce plus a fresh challenge, and the initiator's acknowledge proves
//! itself again over the challenge. Which key a pair uses comes from
//! [`super::PeerDirectory::link_keys`].

use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use super::WorkerId;

type HmacSha256 = Hmac<Sha256>;

/// Length of authenticity data handed to admitted workers
pub const AUTHENTICITY_DATA_LEN: usize = 32;

const NONCE_LEN: usize = 16;
const PAIRWISE_LABEL: &[u8] = b"shoal-pairwise-key";

fn keyed(key: &[u8]) -> Option<HmacSha256> {
    // Empty keys would make every proof forgeable
    if key.is_empty() {
        return None;
    }
    HmacSha256::new_from_slice(key).ok()
}

fn proof_mac(key: &[u8], nonce: &str, claimed: WorkerId, audience: WorkerId) -> Option<HmacSha256> {
    let mut mac = keyed(key)?;
    mac.update(&(nonce.len() as u64).to_be_bytes());
    mac.update(nonce.as_bytes());
    mac.update(&claimed.to_be_bytes());
    mac.update(&audience.to_be_bytes());
    Some(mac)
}

/// Compute the proof that `claimed` holds `key`, addressed to `audience`.
///
/// Empty when `key` is empty; an empty proof never verifies.
pub fn authenticity_proof(key: &[u8], nonce: &str, claimed: WorkerId, audience: WorkerId) -> String {
    proof_mac(key, nonce, claimed, audience)
        .map(|mac| hex::encode(mac.finalize().into_bytes()))
        .unwrap_or_default()
}

/// Check a received proof against the expected key
pub fn verify_authenticity_proof(
    key: &[u8],
    nonce: &str,
    claimed: WorkerId,
    audience: WorkerId,
    proof: &str,
) -> bool {
    let Ok(tag) = hex::decode(proof) else {
        return false;
    };
    proof_mac(key, nonce, claimed, audience)
        .map(|mac| mac.verify_slice(&tag).is_ok())
        .unwrap_or(false)
}

/// Key a joined worker shares with `peer`, derived from the joiner's own secret.
///
/// The admitting member hands each existing member only its own pairwise key,
/// so holding one never lets a worker prove itself as another.
pub fn derive_pairwise_key(joiner_secret: &[u8], peer: WorkerId) -> Vec<u8> {
    match keyed(joiner_secret) {
        Some(mut mac) => {
            mac.update(PAIRWISE_LABEL);
            mac.update(&peer.to_be_bytes());
            mac.finalize().into_bytes().to_vec()
        }
        None => Vec::new(),
    }
}

/// Constant-time comparison of a presented join token with the configured one
pub fn join_token_matches(presented: &str, expected: &str) -> bool {
    !expected.is_empty() && bool::from(presented.as_bytes().ct_eq(expected.as_bytes()))
}

/// Fresh per-handshake nonce or challenge
pub fn new_nonce() -> String {
    let mut bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Authenticity data for a newly admitted worker
pub fn generate_authenticity_data() -> Vec<u8> {
    let mut data = vec![0u8; AUTHENTICITY_DATA_LEN];
    OsRng.fill_bytes(&mut data);
    data
}
