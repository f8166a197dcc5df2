// Signature stand-in: a keyed one-way MAC over the transaction digest.
//
// Real signatures (key generation, unforgeability) are out of scope. Every
// address has a deterministic, publicly-derivable key so any node can
// verify a sender's MAC without an out-of-band key exchange.
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Derives the MAC key for an address. Deterministic and public: the point
/// of this stand-in is structural (every tx is bound to its claimed sender),
/// not unforgeability.
fn key_material(address: &str) -> [u8; 32] {
    let mut hasher = <sha2::Sha256 as sha2::Digest>::new();
    sha2::Digest::update(&mut hasher, address.as_bytes());
    sha2::Digest::finalize(hasher).into()
}

/// Computes the MAC of `txid` under `sender`'s key material, as lowercase hex.
pub fn sign(sender: &str, txid_hex: &str) -> String {
    let key = key_material(sender);
    let mut mac = HmacSha256::new_from_slice(&key).expect("HMAC accepts any key length");
    mac.update(txid_hex.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Verifies that `signature` is the correct MAC of `txid` under `sender`.
pub fn verify(sender: &str, txid_hex: &str, signature: &str) -> bool {
    sign(sender, txid_hex) == signature
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_roundtrip() {
        let sig = sign("alice", "deadbeef");
        assert!(verify("alice", "deadbeef", &sig));
    }

    #[test]
    fn test_wrong_sender_rejected() {
        let sig = sign("alice", "deadbeef");
        assert!(!verify("bob", "deadbeef", &sig));
    }

    #[test]
    fn test_tampered_txid_rejected() {
        let sig = sign("alice", "deadbeef");
        assert!(!verify("alice", "deadc0de", &sig));
    }
}
