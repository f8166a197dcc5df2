// Data structures: Transaction
use crate::crypto::hash::hash_hex;
use crate::crypto::mac;
use serde::{Deserialize, Serialize};

pub const COINBASE_SENDER: &str = "COINBASE";

/// A transaction moving value from `sender` to `receiver`.
///
/// `txid` is the hash of the canonical serialization of every field except
/// `signature`; `signature` is the keyed MAC of `txid` under the sender's
/// key material (see `crypto::mac`), except for coinbase transactions which
/// carry an empty signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub sender: String,
    pub receiver: String,
    pub amount: f64,
    pub fee: f64,
    pub nonce: u64,
    pub timestamp: u64,
    pub signature: String,
    pub txid: String,
}

/// The exact field order and key set used for hashing and wire transmission
/// of the part of a transaction that precedes its signature (spec §6).
#[derive(Serialize)]
struct CanonicalTx<'a> {
    sender: &'a str,
    receiver: &'a str,
    amount: f64,
    fee: f64,
    nonce: u64,
    timestamp: u64,
}

impl Transaction {
    /// Computes the canonical txid: hash of `{sender,receiver,amount,fee,nonce,timestamp}`.
    pub fn compute_txid(
        sender: &str,
        receiver: &str,
        amount: f64,
        fee: f64,
        nonce: u64,
        timestamp: u64,
    ) -> String {
        let canon = CanonicalTx {
            sender,
            receiver,
            amount,
            fee,
            nonce,
            timestamp,
        };
        let bytes = serde_json::to_vec(&canon).expect("canonical tx always serializes");
        hash_hex(&bytes)
    }

    /// Builds and signs a transaction with a freshly-computed txid.
    pub fn new(
        sender: String,
        receiver: String,
        amount: f64,
        fee: f64,
        nonce: u64,
        timestamp: u64,
    ) -> Self {
        let txid = Self::compute_txid(&sender, &receiver, amount, fee, nonce, timestamp);
        let signature = mac::sign(&sender, &txid);
        Transaction {
            sender,
            receiver,
            amount,
            fee,
            nonce,
            timestamp,
            signature,
            txid,
        }
    }

    /// Builds the coinbase transaction paying `block_reward + fees` to `recipient`.
    pub fn coinbase(recipient: String, amount: f64, timestamp: u64) -> Self {
        let txid = Self::compute_txid(COINBASE_SENDER, &recipient, amount, 0.0, 0, timestamp);
        Transaction {
            sender: COINBASE_SENDER.to_string(),
            receiver: recipient,
            amount,
            fee: 0.0,
            nonce: 0,
            timestamp,
            signature: String::new(),
            txid,
        }
    }

    pub fn is_coinbase(&self) -> bool {
        self.sender == COINBASE_SENDER
    }

    /// Structural validity: txid matches the canonical fields, and either the
    /// transaction is coinbase (unsigned) or its MAC verifies.
    pub fn is_structurally_valid(&self) -> bool {
        let expected_txid = Self::compute_txid(
            &self.sender,
            &self.receiver,
            self.amount,
            self.fee,
            self.nonce,
            self.timestamp,
        );
        if self.txid != expected_txid {
            return false;
        }
        if self.amount < 0.0 || self.fee < 0.0 {
            return false;
        }
        if self.is_coinbase() {
            return self.nonce == 0 && self.fee == 0.0 && self.signature.is_empty();
        }
        mac::verify(&self.sender, &self.txid, &self.signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_tx_is_valid() {
        let tx = Transaction::new("alice".into(), "bob".into(), 10.0, 0.5, 0, 1_700_000_000);
        assert!(tx.is_structurally_valid());
    }

    #[test]
    fn test_coinbase_is_valid() {
        let cb = Transaction::coinbase("alice".into(), 50.0, 1_700_000_000);
        assert!(cb.is_coinbase());
        assert!(cb.is_structurally_valid());
    }

    #[test]
    fn test_tampered_amount_rejected() {
        let mut tx = Transaction::new("alice".into(), "bob".into(), 10.0, 0.5, 0, 1_700_000_000);
        tx.amount = 1000.0;
        assert!(!tx.is_structurally_valid());
    }

    #[test]
    fn test_tampered_signature_rejected() {
        let mut tx = Transaction::new("alice".into(), "bob".into(), 10.0, 0.5, 0, 1_700_000_000);
        tx.signature.push('0');
        assert!(!tx.is_structurally_valid());
    }

    #[test]
    fn test_canonical_key_order() {
        let canon = CanonicalTx {
            sender: "a",
            receiver: "b",
            amount: 1.0,
            fee: 0.0,
            nonce: 0,
            timestamp: 0,
        };
        let json = serde_json::to_string(&canon).unwrap();
        assert_eq!(
            json,
            r#"{"sender":"a","receiver":"b","amount":1.0,"fee":0.0,"nonce":0,"timestamp":0}"#
        );
    }
}
