// Data structures: Block
use super::transaction::Transaction;
use crate::crypto::hash::hash_hex;
use crate::merkle;
use serde::{Deserialize, Serialize};

pub const ZERO_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub index: u64,
    pub previous_hash: String,
    pub transactions: Vec<Transaction>,
    pub timestamp: u64,
    pub nonce: u64,
    pub difficulty: u32,
    pub merkle_root: String,
    pub miner_address: String,
    pub hash: String,
}

/// The exact field order used for header hashing and wire transmission
/// (spec §6): everything except `transactions` and the resulting `hash`.
#[derive(Serialize)]
struct CanonicalHeader<'a> {
    index: u64,
    previous_hash: &'a str,
    merkle_root: &'a str,
    timestamp: u64,
    nonce: u64,
    difficulty: u32,
    miner_address: &'a str,
}

impl Block {
    #[allow(clippy::too_many_arguments)]
    pub fn header_hash(
        index: u64,
        previous_hash: &str,
        merkle_root: &str,
        timestamp: u64,
        nonce: u64,
        difficulty: u32,
        miner_address: &str,
    ) -> String {
        let header = CanonicalHeader {
            index,
            previous_hash,
            merkle_root,
            timestamp,
            nonce,
            difficulty,
            miner_address,
        };
        let bytes = serde_json::to_vec(&header).expect("canonical header always serializes");
        hash_hex(&bytes)
    }

    /// The fixed genesis block: index 0, zero previous_hash, no transactions.
    pub fn genesis(timestamp: u64) -> Self {
        let merkle_root = merkle::root(&[]);
        let hash = Self::header_hash(0, ZERO_HASH, &merkle_root, timestamp, 0, 0, "");
        Block {
            index: 0,
            previous_hash: ZERO_HASH.to_string(),
            transactions: Vec::new(),
            timestamp,
            nonce: 0,
            difficulty: 0,
            merkle_root,
            miner_address: String::new(),
            hash,
        }
    }

    /// Assembles a block at a known nonce, computing merkle root and hash.
    /// Used by the miner once a winning nonce is found, and by tests that
    /// need a hand-built block.
    #[allow(clippy::too_many_arguments)]
    pub fn assemble(
        index: u64,
        previous_hash: String,
        transactions: Vec<Transaction>,
        timestamp: u64,
        nonce: u64,
        difficulty: u32,
        miner_address: String,
    ) -> Self {
        let merkle_root = merkle::root_of_transactions(&transactions);
        let hash = Self::header_hash(
            index,
            &previous_hash,
            &merkle_root,
            timestamp,
            nonce,
            difficulty,
            &miner_address,
        );
        Block {
            index,
            previous_hash,
            transactions,
            timestamp,
            nonce,
            difficulty,
            merkle_root,
            miner_address,
            hash,
        }
    }

    /// Recomputes hash and merkle_root from the block's fields and compares
    /// against the stored values; used to validate a block received over
    /// the wire before it reaches the ledger.
    pub fn is_internally_consistent(&self) -> bool {
        let expected_root = merkle::root_of_transactions(&self.transactions);
        if self.merkle_root != expected_root {
            return false;
        }
        let expected_hash = Self::header_hash(
            self.index,
            &self.previous_hash,
            &self.merkle_root,
            self.timestamp,
            self.nonce,
            self.difficulty,
            &self.miner_address,
        );
        if self.hash != expected_hash {
            return false;
        }
        crate::crypto::hash::meets_difficulty(&self.hash, self.difficulty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_genesis_is_consistent() {
        let g = Block::genesis(1_700_000_000);
        assert_eq!(g.index, 0);
        assert_eq!(g.previous_hash, ZERO_HASH);
        assert!(g.transactions.is_empty());
    }

    #[test]
    fn test_assemble_then_consistent_when_difficulty_zero() {
        let txs = vec![Transaction::coinbase("alice".into(), 50.0, 10)];
        let b = Block::assemble(1, ZERO_HASH.to_string(), txs, 10, 0, 0, "alice".into());
        assert!(b.is_internally_consistent());
    }

    #[test]
    fn test_tampered_transactions_break_merkle() {
        let txs = vec![Transaction::coinbase("alice".into(), 50.0, 10)];
        let mut b = Block::assemble(1, ZERO_HASH.to_string(), txs, 10, 0, 0, "alice".into());
        b.transactions
            .push(Transaction::coinbase("mallory".into(), 999.0, 10));
        assert!(!b.is_internally_consistent());
    }

    #[test]
    fn test_canonical_header_key_order() {
        let h = CanonicalHeader {
            index: 1,
            previous_hash: "aa",
            merkle_root: "bb",
            timestamp: 2,
            nonce: 3,
            difficulty: 2,
            miner_address: "alice",
        };
        let json = serde_json::to_string(&h).unwrap();
        assert_eq!(
            json,
            r#"{"index":1,"previous_hash":"aa","merkle_root":"bb","timestamp":2,"nonce":3,"difficulty":2,"miner_address":"alice"}"#
        );
    }
}
