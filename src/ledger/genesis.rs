// Genesis block definition.
//
// The genesis block has no previous hash, no transactions, and a fixed
// timestamp so every independently-started node derives the identical
// block 0 and hash-links onto the same chain.
use crate::primitives::Block;

/// Fixed genesis timestamp, shared by every node in a simulation.
pub const GENESIS_TIMESTAMP: u64 = 1_700_000_000;

pub fn create_genesis_block() -> Block {
    Block::genesis(GENESIS_TIMESTAMP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_genesis_block_structure() {
        let genesis = create_genesis_block();
        assert_eq!(genesis.index, 0);
        assert_eq!(genesis.previous_hash, crate::primitives::block::ZERO_HASH);
        assert!(genesis.transactions.is_empty());
        assert_eq!(genesis.timestamp, GENESIS_TIMESTAMP);
    }

    #[test]
    fn test_genesis_is_deterministic() {
        assert_eq!(create_genesis_block(), create_genesis_block());
    }
}
