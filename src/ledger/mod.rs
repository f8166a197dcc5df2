// Ledger: canonical chain storage, transaction replay, block validation,
// and longest-chain fork resolution.
pub mod genesis;

use std::collections::HashMap;

use crate::primitives::{Block, Transaction};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Account {
    pub balance: f64,
    pub nonce: u64,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum LedgerError {
    #[error("block index does not follow the current tip")]
    HeightMismatch,
    #[error("block previous_hash does not match the current tip's hash")]
    ParentMismatch,
    #[error("block hash does not satisfy its declared difficulty")]
    BadPow,
    #[error("merkle_root does not match the block's transaction list")]
    BadMerkle,
    #[error("transaction signature does not verify")]
    BadSignature,
    #[error("transaction nonce does not match the sender's expected nonce")]
    BadNonce,
    #[error("sender balance is insufficient for amount + fee")]
    InsufficientBalance,
    #[error("coinbase transaction is missing, duplicated, or pays the wrong amount")]
    BadCoinbase,
    #[error("candidate chain does not share this chain's genesis block")]
    GenesisMismatch,
    #[error("candidate chain is not strictly longer than the current chain")]
    NotLonger,
}

/// The result of a successful `replace_chain`: transactions the caller
/// should remove from the mempool (now committed) and transactions the
/// caller should hand back to the mempool (from the discarded suffix).
pub struct ReplaceOutcome {
    pub committed_txids: Vec<String>,
    pub reintroduced: Vec<Transaction>,
}

pub struct Ledger {
    chain: Vec<Block>,
    accounts: HashMap<String, Account>,
    block_reward: f64,
}

impl Ledger {
    pub fn new(block_reward: f64) -> Self {
        let genesis = genesis::create_genesis_block();
        Ledger {
            chain: vec![genesis],
            accounts: HashMap::new(),
            block_reward,
        }
    }

    pub fn tip(&self) -> &Block {
        self.chain.last().expect("chain always has a genesis block")
    }

    pub fn height(&self) -> u64 {
        self.tip().index
    }

    pub fn block_reward(&self) -> f64 {
        self.block_reward
    }

    pub fn chain(&self) -> &[Block] {
        &self.chain
    }

    pub fn balance_of(&self, addr: &str) -> f64 {
        self.accounts.get(addr).map(|a| a.balance).unwrap_or(0.0)
    }

    pub fn nonce_of(&self, addr: &str) -> u64 {
        self.accounts.get(addr).map(|a| a.nonce).unwrap_or(0)
    }

    /// Checks whether `tx` is applicable against the current committed
    /// account state, without mutating it.
    pub fn can_apply(&self, tx: &Transaction) -> Result<(), LedgerError> {
        apply_tx(&mut self.accounts.clone(), tx, None)
    }

    /// Validates `block` against the current tip and, on success, applies it
    /// in place. Returns the txids now committed (for mempool cleanup).
    /// Rejection is total: no partial application.
    pub fn append(&mut self, block: Block) -> Result<Vec<String>, LedgerError> {
        let mut scratch = self.accounts.clone();
        let committed = apply_block_onto(&mut scratch, self.tip(), &block, self.block_reward)?;
        self.chain.push(block);
        self.accounts = scratch;
        Ok(committed)
    }

    /// Replays `candidate` from its own genesis, returning the resulting
    /// account state on success. Does not mutate `self`.
    pub fn validate_chain(&self, candidate: &[Block]) -> Result<HashMap<String, Account>, LedgerError> {
        if candidate.is_empty() || candidate[0] != self.chain[0] {
            return Err(LedgerError::GenesisMismatch);
        }
        let mut accounts = HashMap::new();
        let mut prev = &candidate[0];
        for block in &candidate[1..] {
            apply_block_onto(&mut accounts, prev, block, self.block_reward)?;
            prev = block;
        }
        Ok(accounts)
    }

    /// Accepts `candidate` only if it is strictly longer than the current
    /// chain and validates end-to-end. Ties (equal length) keep the current
    /// chain: first-seen wins (the system's decisive fork rule).
    pub fn replace_chain(&mut self, candidate: Vec<Block>) -> Result<ReplaceOutcome, LedgerError> {
        if candidate.len() <= self.chain.len() {
            return Err(LedgerError::NotLonger);
        }
        let new_accounts = self.validate_chain(&candidate)?;

        let common_len = self
            .chain
            .iter()
            .zip(candidate.iter())
            .take_while(|(a, b)| a == b)
            .count();

        let reintroduced: Vec<Transaction> = self.chain[common_len..]
            .iter()
            .flat_map(|b| b.transactions.iter().cloned())
            .filter(|tx| !tx.is_coinbase())
            .collect();

        let committed_txids: Vec<String> = candidate[common_len..]
            .iter()
            .flat_map(|b| b.transactions.iter())
            .filter(|tx| !tx.is_coinbase())
            .map(|tx| tx.txid.clone())
            .collect();

        self.chain = candidate;
        self.accounts = new_accounts;

        Ok(ReplaceOutcome {
            committed_txids,
            reintroduced,
        })
    }
}

/// Applies a non-coinbase transaction onto `accounts`. If `accounts` is
/// `None`'s scratch sibling is not used here; kept separate from
/// `apply_block_onto` so `can_apply` can probe a single transaction.
fn apply_tx(
    accounts: &mut HashMap<String, Account>,
    tx: &Transaction,
    _unused: Option<()>,
) -> Result<(), LedgerError> {
    if !tx.is_structurally_valid() {
        return Err(LedgerError::BadSignature);
    }
    let sender = accounts.entry(tx.sender.clone()).or_default();
    if tx.nonce != sender.nonce {
        return Err(LedgerError::BadNonce);
    }
    let debit = tx.amount + tx.fee;
    if sender.balance < debit {
        return Err(LedgerError::InsufficientBalance);
    }
    sender.balance -= debit;
    sender.nonce += 1;

    let receiver = accounts.entry(tx.receiver.clone()).or_default();
    receiver.balance += tx.amount;
    Ok(())
}

/// Validates and applies `block` (which must directly follow `parent`) onto
/// `accounts`, returning the non-coinbase txids committed.
fn apply_block_onto(
    accounts: &mut HashMap<String, Account>,
    parent: &Block,
    block: &Block,
    block_reward: f64,
) -> Result<Vec<String>, LedgerError> {
    if block.index != parent.index + 1 {
        return Err(LedgerError::HeightMismatch);
    }
    if block.previous_hash != parent.hash {
        return Err(LedgerError::ParentMismatch);
    }
    if !crate::crypto::hash::meets_difficulty(&block.hash, block.difficulty) {
        return Err(LedgerError::BadPow);
    }
    let expected_root = crate::merkle::root_of_transactions(&block.transactions);
    if block.merkle_root != expected_root {
        return Err(LedgerError::BadMerkle);
    }
    let expected_hash = Block::header_hash(
        block.index,
        &block.previous_hash,
        &block.merkle_root,
        block.timestamp,
        block.nonce,
        block.difficulty,
        &block.miner_address,
    );
    if block.hash != expected_hash {
        return Err(LedgerError::BadPow);
    }

    let mut fees = 0.0f64;
    let mut committed = Vec::new();
    let mut coinbase_seen = false;

    for (i, tx) in block.transactions.iter().enumerate() {
        if tx.is_coinbase() {
            if i != 0 || coinbase_seen {
                return Err(LedgerError::BadCoinbase);
            }
            coinbase_seen = true;
            if tx.receiver != block.miner_address {
                return Err(LedgerError::BadCoinbase);
            }
        } else {
            apply_tx(accounts, tx, None)?;
            fees += tx.fee;
            committed.push(tx.txid.clone());
        }
    }

    if !coinbase_seen {
        return Err(LedgerError::BadCoinbase);
    }
    let coinbase = &block.transactions[0];
    if (coinbase.amount - (block_reward + fees)).abs() > f64::EPSILON {
        return Err(LedgerError::BadCoinbase);
    }
    let miner = accounts.entry(coinbase.receiver.clone()).or_default();
    miner.balance += coinbase.amount;

    Ok(committed)
}
