// Transaction mempool: an in-memory set of pending, not-yet-mined
// transactions, keyed by txid with a secondary index by sender. Enforces
// per-sender nonce ordering and rejects duplicates/conflicts.
use std::collections::HashMap;

use crate::ledger::Ledger;
use crate::primitives::Transaction;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum MempoolReject {
    #[error("transaction already present in the pool")]
    Duplicate,
    #[error("transaction signature does not verify")]
    BadSignature,
    #[error("nonce is below the sender's current account nonce")]
    Stale,
    #[error("a transaction from this sender with this nonce is already pending")]
    Conflict,
    #[error("coinbase transactions are synthesized by the miner, not submitted")]
    Coinbase,
}

struct Entry {
    tx: Transaction,
    arrival: u64,
}

#[derive(Default)]
pub struct Mempool {
    entries: HashMap<String, Entry>,
    by_sender_nonce: HashMap<(String, u64), String>,
    next_arrival: u64,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits `tx` if it is not a duplicate, not stale, not in conflict with
    /// an already-pending transaction from the same sender at the same
    /// nonce, and structurally valid. Transactions whose nonce is ahead of
    /// the sender's current account nonce are accepted as future work: they
    /// simply sit ineligible for `take` until the gap closes.
    ///
    /// A coinbase-sender transaction is never admitted: coinbase is only
    /// ever synthesized internally by the miner (`mine_once`), and it is
    /// unsigned by design, so accepting one from the wire would let anyone
    /// mint an unbounded, permanently-nonce-0 transaction that can never go
    /// stale and would poison every future mined block's merkle layout.
    pub fn add(&mut self, tx: Transaction, ledger: &Ledger) -> Result<(), MempoolReject> {
        if tx.is_coinbase() {
            return Err(MempoolReject::Coinbase);
        }
        if self.entries.contains_key(&tx.txid) {
            return Err(MempoolReject::Duplicate);
        }
        if !tx.is_structurally_valid() {
            return Err(MempoolReject::BadSignature);
        }
        if tx.nonce < ledger.nonce_of(&tx.sender) {
            return Err(MempoolReject::Stale);
        }
        let key = (tx.sender.clone(), tx.nonce);
        if self.by_sender_nonce.contains_key(&key) {
            return Err(MempoolReject::Conflict);
        }

        let arrival = self.next_arrival;
        self.next_arrival += 1;
        self.by_sender_nonce.insert(key, tx.txid.clone());
        self.entries.insert(tx.txid.clone(), Entry { tx, arrival });
        Ok(())
    }

    pub fn remove(&mut self, txid: &str) {
        if let Some(entry) = self.entries.remove(txid) {
            self.by_sender_nonce
                .remove(&(entry.tx.sender, entry.tx.nonce));
        }
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, txid: &str) -> bool {
        self.entries.contains_key(txid)
    }

    /// Returns up to `max_n` currently-applicable transactions against
    /// `ledger`, ordered by sender nonce ascending, then fee descending,
    /// then arrival time ascending. Per-sender nonce and balance both
    /// advance virtually as candidates are selected, so a second
    /// transaction from the same sender in the same round is admissible
    /// only while the running balance stays non-negative.
    pub fn take(&self, max_n: usize, ledger: &Ledger) -> Vec<Transaction> {
        let mut by_sender: HashMap<&str, Vec<&Entry>> = HashMap::new();
        for entry in self.entries.values() {
            by_sender.entry(&entry.tx.sender).or_default().push(entry);
        }

        let mut eligible: Vec<&Entry> = Vec::new();
        for (sender, mut txs) in by_sender {
            txs.sort_by_key(|e| e.tx.nonce);
            let mut expected = ledger.nonce_of(sender);
            let mut balance = ledger.balance_of(sender);
            for entry in txs {
                if entry.tx.nonce != expected {
                    break;
                }
                let debit = entry.tx.amount + entry.tx.fee;
                if debit > balance {
                    break;
                }
                eligible.push(entry);
                expected += 1;
                balance -= debit;
            }
        }

        eligible.sort_by(|a, b| {
            a.tx.nonce
                .cmp(&b.tx.nonce)
                .then(b.tx.fee.partial_cmp(&a.tx.fee).unwrap_or(std::cmp::Ordering::Equal))
                .then(a.arrival.cmp(&b.arrival))
        });

        eligible
            .into_iter()
            .take(max_n)
            .map(|e| e.tx.clone())
            .collect()
    }

    /// Re-admits transactions from a discarded chain suffix. Transactions
    /// that are no longer applicable (stale nonce) are silently dropped.
    pub fn reapply(&mut self, txs: Vec<Transaction>, ledger: &Ledger) {
        for tx in txs {
            let _ = self.add(tx, ledger);
        }
    }

    /// Drops every pending transaction whose nonce has fallen below the
    /// sender's current account nonce, as seen after a block is committed.
    pub fn evict_stale(&mut self, ledger: &Ledger) {
        let stale: Vec<String> = self
            .entries
            .values()
            .filter(|e| e.tx.nonce < ledger.nonce_of(&e.tx.sender))
            .map(|e| e.tx.txid.clone())
            .collect();
        for txid in stale {
            self.remove(&txid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::Block;

    fn tx(sender: &str, nonce: u64, fee: f64) -> Transaction {
        Transaction::new(sender.into(), "bob".into(), 1.0, fee, nonce, 1_700_000_001)
    }

    /// Credits `addr` with one block reward by appending a zero-difficulty
    /// block whose sole transaction is a coinbase payout — the only way to
    /// give an account a real balance through the public `Ledger` API.
    fn credit(ledger: &mut Ledger, addr: &str) {
        let ts = ledger.tip().timestamp + 1;
        let coinbase = Transaction::coinbase(addr.to_string(), ledger.block_reward(), ts);
        let block = Block::assemble(
            ledger.height() + 1,
            ledger.tip().hash.clone(),
            vec![coinbase],
            ts,
            0,
            0,
            addr.to_string(),
        );
        ledger.append(block).unwrap();
    }

    #[test]
    fn test_add_and_size() {
        let ledger = Ledger::new(50.0);
        let mut pool = Mempool::new();
        pool.add(tx("alice", 0, 0.1), &ledger).unwrap();
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn test_duplicate_rejected() {
        let ledger = Ledger::new(50.0);
        let mut pool = Mempool::new();
        let t = tx("alice", 0, 0.1);
        pool.add(t.clone(), &ledger).unwrap();
        assert_eq!(pool.add(t, &ledger).unwrap_err(), MempoolReject::Duplicate);
    }

    #[test]
    fn test_conflict_same_sender_nonce() {
        let ledger = Ledger::new(50.0);
        let mut pool = Mempool::new();
        pool.add(tx("alice", 0, 0.1), &ledger).unwrap();
        let conflicting = Transaction::new("alice".into(), "carol".into(), 2.0, 0.2, 0, 1_700_000_002);
        assert_eq!(
            pool.add(conflicting, &ledger).unwrap_err(),
            MempoolReject::Conflict
        );
    }

    #[test]
    fn test_future_nonce_ineligible_until_gap_closes() {
        let mut ledger = Ledger::new(50.0);
        credit(&mut ledger, "alice");
        let mut pool = Mempool::new();
        pool.add(tx("alice", 1, 0.1), &ledger).unwrap();
        assert!(pool.take(10, &ledger).is_empty());

        pool.add(tx("alice", 0, 0.1), &ledger).unwrap();
        let taken = pool.take(10, &ledger);
        assert_eq!(taken.len(), 2);
        assert_eq!(taken[0].nonce, 0);
        assert_eq!(taken[1].nonce, 1);
    }

    #[test]
    fn test_take_orders_by_fee_within_same_nonce() {
        let mut ledger = Ledger::new(50.0);
        credit(&mut ledger, "alice");
        credit(&mut ledger, "bob2");
        let mut pool = Mempool::new();
        pool.add(tx("alice", 0, 0.1), &ledger).unwrap();
        pool.add(tx("bob2", 0, 0.9), &ledger).unwrap();
        let taken = pool.take(10, &ledger);
        assert_eq!(taken[0].sender, "bob2");
    }

    #[test]
    fn test_remove() {
        let ledger = Ledger::new(50.0);
        let mut pool = Mempool::new();
        let t = tx("alice", 0, 0.1);
        pool.add(t.clone(), &ledger).unwrap();
        pool.remove(&t.txid);
        assert_eq!(pool.size(), 0);
    }

    #[test]
    fn test_coinbase_sender_rejected() {
        let ledger = Ledger::new(50.0);
        let mut pool = Mempool::new();
        let forged = Transaction::coinbase("attacker".into(), 999_999.0, 1_700_000_001);
        assert_eq!(pool.add(forged, &ledger).unwrap_err(), MempoolReject::Coinbase);
        assert_eq!(pool.size(), 0);
    }

    #[test]
    fn test_take_stops_at_insufficient_virtual_balance() {
        // alice has a committed balance of 50; two pending sends of 40 each
        // can never both be afforded, so only the first should ever be taken.
        let mut ledger = Ledger::new(50.0);
        credit(&mut ledger, "alice");
        let mut pool = Mempool::new();
        let first = Transaction::new("alice".into(), "bob".into(), 40.0, 0.0, 0, 1_700_000_001);
        let second = Transaction::new("alice".into(), "carol".into(), 40.0, 0.0, 1, 1_700_000_002);
        pool.add(first.clone(), &ledger).unwrap();
        pool.add(second, &ledger).unwrap();

        let taken = pool.take(10, &ledger);
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].txid, first.txid);
    }
}
