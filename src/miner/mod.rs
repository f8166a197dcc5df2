// Mining loop: assemble a candidate block, search for a winning nonce,
// cooperatively yield every ~100,000 attempts so a preemption or inbound
// message is never starved.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;

use crate::crypto::hash::meets_difficulty;
use crate::merkle;
use crate::primitives::{Block, Transaction};

const YIELD_EVERY: u64 = 100_000;

/// Everything the miner needs to assemble one candidate block. Built by the
/// orchestrator from the current tip, difficulty, and mempool selection.
pub struct CandidateTemplate {
    pub index: u64,
    pub previous_hash: String,
    pub difficulty: u32,
    pub transactions: Vec<Transaction>,
    pub coinbase_recipient: String,
    pub block_reward: f64,
}

/// Assembles the coinbase + mempool selection, then searches nonces from 0
/// until one satisfies `template.difficulty`. Checks `stop` every
/// `YIELD_EVERY` attempts and cooperatively yields at the same cadence.
pub async fn mine_once(
    template: CandidateTemplate,
    timestamp: u64,
    stop: &AtomicBool,
) -> Option<Block> {
    let fees: f64 = template.transactions.iter().map(|t| t.fee).sum();
    let mut txs = Vec::with_capacity(template.transactions.len() + 1);
    txs.push(Transaction::coinbase(
        template.coinbase_recipient.clone(),
        template.block_reward + fees,
        timestamp,
    ));
    txs.extend(template.transactions);

    let merkle_root = merkle::root_of_transactions(&txs);
    let mut nonce: u64 = 0;

    loop {
        if stop.load(Ordering::Relaxed) {
            return None;
        }

        let hash = Block::header_hash(
            template.index,
            &template.previous_hash,
            &merkle_root,
            timestamp,
            nonce,
            template.difficulty,
            &template.coinbase_recipient,
        );
        if meets_difficulty(&hash, template.difficulty) {
            return Some(Block {
                index: template.index,
                previous_hash: template.previous_hash,
                transactions: txs,
                timestamp,
                nonce,
                difficulty: template.difficulty,
                merkle_root,
                miner_address: template.coinbase_recipient,
                hash,
            });
        }

        nonce = nonce.wrapping_add(1);
        if nonce.is_multiple_of(YIELD_EVERY) {
            if stop.load(Ordering::Relaxed) {
                return None;
            }
            tokio::task::yield_now().await;
        }
    }
}

/// Drives repeated mining rounds as a background task. Each round asks
/// `candidate_factory` for fresh work; a `None` means nothing to mine yet
/// and the miner idles until told to try again via `kick()`.
pub struct Miner {
    stop: Arc<AtomicBool>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl Default for Miner {
    fn default() -> Self {
        Self::new()
    }
}

impl Miner {
    pub fn new() -> Self {
        Miner {
            stop: Arc::new(AtomicBool::new(true)),
            handle: None,
        }
    }

    pub fn is_mining(&self) -> bool {
        self.handle.is_some()
    }

    /// Starts a background mining task. `candidate_factory` is called once
    /// per round (it must not block); `timestamp_fn` supplies the block
    /// timestamp for each attempt; mined blocks are sent on `on_block`.
    pub fn start<F, T>(
        &mut self,
        mut candidate_factory: F,
        timestamp_fn: T,
        on_block: mpsc::UnboundedSender<Block>,
    ) where
        F: FnMut() -> Option<CandidateTemplate> + Send + 'static,
        T: Fn() -> u64 + Send + 'static,
    {
        self.preempt();
        if let Some(h) = self.handle.take() {
            h.abort();
        }
        let stop = Arc::new(AtomicBool::new(false));
        self.stop = stop.clone();

        self.handle = Some(tokio::spawn(async move {
            loop {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                let Some(template) = candidate_factory() else {
                    break;
                };
                let ts = timestamp_fn();
                if let Some(block) = mine_once(template, ts, &stop).await {
                    if on_block.send(block).is_err() {
                        break;
                    }
                }
            }
        }));
    }

    /// Signals the in-flight search to abandon its candidate. The block, if
    /// any, is discarded; the next round rebuilds from fresh state.
    pub fn preempt(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Preempts and awaits the background task's exit.
    pub async fn stop(&mut self) {
        self.preempt();
        if let Some(h) = self.handle.take() {
            let _ = h.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::block::ZERO_HASH;

    #[tokio::test]
    async fn test_mine_once_finds_valid_nonce() {
        let template = CandidateTemplate {
            index: 1,
            previous_hash: ZERO_HASH.to_string(),
            difficulty: 1,
            transactions: vec![],
            coinbase_recipient: "alice".to_string(),
            block_reward: 50.0,
        };
        let stop = AtomicBool::new(false);
        let block = mine_once(template, 1_700_000_001, &stop).await.unwrap();
        assert!(meets_difficulty(&block.hash, 1));
        assert_eq!(block.transactions[0].receiver, "alice");
        assert_eq!(block.transactions[0].amount, 50.0);
    }

    #[tokio::test]
    async fn test_mine_once_preempted_returns_none() {
        let template = CandidateTemplate {
            index: 1,
            previous_hash: ZERO_HASH.to_string(),
            difficulty: 64,
            transactions: vec![],
            coinbase_recipient: "alice".to_string(),
            block_reward: 50.0,
        };
        let stop = AtomicBool::new(true);
        let block = mine_once(template, 1_700_000_001, &stop).await;
        assert!(block.is_none());
    }

    #[tokio::test]
    async fn test_miner_start_and_stop() {
        let mut miner = Miner::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut called = 0;
        miner.start(
            move || {
                called += 1;
                if called > 1 {
                    return None;
                }
                Some(CandidateTemplate {
                    index: 1,
                    previous_hash: ZERO_HASH.to_string(),
                    difficulty: 0,
                    transactions: vec![],
                    coinbase_recipient: "alice".to_string(),
                    block_reward: 50.0,
                })
            },
            || 1_700_000_001,
            tx,
        );
        let block = rx.recv().await.unwrap();
        assert_eq!(block.miner_address, "alice");
        miner.stop().await;
        assert!(!miner.is_mining());
    }
}
