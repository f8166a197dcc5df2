// Node orchestrator: owns lifecycle, routes inbound gossip to the ledger,
// mempool and miner, and drives chain resynchronization on startup, taller-
// tip discovery, and reconnect (spec §4.6).
mod orphans;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};

use crate::config::{CHAIN_SYNC_TIMEOUT_MS, DEFAULT_MAX_TXS_PER_BLOCK, ORPHAN_BUFFER_CAPACITY};
use crate::gossip::{Inbound, Message, Transport, TransportError};
use crate::ledger::{Ledger, LedgerError};
use crate::mempool::Mempool;
use crate::miner::{CandidateTemplate, Miner};
use crate::primitives::Block;

use orphans::OrphanBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Down,
    Starting,
    Up,
    Stopping,
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("node is already running")]
    AlreadyRunning,
    #[error("node is already stopped")]
    AlreadyStopped,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Snapshot returned by `status()` — the poll-style accessor external
/// observers (a dashboard, a demo driver) read every couple of seconds
/// (spec §6). No pushed events: this is the entire observation surface.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub node_id: String,
    pub height: u64,
    pub tip_hash: String,
    pub balance_of_self: f64,
    pub mempool_size: usize,
    pub peer_ids: Vec<String>,
    pub is_mining: bool,
}

struct Peer {
    host: String,
    port: u16,
}

pub struct Node {
    id: String,
    listen_port: u16,
    difficulty: u32,
    miner_address: String,
    auto_mine: bool,

    state: Mutex<NodeState>,
    ledger: Arc<Mutex<Ledger>>,
    mempool: Arc<Mutex<Mempool>>,
    miner: Arc<Mutex<Miner>>,
    orphans: Arc<Mutex<OrphanBuffer>>,
    known_peers: Mutex<Vec<Peer>>,

    transport: Mutex<Option<Transport>>,
    dispatch_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Node {
    pub fn new(id: String, listen_port: u16, difficulty: u32, block_reward: f64, miner_address: String, auto_mine: bool) -> Self {
        Node {
            id,
            listen_port,
            difficulty,
            miner_address,
            auto_mine,
            state: Mutex::new(NodeState::Down),
            ledger: Arc::new(Mutex::new(Ledger::new(block_reward))),
            mempool: Arc::new(Mutex::new(Mempool::new())),
            miner: Arc::new(Mutex::new(Miner::new())),
            orphans: Arc::new(Mutex::new(OrphanBuffer::new(ORPHAN_BUFFER_CAPACITY))),
            known_peers: Mutex::new(Vec::new()),
            transport: Mutex::new(None),
            dispatch_handle: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Starts the node: binds the listener, dials every peer in `peers`,
    /// issues an initial `GET_CHAIN` to each, and spawns the dispatch loop.
    pub async fn start(&self, bind_addr: &str, peers: Vec<(String, u16)>) -> Result<(), OrchestratorError> {
        {
            let mut state = self.state.lock().await;
            if *state != NodeState::Down {
                return Err(OrchestratorError::AlreadyRunning);
            }
            *state = NodeState::Starting;
        }

        *self.known_peers.lock().await = peers.iter().map(|(h, p)| Peer { host: h.clone(), port: *p }).collect();

        let (transport, inbound_rx) = Transport::new(self.id.clone(), self.listen_port);
        transport.listen(bind_addr).await?;

        for (host, port) in &peers {
            if let Err(e) = transport.connect(host, *port).await {
                eprintln!("[node:{}] failed to connect to {host}:{port}: {e}", self.id);
            }
        }

        *self.transport.lock().await = Some(transport.clone());
        self.spawn_dispatch_loop(transport.clone(), inbound_rx).await;
        self.request_chain_from_all(&transport).await;

        *self.state.lock().await = NodeState::Up;
        eprintln!("[node:{}] up, listening on {bind_addr}", self.id);
        Ok(())
    }

    /// Graceful shutdown: stops the miner (awaiting its exit), tears down
    /// the transport, and cancels the dispatch loop.
    pub async fn stop(&self) -> Result<(), OrchestratorError> {
        {
            let mut state = self.state.lock().await;
            if *state != NodeState::Up {
                return Err(OrchestratorError::AlreadyStopped);
            }
            *state = NodeState::Stopping;
        }

        self.miner.lock().await.stop().await;
        if let Some(t) = self.transport.lock().await.take() {
            t.shutdown().await;
        }
        if let Some(h) = self.dispatch_handle.lock().await.take() {
            h.abort();
        }

        *self.state.lock().await = NodeState::Down;
        eprintln!("[node:{}] stopped", self.id);
        Ok(())
    }

    /// Immediate teardown: tasks are aborted, not drained, sockets closed
    /// without a handshake (spec §5). Ledger and mempool survive in memory.
    pub async fn crash(&self) -> Result<(), OrchestratorError> {
        {
            let mut state = self.state.lock().await;
            if *state != NodeState::Up {
                return Err(OrchestratorError::AlreadyStopped);
            }
            *state = NodeState::Stopping;
        }

        self.miner.lock().await.preempt();
        if let Some(t) = self.transport.lock().await.take() {
            t.shutdown().await;
        }
        if let Some(h) = self.dispatch_handle.lock().await.take() {
            h.abort();
        }

        *self.state.lock().await = NodeState::Down;
        eprintln!("[node:{}] crashed", self.id);
        Ok(())
    }

    /// Re-enters `STARTING`: reopens the listener, redials previously known
    /// peers, and issues `GET_CHAIN(from_index=height)` to each (spec §4.6).
    pub async fn restart(&self, bind_addr: &str) -> Result<(), OrchestratorError> {
        let peers: Vec<(String, u16)> = self
            .known_peers
            .lock()
            .await
            .iter()
            .map(|p| (p.host.clone(), p.port))
            .collect();
        self.start(bind_addr, peers).await
    }

    pub async fn status(&self) -> StatusSnapshot {
        let ledger = self.ledger.lock().await;
        let mempool = self.mempool.lock().await;
        let peer_ids = match self.transport.lock().await.as_ref() {
            Some(t) => t.peer_ids().await,
            None => Vec::new(),
        };
        StatusSnapshot {
            node_id: self.id.clone(),
            height: ledger.height(),
            tip_hash: ledger.tip().hash.clone(),
            balance_of_self: ledger.balance_of(&self.miner_address),
            mempool_size: mempool.size(),
            peer_ids,
            is_mining: self.miner.lock().await.is_mining(),
        }
    }

    pub async fn recent_blocks(&self, n: usize) -> Vec<Block> {
        let ledger = self.ledger.lock().await;
        let chain = ledger.chain();
        let start = chain.len().saturating_sub(n);
        chain[start..].to_vec()
    }

    /// Reads the balance of an arbitrary address as this node's replica
    /// currently sees it — not just `balance_of_self`.
    pub async fn balance_of(&self, address: &str) -> f64 {
        self.ledger.lock().await.balance_of(address)
    }

    /// Dials an additional peer after `start()`, e.g. to close a ring
    /// topology. Recorded in `known_peers` so a later `restart()` redials it.
    pub async fn connect_peer(&self, host: &str, port: u16) -> Result<(), OrchestratorError> {
        let transport = self.transport.lock().await.clone();
        if let Some(t) = transport {
            t.connect(host, port).await?;
            self.known_peers.lock().await.push(Peer { host: host.to_string(), port });
        }
        Ok(())
    }

    /// Submits a locally-originated transaction: admits it to the mempool
    /// and, on acceptance, broadcasts it and kicks mining if idle.
    pub async fn submit_transaction(&self, tx: crate::primitives::Transaction) -> Result<(), crate::mempool::MempoolReject> {
        let was_empty;
        {
            let ledger = self.ledger.lock().await;
            let mut mempool = self.mempool.lock().await;
            was_empty = mempool.size() == 0;
            mempool.add(tx.clone(), &ledger)?;
        }
        if let Some(t) = self.transport.lock().await.as_ref() {
            t.broadcast(Message::NewTx(tx), &self.id, None).await;
        }
        if self.auto_mine && was_empty {
            self.trigger_mining().await;
        }
        Ok(())
    }

    /// Forces a mining round regardless of auto-mine or mempool contents —
    /// the primitive a demo driver uses to mine node0's first block before
    /// any transaction exists.
    pub async fn mine_now(&self) {
        self.trigger_mining().await;
    }

    /// Fault-injection hook (spec §6): every inbound frame at this node is
    /// dropped with probability `p`. Used by a partition façade to simulate
    /// a severed link by setting `p = 1.0` on both sides.
    pub async fn set_drop_probability(&self, p: f64) {
        if let Some(t) = self.transport.lock().await.as_ref() {
            t.set_drop_probability(p);
        }
    }

    /// Fault-injection hook (spec §6): every inbound frame at this node is
    /// delayed by `ms` before processing.
    pub async fn set_delay_ms(&self, ms: u64) {
        if let Some(t) = self.transport.lock().await.as_ref() {
            t.set_delay_ms(ms);
        }
    }

    /// Fault-injection hook: drops frames arriving from `peer_id` only —
    /// how a partition façade severs one link without affecting others
    /// (spec §6's "100% drop probability on links crossing the partition
    /// boundary").
    pub async fn set_link_drop_probability(&self, peer_id: &str, p: f64) {
        if let Some(t) = self.transport.lock().await.as_ref() {
            t.set_link_drop_probability(peer_id, p);
        }
    }

    pub async fn clear_link_drop_probability(&self, peer_id: &str) {
        if let Some(t) = self.transport.lock().await.as_ref() {
            t.clear_link_drop_probability(peer_id);
        }
    }

    async fn spawn_dispatch_loop(&self, transport: Transport, mut inbound_rx: mpsc::UnboundedReceiver<Inbound>) {
        let ledger = self.ledger.clone();
        let mempool = self.mempool.clone();
        let miner = self.miner.clone();
        let orphans = self.orphans.clone();
        let id = self.id.clone();
        let difficulty = self.difficulty;
        let miner_address = self.miner_address.clone();
        let auto_mine = self.auto_mine;

        let handle = tokio::spawn(async move {
            while let Some(inbound) = inbound_rx.recv().await {
                handle_inbound(
                    &id,
                    difficulty,
                    &miner_address,
                    auto_mine,
                    &ledger,
                    &mempool,
                    &miner,
                    &orphans,
                    &transport,
                    inbound,
                )
                .await;
            }
        });

        *self.dispatch_handle.lock().await = Some(handle);
    }

    /// Builds a fresh candidate from the current tip/mempool and starts a
    /// one-shot mining round. A no-op if the node has no transport yet
    /// (i.e. it has not been started).
    async fn trigger_mining(&self) {
        let Some(transport) = self.transport.lock().await.clone() else { return };
        kick_mining(&self.id, self.difficulty, &self.miner_address, &self.ledger, &self.mempool, &self.miner, transport).await;
    }

    async fn request_chain_from_all(&self, transport: &Transport) {
        let height = self.ledger.lock().await.height();
        for peer_id in transport.peer_ids().await {
            let _ = transport.send_to(&peer_id, Message::GetChain { from_index: height }).await;
        }
    }
}

fn now_secs() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

#[allow(clippy::too_many_arguments)]
async fn handle_inbound(
    id: &str,
    difficulty: u32,
    miner_address: &str,
    auto_mine: bool,
    ledger: &Arc<Mutex<Ledger>>,
    mempool: &Arc<Mutex<Mempool>>,
    miner: &Arc<Mutex<Miner>>,
    orphans: &Arc<Mutex<OrphanBuffer>>,
    transport: &Transport,
    inbound: Inbound,
) {
    match inbound.message {
        Message::Hello { .. } => {}
        Message::NewTx(tx) => {
            let was_empty;
            let accepted;
            {
                let l = ledger.lock().await;
                let mut mp = mempool.lock().await;
                was_empty = mp.size() == 0;
                accepted = mp.add(tx.clone(), &l).is_ok();
            }
            if accepted {
                transport.broadcast(Message::NewTx(tx), &inbound.origin_id, Some(&inbound.from_peer)).await;
                if auto_mine && was_empty {
                    kick_mining(id, difficulty, miner_address, ledger, mempool, miner, transport.clone()).await;
                }
            }
        }
        Message::NewBlock(block) => {
            handle_new_block(id, difficulty, miner_address, auto_mine, ledger, mempool, miner, orphans, transport, &inbound.from_peer, &inbound.origin_id, block).await;
        }
        Message::GetChain { from_index: _ } => {
            let blocks = ledger.lock().await.chain().to_vec();
            let _ = transport.send_to(&inbound.from_peer, Message::ChainResponse { blocks }).await;
        }
        Message::ChainResponse { blocks } => {
            handle_chain_response(id, difficulty, miner_address, auto_mine, ledger, mempool, miner, orphans, transport, blocks).await;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_new_block(
    id: &str,
    difficulty: u32,
    miner_address: &str,
    auto_mine: bool,
    ledger: &Arc<Mutex<Ledger>>,
    mempool: &Arc<Mutex<Mempool>>,
    miner: &Arc<Mutex<Miner>>,
    orphans: &Arc<Mutex<OrphanBuffer>>,
    transport: &Transport,
    from_peer: &str,
    origin_id: &str,
    block: Block,
) {
    let height = ledger.lock().await.height();

    if block.index == height + 1 {
        try_append(id, difficulty, miner_address, auto_mine, ledger, mempool, miner, orphans, transport, Some(from_peer), origin_id, block).await;
    } else if block.index > height + 1 {
        eprintln!("[node:{id}] buffering orphan block {} (have height {height})", block.index);
        let parent_hash = block.previous_hash.clone();
        orphans.lock().await.insert(block, origin_id.to_string());
        let _ = transport.send_to(from_peer, Message::GetChain { from_index: height }).await;
        retry_chain_sync_if_still_orphaned(id, orphans.clone(), transport.clone(), from_peer.to_string(), parent_hash);
    } else {
        let _ = transport.send_to(from_peer, Message::GetChain { from_index: height }).await;
    }
}

/// After `CHAIN_SYNC_TIMEOUT_MS`, if `parent_hash` is still unresolved,
/// retries the chain-sync request against a different known peer (spec §5:
/// "the orphan buffer may be retried against another peer").
fn retry_chain_sync_if_still_orphaned(id: &str, orphans: Arc<Mutex<OrphanBuffer>>, transport: Transport, skip_peer: String, parent_hash: String) {
    let id = id.to_string();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(CHAIN_SYNC_TIMEOUT_MS)).await;
        if !orphans.lock().await.contains_parent(&parent_hash) {
            return;
        }
        let candidates: Vec<String> = transport.peer_ids().await.into_iter().filter(|p| *p != skip_peer).collect();
        if let Some(peer_id) = candidates.first() {
            eprintln!("[node:{id}] chain-sync timed out, retrying against {peer_id}");
            let _ = transport.send_to(peer_id, Message::GetChain { from_index: 0 }).await;
        }
    });
}

/// Appends `block` onto the ledger; on success, preempts the miner,
/// re-broadcasts (except to `except_peer`, if any) stamped with the
/// original introducer's `origin_id`, drains any orphan now reattachable on
/// top, and kicks a fresh mining round if applicable.
#[allow(clippy::too_many_arguments)]
async fn try_append(
    id: &str,
    difficulty: u32,
    miner_address: &str,
    auto_mine: bool,
    ledger: &Arc<Mutex<Ledger>>,
    mempool: &Arc<Mutex<Mempool>>,
    miner: &Arc<Mutex<Miner>>,
    orphans: &Arc<Mutex<OrphanBuffer>>,
    transport: &Transport,
    except_peer: Option<&str>,
    origin_id: &str,
    block: Block,
) {
    let block_hash = block.hash.clone();
    let result = {
        let mut l = ledger.lock().await;
        l.append(block.clone())
    };

    match result {
        Ok(committed_txids) => {
            {
                let mut mp = mempool.lock().await;
                for txid in &committed_txids {
                    mp.remove(txid);
                }
                let l = ledger.lock().await;
                mp.evict_stale(&l);
            }
            miner.lock().await.preempt();
            transport.broadcast(Message::NewBlock(block), origin_id, except_peer).await;

            let reattachable = orphans.lock().await.take_children_of(&block_hash);
            for (child, child_origin_id) in reattachable {
                Box::pin(try_append(id, difficulty, miner_address, auto_mine, ledger, mempool, miner, orphans, transport, None, &child_origin_id, child)).await;
            }

            if auto_mine {
                let remaining = mempool.lock().await.size() > 0;
                if remaining {
                    kick_mining(id, difficulty, miner_address, ledger, mempool, miner, transport.clone()).await;
                }
            }
        }
        Err(e) => {
            eprintln!("[ledger:{id}] reject block {}: {e}", block.index);
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_chain_response(
    id: &str,
    difficulty: u32,
    miner_address: &str,
    auto_mine: bool,
    ledger: &Arc<Mutex<Ledger>>,
    mempool: &Arc<Mutex<Mempool>>,
    miner: &Arc<Mutex<Miner>>,
    orphans: &Arc<Mutex<OrphanBuffer>>,
    transport: &Transport,
    blocks: Vec<Block>,
) {
    let current_len = ledger.lock().await.chain().len();
    if blocks.len() <= current_len {
        return;
    }

    let outcome = {
        let mut l = ledger.lock().await;
        l.replace_chain(blocks)
    };

    match outcome {
        Ok(outcome) => {
            let mut mp = mempool.lock().await;
            for txid in &outcome.committed_txids {
                mp.remove(txid);
            }
            let l = ledger.lock().await;
            mp.reapply(outcome.reintroduced, &l);
            mp.evict_stale(&l);
            drop(l);
            drop(mp);

            miner.lock().await.preempt();
            eprintln!("[node:{id}] adopted longer chain, height now {}", ledger.lock().await.height());

            if auto_mine && mempool.lock().await.size() > 0 {
                kick_mining(id, difficulty, miner_address, ledger, mempool, miner, transport.clone()).await;
            }
        }
        Err(LedgerError::NotLonger) => {}
        Err(e) => {
            eprintln!("[ledger:{id}] candidate chain rejected: {e}");
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn kick_mining(
    id: &str,
    difficulty: u32,
    miner_address: &str,
    ledger: &Arc<Mutex<Ledger>>,
    mempool: &Arc<Mutex<Mempool>>,
    miner: &Arc<Mutex<Miner>>,
    transport: Transport,
) {
    let template = {
        let l = ledger.lock().await;
        let mp = mempool.lock().await;
        CandidateTemplate {
            index: l.height() + 1,
            previous_hash: l.tip().hash.clone(),
            difficulty,
            transactions: mp.take(DEFAULT_MAX_TXS_PER_BLOCK, &l),
            coinbase_recipient: miner_address.to_string(),
            block_reward: l.block_reward(),
        }
    };

    let mut template_opt = Some(template);
    let (block_tx, mut block_rx) = mpsc::unbounded_channel();
    miner.lock().await.start(move || template_opt.take(), now_secs, block_tx);

    let id = id.to_string();
    let ledger = ledger.clone();
    let mempool = mempool.clone();
    tokio::spawn(async move {
        if let Some(block) = block_rx.recv().await {
            on_mined_block(&id, &ledger, &mempool, &transport, block).await;
        }
    });
}

/// Applies a block the local miner just found and, on acceptance,
/// broadcasts it to every peer (there is no "except the sender" here — the
/// node is the origin).
async fn on_mined_block(id: &str, ledger: &Arc<Mutex<Ledger>>, mempool: &Arc<Mutex<Mempool>>, transport: &Transport, block: Block) {
    let committed = {
        let mut l = ledger.lock().await;
        l.append(block.clone())
    };
    match committed {
        Ok(committed_txids) => {
            {
                let mut mp = mempool.lock().await;
                for txid in &committed_txids {
                    mp.remove(txid);
                }
            }
            eprintln!("[miner:{id}] mined block {} ({})", block.index, &block.hash[..8]);
            transport.broadcast(Message::NewBlock(block), id, None).await;
        }
        Err(e) => {
            eprintln!("[miner:{id}] self-mined block {} rejected by own ledger: {e}", block.index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lifecycle_state_transitions() {
        let node = Node::new("n0".into(), 29001, 0, 50.0, "n0".into(), false);
        node.start("127.0.0.1:29001", vec![]).await.unwrap();
        assert_eq!(*node.state.lock().await, NodeState::Up);
        assert!(matches!(node.start("127.0.0.1:29001", vec![]).await, Err(OrchestratorError::AlreadyRunning)));
        node.stop().await.unwrap();
        assert_eq!(*node.state.lock().await, NodeState::Down);
        assert!(matches!(node.stop().await, Err(OrchestratorError::AlreadyStopped)));
    }

    #[tokio::test]
    async fn test_mine_now_produces_a_block() {
        let node = Node::new("n0".into(), 29011, 0, 50.0, "n0".into(), false);
        node.start("127.0.0.1:29011", vec![]).await.unwrap();
        node.mine_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        let status = node.status().await;
        assert_eq!(status.height, 1);
        assert_eq!(status.balance_of_self, 50.0);
        node.stop().await.unwrap();
    }
}
