// Gossip transport: TCP connections to peers, length-prefixed JSON framing,
// duplicate suppression, fault injection, and flood-style forwarding.
//
// Rebroadcast is driven by the orchestrator, not the transport itself: the
// transport only dedups and delivers (spec §4.5 steps 1-6); whether a
// delivered message is worth re-flooding is an application-level decision
// gated on ledger/mempool acceptance (spec §4.6's "on accept, rebroadcast;
// on reject, discard silently"). See DESIGN.md for why this reading was
// chosen over a transport-level unconditional flood.
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::Duration;

use crate::config::{CONNECT_TIMEOUT_MS, OUTBOUND_QUEUE_CAPACITY, SEEN_SET_CAPACITY};

use super::framed::FramedStream;
use super::message::{Envelope, Message};
use super::seen_set::SeenSet;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind listener: {0}")]
    Bind(std::io::Error),
    #[error("connect to {0} timed out")]
    ConnectTimeout(String),
    #[error("connect to {0} failed: {1}")]
    Connect(String, std::io::Error),
    #[error("handshake with {0} failed: {1}")]
    Handshake(String, String),
    #[error("peer {0} is not connected")]
    UnknownPeer(String),
}

/// A message delivered to the orchestrator after dedup, with the id of the
/// peer it arrived from (so the orchestrator can exclude that peer from any
/// rebroadcast it decides to issue) and the envelope's `origin_id` — the
/// peer that first introduced this message to the network, to be propagated
/// unchanged on any rebroadcast (spec §4.5 step 7).
#[derive(Debug, Clone)]
pub struct Inbound {
    pub from_peer: String,
    pub origin_id: String,
    pub message: Message,
}

struct PeerHandle {
    host: String,
    port: u16,
    outbound: bool,
    last_seen: u64,
    queue: Arc<Mutex<std::collections::VecDeque<(Message, String)>>>,
    notify: Arc<Notify>,
    reader: tokio::task::JoinHandle<()>,
    writer: tokio::task::JoinHandle<()>,
}

#[derive(Debug, Clone)]
pub struct PeerSummary {
    pub peer_id: String,
    pub host: String,
    pub port: u16,
    pub outbound: bool,
    pub last_seen: u64,
}

/// Owns peer connections and fault-injection knobs for one node. Cloning a
/// `Transport` shares the same underlying state — every clone is a handle.
#[derive(Clone)]
pub struct Transport {
    self_id: String,
    listen_port: u16,
    seen: Arc<Mutex<SeenSet>>,
    peers: Arc<Mutex<HashMap<String, PeerHandle>>>,
    drop_probability: Arc<StdMutex<f64>>,
    delay_ms: Arc<StdMutex<u64>>,
    link_drop_overrides: Arc<StdMutex<HashMap<String, f64>>>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    listener_handle: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

impl Transport {
    pub fn new(self_id: String, listen_port: u16) -> (Self, mpsc::UnboundedReceiver<Inbound>) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let transport = Transport {
            self_id,
            listen_port,
            seen: Arc::new(Mutex::new(SeenSet::new(SEEN_SET_CAPACITY))),
            peers: Arc::new(Mutex::new(HashMap::new())),
            drop_probability: Arc::new(StdMutex::new(0.0)),
            delay_ms: Arc::new(StdMutex::new(0)),
            link_drop_overrides: Arc::new(StdMutex::new(HashMap::new())),
            inbound_tx,
            listener_handle: Arc::new(Mutex::new(None)),
        };
        (transport, inbound_rx)
    }

    /// Tears down the listener and every peer connection immediately: tasks
    /// are aborted, not drained (spec §5's "crash is immediate cancellation").
    pub async fn shutdown(&self) {
        if let Some(handle) = self.listener_handle.lock().await.take() {
            handle.abort();
        }
        let mut peers = self.peers.lock().await;
        for (_, handle) in peers.drain() {
            handle.reader.abort();
            handle.writer.abort();
        }
    }

    /// Per-node drop probability for the fault-injection facade (spec §6).
    pub fn set_drop_probability(&self, p: f64) {
        *self.drop_probability.lock().unwrap() = p.clamp(0.0, 1.0);
    }

    /// Per-link drop probability override, keyed by peer id. A partition
    /// façade uses this to sever only the links crossing the partition
    /// boundary (spec §6) rather than every link at the node. Falls back to
    /// the node-wide probability when no override is set for a peer.
    pub fn set_link_drop_probability(&self, peer_id: &str, p: f64) {
        self.link_drop_overrides.lock().unwrap().insert(peer_id.to_string(), p.clamp(0.0, 1.0));
    }

    pub fn clear_link_drop_probability(&self, peer_id: &str) {
        self.link_drop_overrides.lock().unwrap().remove(peer_id);
    }

    /// Per-node fixed delay, in milliseconds, applied to every inbound frame.
    pub fn set_delay_ms(&self, ms: u64) {
        *self.delay_ms.lock().unwrap() = ms;
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.lock().await.len()
    }

    pub async fn peer_ids(&self) -> Vec<String> {
        self.peers.lock().await.keys().cloned().collect()
    }

    pub async fn peer_summaries(&self) -> Vec<PeerSummary> {
        self.peers
            .lock()
            .await
            .iter()
            .map(|(id, h)| PeerSummary {
                peer_id: id.clone(),
                host: h.host.clone(),
                port: h.port,
                outbound: h.outbound,
                last_seen: h.last_seen,
            })
            .collect()
    }

    /// Binds the listener and spawns the accept loop as a background task.
    pub async fn listen(&self, bind_addr: &str) -> Result<(), TransportError> {
        let listener = TcpListener::bind(bind_addr).await.map_err(TransportError::Bind)?;
        let this = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        let this2 = this.clone();
                        tokio::spawn(async move {
                            if let Err(e) = this2.accept_connection(stream).await {
                                eprintln!("[gossip] {addr} inbound handshake failed: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        eprintln!("[gossip] accept error: {e}");
                    }
                }
            }
        });
        *self.listener_handle.lock().await = Some(handle);
        Ok(())
    }

    /// Dials `host:port`, exchanges HELLO, and spawns the connection's
    /// reader/writer tasks. Bounded by `CONNECT_TIMEOUT_MS` (spec §5).
    pub async fn connect(&self, host: &str, port: u16) -> Result<String, TransportError> {
        let addr = format!("{host}:{port}");
        let stream = tokio::time::timeout(
            Duration::from_millis(CONNECT_TIMEOUT_MS),
            TcpStream::connect(&addr),
        )
        .await
        .map_err(|_| TransportError::ConnectTimeout(addr.clone()))?
        .map_err(|e| TransportError::Connect(addr.clone(), e))?;

        let mut framed = FramedStream::new(stream);
        let hello = Message::Hello { peer_id: self.self_id.clone(), listen_port: self.listen_port };
        let envelope = Envelope::wrap(&hello, self.self_id.clone())
            .map_err(|e| TransportError::Handshake(addr.clone(), e.to_string()))?;
        framed
            .send(&envelope)
            .await
            .map_err(|e| TransportError::Handshake(addr.clone(), e.to_string()))?;

        let reply = framed
            .recv()
            .await
            .map_err(|e| TransportError::Handshake(addr.clone(), e.to_string()))?
            .ok_or_else(|| TransportError::Handshake(addr.clone(), "connection closed during handshake".into()))?;
        let peer_id = match reply.unwrap_message() {
            Ok(Message::Hello { peer_id, .. }) => peer_id,
            _ => return Err(TransportError::Handshake(addr.clone(), "expected HELLO".into())),
        };

        self.register_peer(peer_id.clone(), host.to_string(), port, true, framed).await;
        Ok(peer_id)
    }

    async fn accept_connection(&self, stream: TcpStream) -> Result<(), TransportError> {
        let peer_addr = stream.peer_addr().map_err(TransportError::Bind)?;
        let mut framed = FramedStream::new(stream);

        let first = framed
            .recv()
            .await
            .map_err(|e| TransportError::Handshake(peer_addr.to_string(), e.to_string()))?
            .ok_or_else(|| TransportError::Handshake(peer_addr.to_string(), "closed before HELLO".into()))?;
        let (peer_id, peer_port) = match first.unwrap_message() {
            Ok(Message::Hello { peer_id, listen_port }) => (peer_id, listen_port),
            _ => return Err(TransportError::Handshake(peer_addr.to_string(), "expected HELLO".into())),
        };

        let hello = Message::Hello { peer_id: self.self_id.clone(), listen_port: self.listen_port };
        let envelope = Envelope::wrap(&hello, self.self_id.clone())
            .map_err(|e| TransportError::Handshake(peer_addr.to_string(), e.to_string()))?;
        framed
            .send(&envelope)
            .await
            .map_err(|e| TransportError::Handshake(peer_addr.to_string(), e.to_string()))?;

        self.register_peer(peer_id, peer_addr.ip().to_string(), peer_port, false, framed).await;
        Ok(())
    }

    async fn register_peer(&self, peer_id: String, host: String, port: u16, outbound: bool, framed: FramedStream) {
        let queue = Arc::new(Mutex::new(std::collections::VecDeque::new()));
        let notify = Arc::new(Notify::new());
        let (mut read_half, mut write_half) = framed.into_split();

        let this = self.clone();
        let reader_peer_id = peer_id.clone();
        let reader = tokio::spawn(async move {
            loop {
                match read_half.recv().await {
                    Ok(Some(envelope)) => this.handle_frame(&reader_peer_id, envelope).await,
                    Ok(None) => break,
                    Err(e) => {
                        eprintln!("[gossip] {reader_peer_id} read error: {e}");
                        break;
                    }
                }
            }
            this.drop_peer(&reader_peer_id).await;
        });

        let writer_queue = queue.clone();
        let writer_notify = notify.clone();
        let writer = tokio::spawn(async move {
            loop {
                let next = { writer_queue.lock().await.pop_front() };
                match next {
                    Some((msg, origin_id)) => {
                        let envelope = match Envelope::wrap(&msg, origin_id) {
                            Ok(e) => e,
                            Err(_) => continue,
                        };
                        if write_half.send(&envelope).await.is_err() {
                            break;
                        }
                    }
                    None => writer_notify.notified().await,
                }
            }
        });

        let mut peers = self.peers.lock().await;
        peers.insert(
            peer_id,
            PeerHandle { host, port, outbound, last_seen: now_secs(), queue, notify, reader, writer },
        );
    }

    async fn drop_peer(&self, peer_id: &str) {
        self.peers.lock().await.remove(peer_id);
    }

    /// Runs the inbound pipeline (spec §4.5 steps 1-6) for one frame: random
    /// drop, delay, dedup, then hand-off to the orchestrator. Does not
    /// rebroadcast — that is the orchestrator's call.
    async fn handle_frame(&self, from_peer: &str, envelope: Envelope) {
        {
            let mut peers = self.peers.lock().await;
            if let Some(p) = peers.get_mut(from_peer) {
                p.last_seen = now_secs();
            }
        }

        let p = self
            .link_drop_overrides
            .lock()
            .unwrap()
            .get(from_peer)
            .copied()
            .unwrap_or_else(|| *self.drop_probability.lock().unwrap());
        if p > 0.0 && rand::thread_rng().gen_bool(p) {
            return;
        }

        let delay = *self.delay_ms.lock().unwrap();
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let digest = SeenSet::digest(&envelope.payload);
        {
            let mut seen = self.seen.lock().await;
            if seen.check_and_insert(&envelope.kind, &digest) {
                return;
            }
        }

        let Ok(message) = envelope.unwrap_message() else {
            eprintln!("[gossip] {from_peer} sent an undecodable payload for kind {}", envelope.kind);
            return;
        };

        let _ = self.inbound_tx.send(Inbound {
            from_peer: from_peer.to_string(),
            origin_id: envelope.origin_id,
            message,
        });
    }

    /// Sends `msg` to every connected peer except `except`, stamping the
    /// envelope with `origin_id` (spec §4.5 step 7: "re-broadcast ...
    /// propagating the original origin_id"). A locally-originated message
    /// passes this node's own id; a rebroadcast of a received message passes
    /// the `origin_id` carried on the `Inbound` it arrived on, unchanged.
    pub async fn broadcast(&self, msg: Message, origin_id: &str, except: Option<&str>) {
        let peers = self.peers.lock().await;
        for (peer_id, handle) in peers.iter() {
            if Some(peer_id.as_str()) == except {
                continue;
            }
            enqueue(handle, msg.clone(), origin_id.to_string()).await;
        }
    }

    /// Sends `msg` directly to one peer as a message originating here (used
    /// for point-to-point `GET_CHAIN`/`CHAIN_RESPONSE`, which are never
    /// forwarded and so always carry this node's own id as origin).
    pub async fn send_to(&self, peer_id: &str, msg: Message) -> Result<(), TransportError> {
        let peers = self.peers.lock().await;
        let handle = peers.get(peer_id).ok_or_else(|| TransportError::UnknownPeer(peer_id.to_string()))?;
        enqueue(handle, msg, self.self_id.clone()).await;
        Ok(())
    }
}

/// Applies the bounded-queue overflow policy (spec §4.5): a full queue drops
/// the oldest same-kind `NEW_TX` to make room; any other kind's new message
/// is simply dropped (re-request is cheap for `CHAIN_RESPONSE`, and no other
/// kind has a cheaper-to-keep alternative).
async fn enqueue(handle: &PeerHandle, msg: Message, origin_id: String) {
    let mut queue = handle.queue.lock().await;
    if queue.len() >= OUTBOUND_QUEUE_CAPACITY {
        if matches!(msg, Message::NewTx(_)) {
            if let Some(pos) = queue.iter().position(|(m, _)| matches!(m, Message::NewTx(_))) {
                queue.remove(pos);
            } else {
                return;
            }
        } else {
            return;
        }
    }
    queue.push_back((msg, origin_id));
    handle.notify.notify_one();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_establishes_hello_both_ways() {
        let (server, _server_rx) = Transport::new("server".into(), 19001);
        server.listen("127.0.0.1:19001").await.unwrap();

        let (client, _client_rx) = Transport::new("client".into(), 19002);
        let peer_id = client.connect("127.0.0.1", 19001).await.unwrap();
        assert_eq!(peer_id, "server");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(client.peer_count().await, 1);
        assert_eq!(server.peer_count().await, 1);
    }

    #[tokio::test]
    async fn test_message_delivered_and_deduped() {
        let (server, mut server_rx) = Transport::new("server".into(), 19011);
        server.listen("127.0.0.1:19011").await.unwrap();
        let (client, _client_rx) = Transport::new("client".into(), 19012);
        client.connect("127.0.0.1", 19011).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let msg = Message::GetChain { from_index: 0 };
        client.broadcast(msg.clone(), "client", None).await;
        let inbound = tokio::time::timeout(Duration::from_millis(500), server_rx.recv()).await.unwrap().unwrap();
        assert_eq!(inbound.from_peer, "client");
        assert_eq!(inbound.origin_id, "client");

        // Re-send the identical message: it must be deduped, not delivered again.
        client.broadcast(msg, "client", None).await;
        let second = tokio::time::timeout(Duration::from_millis(200), server_rx.recv()).await;
        assert!(second.is_err(), "duplicate message should have been suppressed");
    }

    #[tokio::test]
    async fn test_full_drop_probability_suppresses_delivery() {
        let (server, mut server_rx) = Transport::new("server".into(), 19021);
        server.listen("127.0.0.1:19021").await.unwrap();
        let (client, _client_rx) = Transport::new("client".into(), 19022);
        client.connect("127.0.0.1", 19021).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        server.set_drop_probability(1.0);
        client.broadcast(Message::GetChain { from_index: 1 }, "client", None).await;
        let result = tokio::time::timeout(Duration::from_millis(200), server_rx.recv()).await;
        assert!(result.is_err(), "100% drop probability should suppress delivery");
    }
}
