// Wire messages: length-prefixed JSON frames carrying one of the five
// gossip message kinds (spec §4.5/§6).
use serde::{Deserialize, Serialize};

use crate::primitives::{Block, Transaction};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    Hello { peer_id: String, listen_port: u16 },
    NewTx(Transaction),
    NewBlock(Block),
    GetChain { from_index: u64 },
    ChainResponse { blocks: Vec<Block> },
}

impl Message {
    /// The tag used both in the wire envelope's `kind` field and the
    /// seen-set key — must distinguish every variant a peer can forward.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "HELLO",
            Message::NewTx(_) => "NEW_TX",
            Message::NewBlock(_) => "NEW_BLOCK",
            Message::GetChain { .. } => "GET_CHAIN",
            Message::ChainResponse { .. } => "CHAIN_RESPONSE",
        }
    }

    /// True for messages the transport broadcasts to all peers except the
    /// sender once accepted; HELLO is peer-to-peer only (spec §4.5).
    pub fn is_broadcastable(&self) -> bool {
        !matches!(self, Message::Hello { .. })
    }
}

/// The envelope actually placed on the wire: `{"kind", "payload", "origin_id"}`
/// in that exact key order, per spec §4.5/§6. `origin_id` is the peer_id of
/// whoever first introduced this message to the network and is propagated
/// unchanged on re-broadcast so every hop can reconstruct provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: String,
    pub payload: serde_json::Value,
    pub origin_id: String,
}

impl Envelope {
    pub fn wrap(msg: &Message, origin_id: String) -> serde_json::Result<Self> {
        Ok(Envelope {
            kind: msg.kind().to_string(),
            payload: serde_json::to_value(msg)?,
            origin_id,
        })
    }

    pub fn unwrap_message(&self) -> serde_json::Result<Message> {
        serde_json::from_value(self.payload.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_roundtrip() {
        let msg = Message::GetChain { from_index: 4 };
        let env = Envelope::wrap(&msg, "node0".to_string()).unwrap();
        assert_eq!(env.kind, "GET_CHAIN");
        assert_eq!(env.origin_id, "node0");
        let decoded = env.unwrap_message().unwrap();
        matches!(decoded, Message::GetChain { from_index: 4 });
    }

    #[test]
    fn test_hello_is_not_broadcastable() {
        let msg = Message::Hello { peer_id: "n0".into(), listen_port: 9000 };
        assert!(!msg.is_broadcastable());
    }
}
