// Gossip transport: peer connections, wire framing, duplicate suppression,
// and fault injection (spec §4.5).
pub mod framed;
pub mod message;
pub mod seen_set;
pub mod transport;

pub use message::{Envelope, Message};
pub use seen_set::SeenSet;
pub use transport::{Inbound, PeerSummary, Transport, TransportError};
