// Core identity and ordering types for the messaging protocol.
//
// These are lightweight types shared by `message.rs` (wire vocabulary) and
// the messenger's routing/registry code. A `Node` is the addressing unit for
// everything above the transport: envelopes are targeted at nodes, routing
// tables are keyed by nodes, and endpoint implementor counts are tracked per
// node. The two counters (`CallId`, `CallNumber`) are issued by per-messenger
// state, never by process-wide statics, so independent messengers in one
// process (e.g. tests hosting a server and several clients) cannot
// contaminate each other.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Identity of a network participant: a session-unique name plus the address
/// the server observed at handshake time. Equality and hashing use both
/// fields. Immutable once created; dropped when the connection closes.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub address: SocketAddr,
}

impl Node {
    pub fn new(name: impl Into<String>, address: SocketAddr) -> Self {
        Self {
            name: name.into(),
            address,
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.address)
    }
}

/// Correlation ID tying a `RemoteMethodResults` back to the invocation that
/// produced it. Unique per originating messenger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallId(pub u64);

/// Per-endpoint, per-origin sequence number. Receivers apply calls to a
/// single-threaded endpoint in strictly increasing `CallNumber` order,
/// buffering any call that arrives before its predecessors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallNumber(pub u64);
