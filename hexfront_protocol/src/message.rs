// Protocol messages for client-server messaging during a match.
//
// Two enums define the full handshake-and-transport vocabulary:
// - `ClientMessage`: sent by game clients to the host.
// - `ServerMessage`: sent by the host to game clients.
//
// After the handshake, both directions carry `Envelope`s. An envelope wraps
// one of the payload kinds the messenger dispatches on: opaque application
// messages, remote method invocations (awaited or fire-and-forget), their
// results, and endpoint registration announcements.
//
// Generic payloads are opaque byte blobs (`Vec<u8>`) — the messaging layer
// never inspects them. Invocation arguments and return values are
// `serde_json::Value`, so the wire format is self-describing and a handler
// registry can decode them without any runtime reflection.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{CallId, CallNumber, Node};

/// Bumped whenever the wire vocabulary changes incompatibly. Checked during
/// the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Messages sent by a client to the host.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Join a session (handshake). Must be the first message on a connection.
    Hello {
        protocol_version: u32,
        node_name: String,
        password: Option<String>,
    },
    /// Post-handshake traffic.
    Envelope(Envelope),
    /// Client is leaving gracefully.
    Goodbye,
}

/// Messages sent by the host to a client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Handshake accepted. `node` is the identity the server assigned to
    /// this connection (the name from Hello plus the observed address).
    Welcome {
        node: Node,
        server_node: Node,
        peers: Vec<Node>,
    },
    /// Handshake rejected.
    Rejected { reason: String },
    /// Post-handshake traffic (forwarded or server-originated).
    Envelope(Envelope),
    /// Another node connected.
    NodeJoined { node: Node },
    /// A node disconnected. Pending invocations expecting results from it
    /// must fail rather than hang.
    NodeLeft { node: Node },
}

/// Where an envelope is going.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Target {
    /// Delivered to exactly one node.
    Node(Node),
    /// Delivered to every node except the sender.
    Broadcast,
}

/// A routed message: sender, destination, and one payload. Created per send
/// and consumed immediately on the receiving side.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender: Option<Node>,
    pub target: Target,
    pub payload: Payload,
}

/// The payload kinds the messenger dispatches on. The tag decides which of
/// the three inbound channels handles the message: generic listeners,
/// the invocation handler (Invoke / Results / endpoint announcements), or
/// channel-broadcast subscribers (ChannelInvoke).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// Opaque application message. The messaging layer never inspects it.
    Generic { data: Vec<u8> },
    /// A remote method call whose caller is blocked waiting for results.
    Invoke(RemoteMethodCall),
    /// A fire-and-forget call to channel subscribers. No results are sent.
    ChannelInvoke(RemoteMethodCall),
    /// Results answering an earlier `Invoke`, matched by call ID.
    Results(RemoteMethodResults),
    /// A node registered implementors for a remote name.
    EndpointAdded(EndpointAnnounce),
    /// A node no longer has any implementor for a remote name.
    EndpointRemoved { name: String, node: Node },
}

/// A serialized request to invoke a named method on a named remote.
///
/// `method` is an explicit command name resolved by the receiving handler
/// registry — there is no signature or overload matching on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoteMethodCall {
    pub remote_name: String,
    pub method: String,
    pub args: Vec<Value>,
    pub call_id: CallId,
    pub call_number: CallNumber,
    pub origin: Node,
}

/// Outcome of one implementor servicing a call: exactly one of a returned
/// value or a captured error.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum CallOutcome {
    Returned(Value),
    Failed(String),
}

impl CallOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, CallOutcome::Failed(_))
    }
}

/// One responding node's answer to an `Invoke`: one outcome per implementor
/// that ran there. Empty if the node's implementors unregistered while the
/// call was in flight. `responder` identifies which expected node this
/// answer retires at the waiting caller.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoteMethodResults {
    pub call_id: CallId,
    pub responder: Node,
    pub outcomes: Vec<CallOutcome>,
}

/// Registration announcement: `node` now has `implementors` implementors of
/// `name`, declared against `interface`. Every messenger folds these into
/// its view of which nodes must answer an invocation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EndpointAnnounce {
    pub name: String,
    pub interface: String,
    pub single_threaded: bool,
    pub node: Node,
    pub implementors: u32,
}
