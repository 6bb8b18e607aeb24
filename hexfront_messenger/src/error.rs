// Error taxonomy for the messaging layer.
//
// Transport-level errors (I/O, decode) are connection-local: they tear the
// connection down and notify listeners, never crash the process. Endpoint
// errors are returned to the specific caller. There is no automatic retry
// anywhere in this layer — retry, if desired, belongs to game logic.

use hexfront_protocol::Node;

/// Errors surfaced by the messenger and the unified invocation layer.
#[derive(Debug, thiserror::Error)]
pub enum MessengerError {
    /// No implementor is registered anywhere reachable for this remote name.
    #[error("no remote registered under \"{name}\"")]
    RemoteNotFound { name: String },

    /// A connection needed to complete a call closed mid-flight.
    #[error("connection to {node} lost while a call was pending")]
    ConnectionLost { node: Node },

    /// The local connection is down; nothing can be sent.
    #[error("connection closed")]
    ConnectionClosed,

    /// The single implementor of an invoked remote failed; its error message
    /// is preserved so single-target calls behave like ordinary method calls.
    #[error("remote invocation failed: {message}")]
    InvocationFailed { message: String },

    /// A remote name is already bound to a different interface.
    #[error("remote \"{name}\" is bound to interface {registered}, not {offered}")]
    InterfaceMismatch {
        name: String,
        registered: String,
        offered: String,
    },

    /// A delegate method was entered while the current thread was already
    /// executing one. This is a programming bug, not a recoverable condition.
    #[error("delegate execution re-entered on the same thread")]
    Reentrancy,

    /// The configured invocation timeout elapsed before all results arrived.
    #[error("invocation of {name}.{method} timed out")]
    Timeout { name: String, method: String },

    /// The server refused the handshake.
    #[error("handshake rejected: {reason}")]
    Handshake { reason: String },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
