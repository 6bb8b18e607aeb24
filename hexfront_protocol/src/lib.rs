// hexfront_protocol — wire protocol for Hexfront in-game messaging.
//
// This crate defines the message types, framing, and serialization used by
// the host messenger (`hexfront_messenger::server`) and game clients to
// communicate over TCP. It is shared between both sides and has no
// dependency on game-rule code.
//
// Module overview:
// - `types.rs`:    Identity and ordering types — `Node`, `CallId`,
//                  `CallNumber`.
// - `message.rs`:  Handshake enums, `Envelope`/`Payload`, remote method
//                  call and results types, endpoint announcements.
// - `framing.rs`:  Length-delimited framing over any `Read`/`Write` stream:
//                  4-byte big-endian length prefix, then JSON payload.
//
// Design decisions:
// - **JSON serialization.** Self-describing, exact round-trip of invocation
//   arguments and results, and trivially inspectable on the wire. Binary
//   framing can be swapped in later if bandwidth matters.
// - **Generic payloads as opaque `Vec<u8>`.** The messaging layer never
//   inspects application messages.
// - **No async runtime.** Uses `std::io::Read`/`Write` for framing,
//   compatible with blocking TCP streams and buffered wrappers.

pub mod framing;
pub mod message;
pub mod types;

pub use framing::{MAX_FRAME_SIZE, read_frame, write_frame};
pub use message::{
    CallOutcome, ClientMessage, EndpointAnnounce, Envelope, PROTOCOL_VERSION, Payload,
    RemoteMethodCall, RemoteMethodResults, ServerMessage, Target,
};
pub use types::{CallId, CallNumber, Node};
