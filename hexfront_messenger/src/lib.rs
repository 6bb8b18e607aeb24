// hexfront_messenger — remote invocation and messaging for Hexfront.
//
// This crate is the layer that connects game clients during a multiplayer
// match: it multiplexes method calls on logical "remotes" (game delegates,
// displays, players) over one TCP connection per client, enforces
// single-threaded delegate execution, and delivers invocations exactly once
// and in per-sender order.
//
// Module overview:
// - `connection.rs`: One reader thread + one writer thread per TCP stream,
//                    with a bounded outbound queue and idempotent teardown.
// - `messenger.rs`:  The `Messenger` trait (send/broadcast/identity) and the
//                    three-channel inbound dispatcher.
// - `server.rs`:     Host messenger — listener, handshake, routing table,
//                    forwarding, node lifecycle broadcasts.
// - `client.rs`:     Client messenger — single connection to the host.
// - `endpoint.rs`:   Remote-name registry, method-name handler tables,
//                    call-number counters, per-origin ordered application.
// - `unified.rs`:    `invoke_and_wait` / fire-and-forget invocation over the
//                    endpoint registry, with result aggregation.
// - `delegate.rs`:   Per-thread re-entrancy guard for delegate execution.
// - `moderation.rs`: Session registry and moderator fan-out on the host.
//
// Dependencies: `hexfront_protocol` (wire types and framing). No dependency
// on game-rule code — delegates reach this layer only through the
// `RemoteService` trait.
//
// The host can run standalone (`main.rs`, the `host` binary) or be embedded
// in a game process via `ServerMessenger::bind`.

pub mod client;
pub mod connection;
pub mod delegate;
pub mod endpoint;
pub mod error;
pub mod messenger;
pub mod moderation;
pub mod server;
pub mod unified;

pub use client::{ClientConfig, ClientMessenger};
pub use delegate::{DelegateGuard, enter_delegate_execution, in_delegate_execution};
pub use endpoint::{MethodTable, RemoteService, ServiceError};
pub use error::MessengerError;
pub use messenger::Messenger;
pub use moderation::{ModerationNotice, ModerationRegistry};
pub use server::{HostConfig, ServerMessenger};
pub use unified::UnifiedMessenger;
