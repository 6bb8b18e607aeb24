// Client-side messenger: one connection to the host.
//
// `connect()` performs TCP connect + Hello handshake on the calling thread,
// then hands the stream to a `Connection` (reader + writer threads). All
// outbound traffic is wrapped in a `ClientMessage::Envelope` and routed by
// the host; inbound `ServerMessage`s are decoded on the reader thread and
// fed to this messenger's dispatcher.
//
// When the link to the host dies, every node the client knew about is
// reported as departed, so a thread blocked in `invoke_and_wait` receives a
// connection-lost failure instead of hanging forever.

use std::collections::BTreeSet;
use std::net::TcpStream;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use hexfront_protocol::framing::{read_frame, write_frame};
use hexfront_protocol::{ClientMessage, Envelope, Node, PROTOCOL_VERSION, Payload, ServerMessage, Target};

use crate::connection::Connection;
use crate::error::MessengerError;
use crate::messenger::{Dispatcher, Messenger};

/// How long the handshake may take before we give up.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Options for joining a session.
pub struct ClientConfig {
    pub node_name: String,
    pub password: Option<String>,
    /// Outbound frames queued before senders block.
    pub queue_capacity: usize,
}

impl ClientConfig {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            password: None,
            queue_capacity: 64,
        }
    }
}

struct ClientInner {
    local_node: Node,
    server_node: Node,
    peers: Mutex<BTreeSet<Node>>,
    connection: OnceLock<Connection>,
    dispatcher: Dispatcher,
}

/// A client's messenger. Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct ClientMessenger {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for ClientMessenger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientMessenger")
            .field("local_node", &self.inner.local_node)
            .field("server_node", &self.inner.server_node)
            .finish_non_exhaustive()
    }
}

impl ClientMessenger {
    /// Connect to a host, perform the handshake, and spawn the connection
    /// threads. The returned messenger is live and dispatching.
    pub fn connect(addr: &str, config: &ClientConfig) -> Result<Self, MessengerError> {
        let mut stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT)).ok();

        let hello = ClientMessage::Hello {
            protocol_version: PROTOCOL_VERSION,
            node_name: config.node_name.clone(),
            password: config.password.clone(),
        };
        write_frame(&mut stream, &serde_json::to_vec(&hello)?)?;

        let response_bytes = read_frame(&mut stream)?;
        let response: ServerMessage = serde_json::from_slice(&response_bytes)?;
        let (local_node, server_node, peers) = match response {
            ServerMessage::Welcome {
                node,
                server_node,
                peers,
            } => (node, server_node, peers),
            ServerMessage::Rejected { reason } => {
                return Err(MessengerError::Handshake { reason });
            }
            other => {
                return Err(MessengerError::Handshake {
                    reason: format!("unexpected handshake response: {other:?}"),
                });
            }
        };
        stream.set_read_timeout(None).ok();

        let inner = Arc::new(ClientInner {
            local_node,
            server_node,
            peers: Mutex::new(peers.into_iter().collect()),
            connection: OnceLock::new(),
            dispatcher: Dispatcher::new(),
        });

        let frame_inner = Arc::clone(&inner);
        let disconnect_inner = Arc::clone(&inner);
        let connection = Connection::spawn(
            stream,
            config.queue_capacity,
            move |frame| handle_frame(&frame_inner, &frame),
            move || handle_link_down(&disconnect_inner),
        )?;
        inner
            .connection
            .set(connection)
            .unwrap_or_else(|_| unreachable!("connection set once at construction"));

        tracing::info!(node = %inner.local_node, server = %inner.server_node, "joined session");
        Ok(Self { inner })
    }

    /// Nodes this client currently knows about (the host plus other clients).
    pub fn peers(&self) -> Vec<Node> {
        self.inner
            .peers
            .lock()
            .expect("poisoned")
            .iter()
            .cloned()
            .collect()
    }

    pub fn is_connected(&self) -> bool {
        self.inner
            .connection
            .get()
            .is_some_and(Connection::is_open)
    }

    /// Leave gracefully: tell the host goodbye and close the link.
    pub fn disconnect(&self) {
        if let Some(conn) = self.inner.connection.get() {
            if let Ok(frame) = serde_json::to_vec(&ClientMessage::Goodbye) {
                let _ = conn.send(frame);
            }
            conn.close();
        }
    }

    fn connection(&self) -> Result<&Connection, MessengerError> {
        self.inner
            .connection
            .get()
            .ok_or(MessengerError::ConnectionClosed)
    }
}

impl Messenger for ClientMessenger {
    fn send(&self, target: &Node, payload: Payload) -> Result<(), MessengerError> {
        if *target == self.inner.local_node {
            let local = self.inner.local_node.clone();
            self.inner.dispatcher.dispatch(Some(&local), payload);
            return Ok(());
        }
        let envelope = Envelope {
            sender: Some(self.inner.local_node.clone()),
            target: Target::Node(target.clone()),
            payload,
        };
        let frame = serde_json::to_vec(&ClientMessage::Envelope(envelope))?;
        self.connection()?.send(frame)
    }

    fn broadcast(&self, payload: Payload) {
        let envelope = Envelope {
            sender: Some(self.inner.local_node.clone()),
            target: Target::Broadcast,
            payload,
        };
        let frame = match serde_json::to_vec(&ClientMessage::Envelope(envelope)) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::error!(error = %err, "unserializable broadcast");
                return;
            }
        };
        if let Ok(conn) = self.connection()
            && conn.send(frame).is_err()
        {
            tracing::debug!("broadcast dropped: connection closing");
        }
    }

    fn local_node(&self) -> Node {
        self.inner.local_node.clone()
    }

    fn server_node(&self) -> Node {
        self.inner.server_node.clone()
    }

    fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }
}

/// One inbound frame from the host. Runs on the reader thread.
fn handle_frame(inner: &Arc<ClientInner>, frame: &[u8]) {
    match serde_json::from_slice::<ServerMessage>(frame) {
        Ok(ServerMessage::Envelope(envelope)) => {
            inner
                .dispatcher
                .dispatch(envelope.sender.as_ref(), envelope.payload);
        }
        Ok(ServerMessage::NodeJoined { node }) => {
            inner.peers.lock().expect("poisoned").insert(node.clone());
            inner.dispatcher.notify_node_joined(&node);
        }
        Ok(ServerMessage::NodeLeft { node }) => {
            inner.peers.lock().expect("poisoned").remove(&node);
            inner.dispatcher.notify_node_left(&node);
        }
        Ok(ServerMessage::Welcome { .. } | ServerMessage::Rejected { .. }) => {
            tracing::warn!("unexpected handshake message after handshake");
        }
        Err(err) => {
            tracing::warn!(error = %err, "malformed frame from host; disconnecting");
            if let Some(conn) = inner.connection.get() {
                conn.close();
            }
        }
    }
}

/// The link to the host died: report every known node as departed so blocked
/// callers fail with connection-lost instead of hanging.
fn handle_link_down(inner: &Arc<ClientInner>) {
    tracing::info!("connection to host lost");
    let peers: Vec<Node> = inner.peers.lock().expect("poisoned").iter().cloned().collect();
    inner.peers.lock().expect("poisoned").clear();
    for node in peers {
        inner.dispatcher.notify_node_left(&node);
    }
    inner.dispatcher.notify_node_left(&inner.server_node);
}
