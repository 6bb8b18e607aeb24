// Host-side messenger: TCP listener, handshake, routing, fan-out.
//
// Architecture: thread-per-reader.
//
// - **Listener thread** (`TcpListener::accept()` loop): accepts new TCP
//   connections and performs the handshake inline — reads `Hello`, validates
//   version/password/name/capacity, answers `Welcome` or `Rejected`.
// - **Reader threads** (one per client, owned by `Connection`): decode
//   `ClientMessage` frames and route envelopes. A directed envelope is
//   forwarded to its target's send queue (or the local dispatcher when the
//   host itself is the target); a broadcast goes to every other client plus
//   the local dispatcher.
//
// Per-origin delivery order is preserved end to end: one reader thread
// forwards in read order into FIFO send queues, and the receiving side
// dispatches on a single reader thread.
//
// A directed envelope for a node that is not connected goes to the
// dead-letter log (a warning), never back to the sender as an error.
// Disconnects prune the routing table, broadcast `NodeLeft`, and notify
// local listeners so pending invocations fail instead of hanging.

use std::collections::BTreeMap;
use std::io::BufWriter;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use hexfront_protocol::framing::{read_frame, write_frame};
use hexfront_protocol::{ClientMessage, Envelope, Node, PROTOCOL_VERSION, Payload, ServerMessage, Target};

use crate::connection::Connection;
use crate::error::MessengerError;
use crate::messenger::{Dispatcher, Messenger};

/// How long a new connection gets to complete its handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Listener for node lifecycle events on the host.
pub type NodeListener = Box<dyn Fn(&Node) + Send + Sync>;

/// Configuration for hosting a session.
pub struct HostConfig {
    pub port: u16,
    pub session_name: String,
    pub server_name: String,
    pub password: Option<String>,
    pub max_nodes: u32,
    /// Outbound frames queued per connection before senders block.
    pub queue_capacity: usize,
    /// Bound on `invoke_and_wait`; `None` blocks indefinitely.
    pub invoke_timeout: Option<Duration>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            port: 7654,
            session_name: "hexfront-session".into(),
            server_name: "server".into(),
            password: None,
            max_nodes: 8,
            queue_capacity: 64,
            invoke_timeout: None,
        }
    }
}

struct ServerInner {
    local_node: Node,
    session_name: String,
    password: Option<String>,
    max_nodes: u32,
    queue_capacity: usize,
    connections: Mutex<BTreeMap<Node, Connection>>,
    dispatcher: Dispatcher,
    joined_listeners: Mutex<Vec<NodeListener>>,
    disconnect_listeners: Mutex<Vec<NodeListener>>,
    keep_running: Arc<AtomicBool>,
}

/// The host's messenger. Cheap to clone; all clones share one session.
#[derive(Clone)]
pub struct ServerMessenger {
    inner: Arc<ServerInner>,
}

impl ServerMessenger {
    /// Bind the listener and start accepting clients. Returns the messenger
    /// and the actual bound address (useful with port 0).
    pub fn bind(config: &HostConfig) -> std::io::Result<(Self, SocketAddr)> {
        let listener = TcpListener::bind(format!("127.0.0.1:{}", config.port))?;
        let addr = listener.local_addr()?;
        let keep_running = Arc::new(AtomicBool::new(true));

        let inner = Arc::new(ServerInner {
            local_node: Node::new(config.server_name.clone(), addr),
            session_name: config.session_name.clone(),
            password: config.password.clone(),
            max_nodes: config.max_nodes,
            queue_capacity: config.queue_capacity,
            connections: Mutex::new(BTreeMap::new()),
            dispatcher: Dispatcher::new(),
            joined_listeners: Mutex::new(Vec::new()),
            disconnect_listeners: Mutex::new(Vec::new()),
            keep_running: Arc::clone(&keep_running),
        });

        // Listener thread: accepts and handshakes new connections. The
        // listener is non-blocking so the thread can observe shutdown.
        listener.set_nonblocking(true)?;
        let accept_inner = Arc::clone(&inner);
        thread::spawn(move || {
            while accept_inner.keep_running.load(Ordering::SeqCst) {
                match listener.accept() {
                    Ok((stream, _addr)) => {
                        stream.set_nonblocking(false).ok();
                        handle_new_connection(&accept_inner, stream);
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(50));
                    }
                    Err(_) => break,
                }
            }
        });

        tracing::info!(%addr, session = %config.session_name, "hosting session");
        Ok((Self { inner }, addr))
    }

    /// The nodes currently connected (not including the host itself).
    pub fn nodes(&self) -> Vec<Node> {
        self.inner
            .connections
            .lock()
            .expect("poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub fn session_name(&self) -> &str {
        &self.inner.session_name
    }

    pub fn is_running(&self) -> bool {
        self.inner.keep_running.load(Ordering::SeqCst)
    }

    /// Run `listener` whenever a node completes its handshake.
    pub fn on_node_joined(&self, listener: NodeListener) {
        self.inner
            .joined_listeners
            .lock()
            .expect("poisoned")
            .push(listener);
    }

    /// Run `listener` whenever a node's connection goes away.
    pub fn on_disconnect(&self, listener: NodeListener) {
        self.inner
            .disconnect_listeners
            .lock()
            .expect("poisoned")
            .push(listener);
    }

    /// Forcibly close one node's connection (moderator boot). The normal
    /// disconnect path handles pruning and notification.
    pub fn disconnect_node(&self, node: &Node) {
        let conn = self
            .inner
            .connections
            .lock()
            .expect("poisoned")
            .get(node)
            .cloned();
        if let Some(conn) = conn {
            conn.close();
        }
    }

    /// Stop accepting, close every connection, end the session.
    pub fn shutdown(&self) {
        self.inner.keep_running.store(false, Ordering::SeqCst);
        let connections: Vec<Connection> = self
            .inner
            .connections
            .lock()
            .expect("poisoned")
            .values()
            .cloned()
            .collect();
        for conn in connections {
            conn.close();
        }
    }
}

impl Messenger for ServerMessenger {
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
        send_or_dead_letter(&self.inner, target, &ServerMessage::Envelope(envelope));
        Ok(())
    }

    fn broadcast(&self, payload: Payload) {
        let envelope = Envelope {
            sender: Some(self.inner.local_node.clone()),
            target: Target::Broadcast,
            payload,
        };
        broadcast_to_clients(&self.inner, &ServerMessage::Envelope(envelope), None);
    }

    fn local_node(&self) -> Node {
        self.inner.local_node.clone()
    }

    fn server_node(&self) -> Node {
        self.inner.local_node.clone()
    }

    fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }
}

/// Serialize and queue a server message for one node; unknown or dying
/// targets go to the dead-letter log.
fn send_or_dead_letter(inner: &ServerInner, target: &Node, message: &ServerMessage) {
    let conn = inner
        .connections
        .lock()
        .expect("poisoned")
        .get(target)
        .cloned();
    let Some(conn) = conn else {
        tracing::warn!(%target, "dead-letter: no connection for target");
        return;
    };
    let frame = match serde_json::to_vec(message) {
        Ok(frame) => frame,
        Err(err) => {
            tracing::error!(error = %err, "unserializable server message");
            return;
        }
    };
    if conn.send(frame).is_err() {
        tracing::warn!(%target, "dead-letter: connection closing");
    }
}

/// Send to every connected client except `skip`. Write errors are tolerated;
/// the dying connection's reader will report the disconnect.
fn broadcast_to_clients(inner: &ServerInner, message: &ServerMessage, skip: Option<&Node>) {
    let frame = match serde_json::to_vec(message) {
        Ok(frame) => frame,
        Err(err) => {
            tracing::error!(error = %err, "unserializable server message");
            return;
        }
    };
    let targets: Vec<(Node, Connection)> = inner
        .connections
        .lock()
        .expect("poisoned")
        .iter()
        .filter(|&(node, _)| skip != Some(node))
        .map(|(node, conn)| (node.clone(), conn.clone()))
        .collect();
    for (node, conn) in targets {
        if conn.send(frame.clone()).is_err() {
            tracing::debug!(%node, "broadcast skipped closing connection");
        }
    }
}

/// Handshake a fresh connection: read Hello, validate, Welcome or Reject,
/// then hand the stream to a `Connection` and announce the join.
fn handle_new_connection(inner: &Arc<ServerInner>, mut stream: TcpStream) {
    stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT)).ok();

    let hello_bytes = match read_frame(&mut stream) {
        Ok(bytes) => bytes,
        Err(_) => return,
    };
    let hello: ClientMessage = match serde_json::from_slice(&hello_bytes) {
        Ok(msg) => msg,
        Err(_) => return,
    };
    let ClientMessage::Hello {
        protocol_version,
        node_name,
        password,
    } = hello
    else {
        // Expected Hello as the first message — drop the connection.
        return;
    };

    if let Err(reason) = validate_hello(inner, protocol_version, &node_name, password.as_deref()) {
        tracing::info!(name = %node_name, %reason, "handshake rejected");
        reject(stream, &reason);
        return;
    }

    let peer_addr = match stream.peer_addr() {
        Ok(addr) => addr,
        Err(_) => return,
    };
    let node = Node::new(node_name, peer_addr);
    stream.set_read_timeout(None).ok();

    // Welcome goes out before the writer thread exists, so it is always the
    // first frame the client sees.
    let mut peers = vec![inner.local_node.clone()];
    peers.extend(inner.connections.lock().expect("poisoned").keys().cloned());
    let welcome = ServerMessage::Welcome {
        node: node.clone(),
        server_node: inner.local_node.clone(),
        peers,
    };
    {
        let mut writer = BufWriter::new(match stream.try_clone() {
            Ok(s) => s,
            Err(_) => return,
        });
        let Ok(frame) = serde_json::to_vec(&welcome) else {
            return;
        };
        if write_frame(&mut writer, &frame).is_err() {
            return;
        }
    }

    let frame_inner = Arc::clone(inner);
    let frame_node = node.clone();
    let disconnect_inner = Arc::clone(inner);
    let disconnect_node = node.clone();
    {
        // The routing table must know the node before anything reacts to its
        // join, or replies and re-announcements targeted at it dead-letter.
        // Holding the lock across spawn+insert stalls the new reader thread
        // until the entry exists.
        let mut connections = inner.connections.lock().expect("poisoned");
        let connection = match Connection::spawn(
            stream,
            inner.queue_capacity,
            move |frame| handle_frame(&frame_inner, &frame_node, &frame),
            move || handle_disconnect(&disconnect_inner, &disconnect_node),
        ) {
            Ok(conn) => conn,
            Err(_) => return,
        };
        connections.insert(node.clone(), connection);
    }
    tracing::info!(%node, "node joined");

    broadcast_to_clients(
        inner,
        &ServerMessage::NodeJoined { node: node.clone() },
        Some(&node),
    );
    inner.dispatcher.notify_node_joined(&node);
    for listener in inner.joined_listeners.lock().expect("poisoned").iter() {
        listener(&node);
    }
}

fn validate_hello(
    inner: &ServerInner,
    protocol_version: u32,
    node_name: &str,
    password: Option<&str>,
) -> Result<(), String> {
    if protocol_version != PROTOCOL_VERSION {
        return Err(format!(
            "protocol version mismatch: host speaks {PROTOCOL_VERSION}, client {protocol_version}"
        ));
    }
    if inner.password.is_some() && password != inner.password.as_deref() {
        return Err("incorrect password".into());
    }
    if node_name == inner.local_node.name {
        return Err("name already taken".into());
    }
    let connections = inner.connections.lock().expect("poisoned");
    if connections.keys().any(|node| node.name == node_name) {
        return Err("name already taken".into());
    }
    if connections.len() as u32 >= inner.max_nodes {
        return Err("session is full".into());
    }
    Ok(())
}

fn reject(stream: TcpStream, reason: &str) {
    let rejected = ServerMessage::Rejected {
        reason: reason.to_string(),
    };
    if let Ok(frame) = serde_json::to_vec(&rejected) {
        let mut writer = BufWriter::new(stream);
        let _ = write_frame(&mut writer, &frame);
    }
}

/// One inbound frame from a handshaken client. Runs on its reader thread.
fn handle_frame(inner: &Arc<ServerInner>, from: &Node, frame: &[u8]) {
    match serde_json::from_slice::<ClientMessage>(frame) {
        Ok(ClientMessage::Envelope(envelope)) => route(inner, from, envelope),
        Ok(ClientMessage::Goodbye) => {
            // Close and let the normal disconnect path do the pruning.
            let conn = inner
                .connections
                .lock()
                .expect("poisoned")
                .get(from)
                .cloned();
            if let Some(conn) = conn {
                conn.close();
            }
        }
        Ok(ClientMessage::Hello { .. }) => {
            tracing::warn!(%from, "unexpected Hello after handshake");
        }
        Err(err) => {
            tracing::warn!(%from, error = %err, "malformed frame; disconnecting");
            let conn = inner
                .connections
                .lock()
                .expect("poisoned")
                .get(from)
                .cloned();
            if let Some(conn) = conn {
                conn.close();
            }
        }
    }
}

fn route(inner: &Arc<ServerInner>, from: &Node, mut envelope: Envelope) {
    // The routing table, not the client, is authoritative about identity.
    envelope.sender = Some(from.clone());

    match envelope.target.clone() {
        Target::Node(target) if target == inner.local_node => {
            inner.dispatcher.dispatch(Some(from), envelope.payload);
        }
        Target::Node(target) => {
            send_or_dead_letter(inner, &target, &ServerMessage::Envelope(envelope));
        }
        Target::Broadcast => {
            broadcast_to_clients(inner, &ServerMessage::Envelope(envelope.clone()), Some(from));
            inner.dispatcher.dispatch(Some(from), envelope.payload);
        }
    }
}

fn handle_disconnect(inner: &Arc<ServerInner>, node: &Node) {
    let removed = inner
        .connections
        .lock()
        .expect("poisoned")
        .remove(node)
        .is_some();
    if !removed {
        return;
    }
    tracing::info!(%node, "node disconnected");

    broadcast_to_clients(inner, &ServerMessage::NodeLeft { node: node.clone() }, None);
    inner.dispatcher.notify_node_left(node);
    for listener in inner.disconnect_listeners.lock().expect("poisoned").iter() {
        listener(node);
    }
}
