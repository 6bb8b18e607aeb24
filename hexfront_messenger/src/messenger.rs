// The messenger seam: top-level send/broadcast API plus inbound dispatch.
//
// Both sides of a match implement `Messenger` — the host
// (`server::ServerMessenger`) and each client (`client::ClientMessenger`).
// Game code and the unified invocation layer talk to this trait only; they
// never see sockets or framing.
//
// Inbound envelopes fan out to one of three channels by payload tag:
// 1. generic application listeners (opaque bytes, e.g. moderation notices),
// 2. the invocation handler (awaited calls, their results, and endpoint
//    registration announcements),
// 3. the channel-broadcast handler (fire-and-forget subscriber calls).
//
// The dispatcher also carries node lifecycle notifications (joined/left) so
// the invocation layer can announce endpoints to newcomers and fail calls
// that were waiting on a departed node.
//
// A connection starts reading the moment it is spawned, which can be before
// the invocation layer has attached — the host announces endpoints to a
// newcomer as soon as its handshake lands. Events for a channel with no
// handler yet are therefore buffered and replayed on installation, never
// dropped. Replay may interleave with freshly arriving frames; per-origin
// call numbering puts invocations back in order on the other side of the
// dispatcher.

use std::sync::{Arc, Mutex};

use hexfront_protocol::{EndpointAnnounce, Node, Payload, RemoteMethodCall, RemoteMethodResults};

use crate::error::MessengerError;

/// Listener for opaque application messages. Receives the sending node (when
/// known) and the raw payload bytes.
pub type GenericListener = Box<dyn Fn(Option<&Node>, &[u8]) + Send + Sync>;

/// Sink for the invocation-related channels and node lifecycle events.
/// Implemented by `unified::UnifiedMessenger`; methods run on the dispatch
/// (reader) thread of the connection the message arrived on.
pub trait InvocationHandler: Send + Sync {
    /// An awaited remote call arrived; results must be sent back to its
    /// origin.
    fn invoke(&self, call: RemoteMethodCall);
    /// A fire-and-forget subscriber call arrived; no results are sent.
    fn channel_invoke(&self, call: RemoteMethodCall);
    /// Results answering one of our own pending calls arrived.
    fn results(&self, results: RemoteMethodResults);
    /// Another node announced implementors for a remote name.
    fn endpoint_added(&self, announce: EndpointAnnounce);
    /// Another node withdrew its implementors for a remote name.
    fn endpoint_removed(&self, name: &str, node: &Node);
    /// A node joined the session.
    fn node_joined(&self, node: &Node);
    /// A node left the session; calls pending on it must fail, not hang.
    fn node_left(&self, node: &Node);
}

/// An event held for a handler that has not been installed yet.
enum PendingEvent {
    Invoke(RemoteMethodCall),
    ChannelInvoke(RemoteMethodCall),
    Results(RemoteMethodResults),
    EndpointAdded(EndpointAnnounce),
    EndpointRemoved { name: String, node: Node },
    NodeJoined(Node),
    NodeLeft(Node),
}

#[derive(Default)]
struct HandlerSlot {
    handler: Option<Arc<dyn InvocationHandler>>,
    backlog: Vec<PendingEvent>,
}

fn deliver(handler: &Arc<dyn InvocationHandler>, event: PendingEvent) {
    match event {
        PendingEvent::Invoke(call) => handler.invoke(call),
        PendingEvent::ChannelInvoke(call) => handler.channel_invoke(call),
        PendingEvent::Results(results) => handler.results(results),
        PendingEvent::EndpointAdded(announce) => handler.endpoint_added(announce),
        PendingEvent::EndpointRemoved { name, node } => handler.endpoint_removed(&name, &node),
        PendingEvent::NodeJoined(node) => handler.node_joined(&node),
        PendingEvent::NodeLeft(node) => handler.node_left(&node),
    }
}

/// Routes inbound payloads to the three channels. One per messenger.
#[derive(Default)]
pub struct Dispatcher {
    generic: Mutex<Vec<GenericListener>>,
    invocation: Mutex<HandlerSlot>,
    channel: Mutex<HandlerSlot>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for opaque application messages.
    pub fn add_generic_listener(&self, listener: GenericListener) {
        self.generic.lock().expect("poisoned").push(listener);
    }

    /// Install the handler for awaited calls, results, and announcements.
    /// Events that arrived first are replayed into it immediately.
    pub fn set_invocation_handler(&self, handler: Arc<dyn InvocationHandler>) {
        Self::install(&self.invocation, handler);
    }

    /// Install the handler for fire-and-forget subscriber calls. Events that
    /// arrived first are replayed into it immediately.
    pub fn set_channel_handler(&self, handler: Arc<dyn InvocationHandler>) {
        Self::install(&self.channel, handler);
    }

    fn install(slot: &Mutex<HandlerSlot>, handler: Arc<dyn InvocationHandler>) {
        let backlog = {
            let mut slot = slot.lock().expect("poisoned");
            slot.handler = Some(Arc::clone(&handler));
            std::mem::take(&mut slot.backlog)
        };
        for event in backlog {
            deliver(&handler, event);
        }
    }

    /// Hand `event` to the slot's handler, or buffer it if none is installed.
    fn offer(slot: &Mutex<HandlerSlot>, event: PendingEvent) {
        let delivery = {
            let mut slot = slot.lock().expect("poisoned");
            match &slot.handler {
                Some(handler) => Some(Arc::clone(handler)),
                None => {
                    slot.backlog.push(event);
                    return;
                }
            }
        };
        if let Some(handler) = delivery {
            deliver(&handler, event);
        }
    }

    /// Dispatch one inbound payload. Runs on the reader thread of the
    /// connection it arrived on; a slow handler therefore stalls later
    /// messages from the same sender, which is what preserves per-sender
    /// application order.
    pub fn dispatch(&self, sender: Option<&Node>, payload: Payload) {
        match payload {
            Payload::Generic { data } => {
                let listeners = self.generic.lock().expect("poisoned");
                for listener in listeners.iter() {
                    listener(sender, &data);
                }
            }
            Payload::Invoke(call) => {
                Self::offer(&self.invocation, PendingEvent::Invoke(call));
            }
            Payload::Results(results) => {
                Self::offer(&self.invocation, PendingEvent::Results(results));
            }
            Payload::EndpointAdded(announce) => {
                Self::offer(&self.invocation, PendingEvent::EndpointAdded(announce));
            }
            Payload::EndpointRemoved { name, node } => {
                Self::offer(&self.invocation, PendingEvent::EndpointRemoved { name, node });
            }
            Payload::ChannelInvoke(call) => {
                Self::offer(&self.channel, PendingEvent::ChannelInvoke(call));
            }
        }
    }

    /// Forward a node-joined notification to the invocation handler.
    pub fn notify_node_joined(&self, node: &Node) {
        Self::offer(&self.invocation, PendingEvent::NodeJoined(node.clone()));
    }

    /// Forward a node-left notification to the invocation handler.
    pub fn notify_node_left(&self, node: &Node) {
        Self::offer(&self.invocation, PendingEvent::NodeLeft(node.clone()));
    }
}

/// Location-transparent send/broadcast surface shared by host and clients.
pub trait Messenger: Send + Sync {
    /// Send a payload to one node. A payload addressed to an unknown node is
    /// recorded in the dead-letter log, never surfaced as an error; transport
    /// failure on the local connection is.
    fn send(&self, target: &Node, payload: Payload) -> Result<(), MessengerError>;

    /// Send a payload to every currently known node except self.
    fn broadcast(&self, payload: Payload);

    /// This participant's identity.
    fn local_node(&self) -> Node;

    /// The host's identity.
    fn server_node(&self) -> Node;

    /// The inbound dispatch table for this messenger.
    fn dispatcher(&self) -> &Dispatcher;
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use hexfront_protocol::{CallId, CallNumber};

    use super::*;

    fn sample_call(method: &str) -> RemoteMethodCall {
        RemoteMethodCall {
            remote_name: "Echo".into(),
            method: method.into(),
            args: vec![],
            call_id: CallId(0),
            call_number: CallNumber(0),
            origin: Node::new("guest", "127.0.0.1:1".parse().unwrap()),
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        invoked: Mutex<Vec<String>>,
        joined: Mutex<Vec<Node>>,
    }

    impl InvocationHandler for RecordingHandler {
        fn invoke(&self, call: RemoteMethodCall) {
            self.invoked.lock().unwrap().push(call.method);
        }
        fn channel_invoke(&self, call: RemoteMethodCall) {
            self.invoked.lock().unwrap().push(call.method);
        }
        fn results(&self, _results: RemoteMethodResults) {}
        fn endpoint_added(&self, _announce: EndpointAnnounce) {}
        fn endpoint_removed(&self, _name: &str, _node: &Node) {}
        fn node_joined(&self, node: &Node) {
            self.joined.lock().unwrap().push(node.clone());
        }
        fn node_left(&self, _node: &Node) {}
    }

    #[test]
    fn generic_listeners_all_run() {
        let dispatcher = Dispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let count = Arc::clone(&count);
            dispatcher.add_generic_listener(Box::new(move |_, data| {
                assert_eq!(data, b"notice");
                count.fetch_add(1, Ordering::SeqCst);
            }));
        }

        dispatcher.dispatch(
            None,
            Payload::Generic {
                data: b"notice".to_vec(),
            },
        );
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn events_before_handler_install_are_replayed() {
        let dispatcher = Dispatcher::new();

        // Arrivals while nothing is attached.
        dispatcher.dispatch(None, Payload::Invoke(sample_call("first")));
        let guest = Node::new("guest", "127.0.0.1:1".parse().unwrap());
        dispatcher.notify_node_joined(&guest);
        dispatcher.dispatch(None, Payload::Invoke(sample_call("second")));

        let handler = Arc::new(RecordingHandler::default());
        dispatcher.set_invocation_handler(Arc::clone(&handler) as Arc<dyn InvocationHandler>);

        assert_eq!(*handler.invoked.lock().unwrap(), vec!["first", "second"]);
        assert_eq!(*handler.joined.lock().unwrap(), vec![guest]);

        // Later arrivals go straight through.
        dispatcher.dispatch(None, Payload::Invoke(sample_call("third")));
        assert_eq!(
            *handler.invoked.lock().unwrap(),
            vec!["first", "second", "third"]
        );
    }

    #[test]
    fn channel_backlog_is_separate() {
        let dispatcher = Dispatcher::new();
        dispatcher.dispatch(None, Payload::ChannelInvoke(sample_call("update")));

        let invocation = Arc::new(RecordingHandler::default());
        dispatcher.set_invocation_handler(Arc::clone(&invocation) as Arc<dyn InvocationHandler>);
        assert!(invocation.invoked.lock().unwrap().is_empty());

        let channel = Arc::new(RecordingHandler::default());
        dispatcher.set_channel_handler(Arc::clone(&channel) as Arc<dyn InvocationHandler>);
        assert_eq!(*channel.invoked.lock().unwrap(), vec!["update"]);
    }
}
