// Location-transparent remote method invocation.
//
// `UnifiedMessenger` sits between game code and a `Messenger`. Game code
// registers implementors under remote names; invocations resolve to the
// implementors wherever they live — on this node, on others, or both — and
// `invoke_and_wait` blocks the calling thread until every expected node has
// answered.
//
// Wire flow for an awaited call:
//   caller thread: resolve → take_a_number → record pending → send Invoke to
//   each implementor-holding node → run local implementors → block.
//   reader thread (each remote node): order per origin stream → execute under
//   the delegate guard → send Results back to the origin.
//   caller thread: wakes as Results retire expected responders; aggregates.
//
// A caller is unblocked by exactly one of: all results arrived, a needed
// node's connection was lost, or the configured timeout elapsed. Implementor
// failures never propagate past the execution point — they travel as
// `Failed` outcomes, and are rethrown to the caller only when the call had
// exactly one implementor overall, so single-target calls behave like
// ordinary method calls.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use hexfront_protocol::{
    CallId, CallOutcome, EndpointAnnounce, Node, Payload, RemoteMethodCall, RemoteMethodResults,
};
use serde_json::Value;

use crate::delegate::enter_delegate_execution;
use crate::endpoint::{EndpointRegistry, EndpointSnapshot, OrderedStreams, RemoteService};
use crate::error::MessengerError;
use crate::messenger::{InvocationHandler, Messenger};

/// An inbound call waiting in (or released from) an origin's ordering stream.
enum InboundCall {
    /// Results must be sent back to the origin.
    Awaited(RemoteMethodCall),
    /// Fire-and-forget; outcomes are discarded.
    Channel(RemoteMethodCall),
}

struct PendingInvoke {
    expected: BTreeSet<Node>,
    outcomes: Vec<CallOutcome>,
    signal: mpsc::Sender<Result<(), MessengerError>>,
}

/// The endpoint registry plus the invocation engine for one node.
pub struct UnifiedMessenger {
    messenger: Arc<dyn Messenger>,
    registry: EndpointRegistry,
    streams: OrderedStreams<InboundCall>,
    pending: Mutex<HashMap<CallId, PendingInvoke>>,
    next_call_id: AtomicU64,
    invoke_timeout: Option<Duration>,
}

impl UnifiedMessenger {
    /// Create the invocation layer on top of a messenger and install it as
    /// that messenger's invocation and channel handler. `invoke_timeout`
    /// bounds `invoke_and_wait`; `None` blocks indefinitely (the cooperative
    /// LAN-game default).
    pub fn new(messenger: Arc<dyn Messenger>, invoke_timeout: Option<Duration>) -> Arc<Self> {
        let unified = Arc::new(Self {
            messenger,
            registry: EndpointRegistry::new(),
            streams: OrderedStreams::new(),
            pending: Mutex::new(HashMap::new()),
            next_call_id: AtomicU64::new(0),
            invoke_timeout,
        });
        let handler: Arc<dyn InvocationHandler> = Arc::clone(&unified) as _;
        unified
            .messenger
            .dispatcher()
            .set_invocation_handler(Arc::clone(&handler));
        unified.messenger.dispatcher().set_channel_handler(handler);
        unified
    }

    /// Register an implementor under `name` and announce it to all nodes.
    /// Fails if `name` is already bound to a different interface anywhere.
    pub fn register_remote(
        &self,
        name: &str,
        interface: &str,
        single_threaded: bool,
        implementor: Arc<dyn RemoteService>,
    ) -> Result<(), MessengerError> {
        let implementors =
            self.registry
                .register_local(name, interface, single_threaded, implementor)?;
        self.messenger
            .broadcast(Payload::EndpointAdded(EndpointAnnounce {
                name: name.to_string(),
                interface: interface.to_string(),
                single_threaded,
                node: self.messenger.local_node(),
                implementors,
            }));
        Ok(())
    }

    /// Remove this node's implementors for `name` and announce the removal.
    /// Safe from any thread; calls already in flight complete against the
    /// implementor set they resolved.
    pub fn unregister_remote(&self, name: &str) {
        if self.registry.unregister_local(name) {
            self.messenger.broadcast(Payload::EndpointRemoved {
                name: name.to_string(),
                node: self.messenger.local_node(),
            });
        }
    }

    /// Invoke `method` on every implementor of `name` and block until all
    /// results are in. Returns one outcome per implementor (local first,
    /// then remote in arrival order); a single-implementor failure is
    /// rethrown as `InvocationFailed`.
    pub fn invoke_and_wait(
        &self,
        name: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Vec<CallOutcome>, MessengerError> {
        let local = self.registry.snapshot(name);
        let remote_nodes = self.registry.remote_nodes(name);
        if local.is_none() && remote_nodes.is_empty() {
            return Err(MessengerError::RemoteNotFound {
                name: name.to_string(),
            });
        }

        let call = RemoteMethodCall {
            remote_name: name.to_string(),
            method: method.to_string(),
            args,
            call_id: CallId(self.next_call_id.fetch_add(1, Ordering::SeqCst)),
            call_number: self.registry.take_a_number(name),
            origin: self.messenger.local_node(),
        };

        // Record the pending wait before anything is sent so an answer can
        // never race past its bookkeeping.
        let (signal_tx, signal_rx) = mpsc::channel();
        if !remote_nodes.is_empty() {
            self.pending.lock().expect("poisoned").insert(
                call.call_id,
                PendingInvoke {
                    expected: remote_nodes.iter().cloned().collect(),
                    outcomes: Vec::new(),
                    signal: signal_tx,
                },
            );
        }

        for node in &remote_nodes {
            if let Err(err) = self.messenger.send(node, Payload::Invoke(call.clone())) {
                self.pending.lock().expect("poisoned").remove(&call.call_id);
                tracing::debug!(%node, error = %err, "invoke send failed");
                return Err(MessengerError::ConnectionLost { node: node.clone() });
            }
        }

        let mut outcomes = match local {
            Some(snapshot) => execute_snapshot(&snapshot, method, &call.args),
            None => Vec::new(),
        };

        if !remote_nodes.is_empty() {
            let remote = self.await_results(call.call_id, name, method, &signal_rx)?;
            outcomes.extend(remote);
        }

        if outcomes.len() == 1
            && let CallOutcome::Failed(message) = &outcomes[0]
        {
            return Err(MessengerError::InvocationFailed {
                message: message.clone(),
            });
        }
        Ok(outcomes)
    }

    /// Fire-and-forget invocation of every subscriber of `name`, local and
    /// remote. No results are collected; with no subscribers anywhere this
    /// is a no-op, like any other broadcast.
    pub fn invoke(&self, name: &str, method: &str, args: Vec<Value>) {
        let local = self.registry.snapshot(name);
        let remote_nodes = self.registry.remote_nodes(name);
        if local.is_none() && remote_nodes.is_empty() {
            return;
        }

        let call = RemoteMethodCall {
            remote_name: name.to_string(),
            method: method.to_string(),
            args,
            call_id: CallId(self.next_call_id.fetch_add(1, Ordering::SeqCst)),
            call_number: self.registry.take_a_number(name),
            origin: self.messenger.local_node(),
        };

        for node in &remote_nodes {
            if let Err(err) = self.messenger.send(node, Payload::ChannelInvoke(call.clone())) {
                tracing::warn!(%node, error = %err, "channel invoke send failed");
            }
        }

        if let Some(snapshot) = local {
            log_channel_failures(&call, execute_snapshot(&snapshot, method, &call.args));
        }
    }

    /// The registry, exposed for introspection (implementor counts, call
    /// numbers).
    pub fn registry(&self) -> &EndpointRegistry {
        &self.registry
    }

    fn await_results(
        &self,
        call_id: CallId,
        name: &str,
        method: &str,
        signal_rx: &mpsc::Receiver<Result<(), MessengerError>>,
    ) -> Result<Vec<CallOutcome>, MessengerError> {
        let deadline = self.invoke_timeout.map(|timeout| Instant::now() + timeout);
        loop {
            {
                let mut pending = self.pending.lock().expect("poisoned");
                if let Some(entry) = pending.get(&call_id)
                    && entry.expected.is_empty()
                {
                    let entry = pending.remove(&call_id).expect("checked above");
                    return Ok(entry.outcomes);
                }
            }

            let signal = match deadline {
                None => signal_rx
                    .recv()
                    .map_err(|_| MessengerError::ConnectionClosed)?,
                Some(deadline) => {
                    let now = Instant::now();
                    let remaining = deadline.saturating_duration_since(now);
                    match signal_rx.recv_timeout(remaining) {
                        Ok(signal) => signal,
                        Err(RecvTimeoutError::Timeout) => {
                            self.pending.lock().expect("poisoned").remove(&call_id);
                            return Err(MessengerError::Timeout {
                                name: name.to_string(),
                                method: method.to_string(),
                            });
                        }
                        Err(RecvTimeoutError::Disconnected) => {
                            return Err(MessengerError::ConnectionClosed);
                        }
                    }
                }
            };

            if let Err(err) = signal {
                self.pending.lock().expect("poisoned").remove(&call_id);
                return Err(err);
            }
        }
    }

    /// Execute one ordered inbound call on the dispatch thread.
    fn apply_inbound(&self, inbound: InboundCall) {
        match inbound {
            InboundCall::Awaited(call) => {
                // Implementors may have unregistered while the call was in
                // flight; an empty outcome list tells the origin so.
                let outcomes = match self.registry.snapshot(&call.remote_name) {
                    Some(snapshot) => execute_snapshot(&snapshot, &call.method, &call.args),
                    None => Vec::new(),
                };
                let results = RemoteMethodResults {
                    call_id: call.call_id,
                    responder: self.messenger.local_node(),
                    outcomes,
                };
                if let Err(err) = self.messenger.send(&call.origin, Payload::Results(results)) {
                    tracing::warn!(origin = %call.origin, error = %err, "could not return results");
                }
            }
            InboundCall::Channel(call) => {
                if let Some(snapshot) = self.registry.snapshot(&call.remote_name) {
                    log_channel_failures(&call, execute_snapshot(&snapshot, &call.method, &call.args));
                }
            }
        }
    }
}

impl InvocationHandler for UnifiedMessenger {
    fn invoke(&self, call: RemoteMethodCall) {
        let name = call.remote_name.clone();
        let origin = call.origin.clone();
        let number = call.call_number;
        let ready = self
            .streams
            .accept(&name, &origin, number, InboundCall::Awaited(call));
        for inbound in ready {
            self.apply_inbound(inbound);
        }
    }

    fn channel_invoke(&self, call: RemoteMethodCall) {
        let name = call.remote_name.clone();
        let origin = call.origin.clone();
        let number = call.call_number;
        let ready = self
            .streams
            .accept(&name, &origin, number, InboundCall::Channel(call));
        for inbound in ready {
            self.apply_inbound(inbound);
        }
    }

    fn results(&self, results: RemoteMethodResults) {
        let mut pending = self.pending.lock().expect("poisoned");
        let Some(entry) = pending.get_mut(&results.call_id) else {
            // Caller already timed out or failed; late answer is dropped.
            return;
        };
        entry.expected.remove(&results.responder);
        entry.outcomes.extend(results.outcomes);
        let _ = entry.signal.send(Ok(()));
    }

    fn endpoint_added(&self, announce: EndpointAnnounce) {
        self.registry.apply_added(&announce);
    }

    fn endpoint_removed(&self, name: &str, node: &Node) {
        self.registry.apply_removed(name, node);
    }

    fn node_joined(&self, node: &Node) {
        // Bring the newcomer up to date on everything we host.
        for announce in self.registry.local_announcements(&self.messenger.local_node()) {
            if let Err(err) = self
                .messenger
                .send(node, Payload::EndpointAdded(announce))
            {
                tracing::warn!(%node, error = %err, "could not announce endpoints");
            }
        }
    }

    fn node_left(&self, node: &Node) {
        self.registry.forget_node(node);
        self.streams.forget_origin(node);

        let pending = self.pending.lock().expect("poisoned");
        for entry in pending.values() {
            if entry.expected.contains(node) {
                let _ = entry.signal.send(Err(MessengerError::ConnectionLost {
                    node: node.clone(),
                }));
            }
        }
    }
}

fn execute_snapshot(snapshot: &EndpointSnapshot, method: &str, args: &[Value]) -> Vec<CallOutcome> {
    snapshot
        .implementors
        .iter()
        .map(|implementor| {
            // Serializes calls when the endpoint is single-threaded.
            let _serial = snapshot
                .single_threaded
                .then(|| snapshot.exec_lock.lock().expect("poisoned"));
            match enter_delegate_execution() {
                Ok(_guard) => match implementor.service(method, args) {
                    Ok(value) => CallOutcome::Returned(value),
                    Err(err) => CallOutcome::Failed(err.to_string()),
                },
                Err(err) => CallOutcome::Failed(err.to_string()),
            }
        })
        .collect()
}

fn log_channel_failures(call: &RemoteMethodCall, outcomes: Vec<CallOutcome>) {
    for outcome in outcomes {
        if let CallOutcome::Failed(message) = outcome {
            tracing::warn!(
                remote = %call.remote_name,
                method = %call.method,
                %message,
                "channel subscriber failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use hexfront_protocol::CallNumber;
    use serde_json::json;

    use crate::endpoint::{MethodTable, ServiceError};
    use crate::messenger::Dispatcher;

    use super::*;

    fn node(name: &str, port: u16) -> Node {
        Node::new(name, format!("127.0.0.1:{port}").parse().unwrap())
    }

    /// A messenger that records sends instead of hitting the network. Lets
    /// the invocation layer be exercised without sockets.
    struct RecordingMessenger {
        local: Node,
        server: Node,
        sent: Mutex<Vec<(Node, Payload)>>,
        dispatcher: Dispatcher,
    }

    impl RecordingMessenger {
        fn new(local: Node) -> Arc<Self> {
            Arc::new(Self {
                server: local.clone(),
                local,
                sent: Mutex::new(Vec::new()),
                dispatcher: Dispatcher::new(),
            })
        }

        fn sent_to(&self, target: &Node) -> Vec<Payload> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(node, _)| node == target)
                .map(|(_, payload)| payload.clone())
                .collect()
        }
    }

    impl Messenger for RecordingMessenger {
        fn send(&self, target: &Node, payload: Payload) -> Result<(), MessengerError> {
            self.sent.lock().unwrap().push((target.clone(), payload));
            Ok(())
        }

        fn broadcast(&self, _payload: Payload) {}

        fn local_node(&self) -> Node {
            self.local.clone()
        }

        fn server_node(&self) -> Node {
            self.server.clone()
        }

        fn dispatcher(&self) -> &Dispatcher {
            &self.dispatcher
        }
    }

    fn echo_table() -> Arc<dyn RemoteService> {
        Arc::new(MethodTable::new().on("echo", |args| Ok(args[0].clone())))
    }

    fn local_unified() -> (Arc<RecordingMessenger>, Arc<UnifiedMessenger>) {
        let messenger = RecordingMessenger::new(node("host", 4000));
        let unified = UnifiedMessenger::new(
            Arc::clone(&messenger) as Arc<dyn Messenger>,
            Some(Duration::from_secs(5)),
        );
        (messenger, unified)
    }

    #[test]
    fn echo_returns_single_result() {
        let (_messenger, unified) = local_unified();
        unified
            .register_remote("Echo", "IEcho", true, echo_table())
            .unwrap();

        let outcomes = unified
            .invoke_and_wait("Echo", "echo", vec![json!("hello")])
            .unwrap();
        assert_eq!(outcomes, vec![CallOutcome::Returned(json!("hello"))]);
    }

    #[test]
    fn unregistered_name_is_remote_not_found() {
        let (_messenger, unified) = local_unified();
        let err = unified
            .invoke_and_wait("Echo", "echo", vec![json!("hello")])
            .unwrap_err();
        assert!(matches!(err, MessengerError::RemoteNotFound { .. }));
    }

    #[test]
    fn unregister_then_invoke_is_remote_not_found() {
        let (_messenger, unified) = local_unified();
        unified
            .register_remote("Echo", "IEcho", true, echo_table())
            .unwrap();
        unified.unregister_remote("Echo");

        let err = unified
            .invoke_and_wait("Echo", "echo", vec![json!("hello")])
            .unwrap_err();
        assert!(matches!(err, MessengerError::RemoteNotFound { .. }));
    }

    #[test]
    fn single_implementor_failure_is_rethrown() {
        let (_messenger, unified) = local_unified();
        unified
            .register_remote(
                "Battle",
                "IBattle",
                true,
                Arc::new(MethodTable::new().on("resolve", |_| {
                    Err(ServiceError::new("no units in territory"))
                })),
            )
            .unwrap();

        let err = unified
            .invoke_and_wait("Battle", "resolve", vec![])
            .unwrap_err();
        match err {
            MessengerError::InvocationFailed { message } => {
                assert_eq!(message, "no units in territory");
            }
            other => panic!("expected InvocationFailed, got {other}"),
        }
    }

    #[test]
    fn one_failure_among_many_stays_in_outcome_list() {
        let (_messenger, unified) = local_unified();
        unified
            .register_remote("Display", "IDisplay", false, echo_table())
            .unwrap();
        unified
            .register_remote(
                "Display",
                "IDisplay",
                false,
                Arc::new(MethodTable::new().on("echo", |_| Err(ServiceError::new("boom")))),
            )
            .unwrap();
        unified
            .register_remote("Display", "IDisplay", false, echo_table())
            .unwrap();

        let outcomes = unified
            .invoke_and_wait("Display", "echo", vec![json!(1)])
            .unwrap();
        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes.iter().filter(|o| o.is_failed()).count(), 1);
    }

    #[test]
    fn interface_mismatch_on_second_registration() {
        let (_messenger, unified) = local_unified();
        unified
            .register_remote("Echo", "IEcho", true, echo_table())
            .unwrap();
        let err = unified
            .register_remote("Echo", "IDisplay", true, echo_table())
            .unwrap_err();
        assert!(matches!(err, MessengerError::InterfaceMismatch { .. }));
    }

    #[test]
    fn inbound_invoke_returns_results_to_origin() {
        let (messenger, unified) = local_unified();
        unified
            .register_remote("Echo", "IEcho", true, echo_table())
            .unwrap();

        let origin = node("guest", 4001);
        let handler: &dyn InvocationHandler = unified.as_ref();
        handler.invoke(RemoteMethodCall {
            remote_name: "Echo".into(),
            method: "echo".into(),
            args: vec![json!(42)],
            call_id: CallId(9),
            call_number: CallNumber(0),
            origin: origin.clone(),
        });

        let sent = messenger.sent_to(&origin);
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            Payload::Results(results) => {
                assert_eq!(results.call_id, CallId(9));
                assert_eq!(results.responder, node("host", 4000));
                assert_eq!(results.outcomes, vec![CallOutcome::Returned(json!(42))]);
            }
            other => panic!("expected Results, got {other:?}"),
        }
    }

    #[test]
    fn inbound_invoke_after_unregister_returns_empty_results() {
        let (messenger, unified) = local_unified();

        let origin = node("guest", 4001);
        let handler: &dyn InvocationHandler = unified.as_ref();
        handler.invoke(RemoteMethodCall {
            remote_name: "Echo".into(),
            method: "echo".into(),
            args: vec![json!(1)],
            call_id: CallId(3),
            call_number: CallNumber(0),
            origin: origin.clone(),
        });

        let sent = messenger.sent_to(&origin);
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            Payload::Results(results) => assert!(results.outcomes.is_empty()),
            other => panic!("expected Results, got {other:?}"),
        }
    }

    #[test]
    fn out_of_order_arrivals_are_applied_in_call_order() {
        let (messenger, unified) = local_unified();
        let applied = Arc::new(Mutex::new(Vec::new()));
        let applied_ref = Arc::clone(&applied);
        unified
            .register_remote(
                "Moves",
                "IMoves",
                true,
                Arc::new(MethodTable::new().on("apply", move |args| {
                    applied_ref.lock().unwrap().push(args[0].clone());
                    Ok(json!(null))
                })),
            )
            .unwrap();

        let origin = node("guest", 4001);
        let handler: &dyn InvocationHandler = unified.as_ref();
        let call = |number: u64, arg: i64| RemoteMethodCall {
            remote_name: "Moves".into(),
            method: "apply".into(),
            args: vec![json!(arg)],
            call_id: CallId(100 + number),
            call_number: CallNumber(number),
            origin: origin.clone(),
        };

        handler.invoke(call(0, 10));
        handler.invoke(call(2, 30)); // early: must wait for 1
        handler.invoke(call(1, 20));

        assert_eq!(
            *applied.lock().unwrap(),
            vec![json!(10), json!(20), json!(30)]
        );
        // All three calls were answered despite the reorder.
        assert_eq!(messenger.sent_to(&origin).len(), 3);
    }

    #[test]
    fn remote_only_call_fails_when_node_leaves() {
        let (_messenger, unified) = local_unified();
        let guest = node("guest", 4001);
        unified.registry().apply_added(&EndpointAnnounce {
            name: "Echo".into(),
            interface: "IEcho".into(),
            single_threaded: true,
            node: guest.clone(),
            implementors: 1,
        });

        let unified_for_call = Arc::clone(&unified);
        let caller = thread::spawn(move || {
            unified_for_call.invoke_and_wait("Echo", "echo", vec![json!("hi")])
        });

        // Give the caller a moment to block, then drop the node.
        thread::sleep(Duration::from_millis(100));
        let handler: &dyn InvocationHandler = unified.as_ref();
        handler.node_left(&guest);

        let err = caller.join().unwrap().unwrap_err();
        assert!(matches!(err, MessengerError::ConnectionLost { .. }));
    }

    #[test]
    fn remote_only_call_times_out_when_nobody_answers() {
        let messenger = RecordingMessenger::new(node("host", 4000));
        let unified = UnifiedMessenger::new(
            Arc::clone(&messenger) as Arc<dyn Messenger>,
            Some(Duration::from_millis(200)),
        );
        let guest = node("guest", 4001);
        unified.registry().apply_added(&EndpointAnnounce {
            name: "Echo".into(),
            interface: "IEcho".into(),
            single_threaded: true,
            node: guest,
            implementors: 1,
        });

        let err = unified
            .invoke_and_wait("Echo", "echo", vec![json!("hi")])
            .unwrap_err();
        assert!(matches!(err, MessengerError::Timeout { .. }));
    }

    #[test]
    fn remote_results_are_aggregated_with_local() {
        let (messenger, unified) = local_unified();
        unified
            .register_remote("Echo", "IEcho", true, echo_table())
            .unwrap();
        let guest = node("guest", 4001);
        unified.registry().apply_added(&EndpointAnnounce {
            name: "Echo".into(),
            interface: "IEcho".into(),
            single_threaded: true,
            node: guest.clone(),
            implementors: 1,
        });

        let unified_for_call = Arc::clone(&unified);
        let caller =
            thread::spawn(move || unified_for_call.invoke_and_wait("Echo", "echo", vec![json!("x")]));

        // Wait until the invoke reaches the recording messenger, then answer
        // it as the guest would.
        let deadline = Instant::now() + Duration::from_secs(5);
        let call_id = loop {
            if let Some(Payload::Invoke(call)) = messenger.sent_to(&guest).first() {
                break call.call_id;
            }
            assert!(Instant::now() < deadline, "invoke never sent");
            thread::sleep(Duration::from_millis(10));
        };
        let handler: &dyn InvocationHandler = unified.as_ref();
        handler.results(RemoteMethodResults {
            call_id,
            responder: guest,
            outcomes: vec![CallOutcome::Returned(json!("from guest"))],
        });

        let outcomes = caller.join().unwrap().unwrap();
        assert_eq!(
            outcomes,
            vec![
                CallOutcome::Returned(json!("x")),
                CallOutcome::Returned(json!("from guest")),
            ]
        );
    }

    #[test]
    fn concurrent_registration_never_yields_partial_sets() {
        let (_messenger, unified) = local_unified();
        unified
            .register_remote("Echo", "IEcho", false, echo_table())
            .unwrap();

        let stop = Arc::new(Mutex::new(false));
        let registrar = {
            let unified = Arc::clone(&unified);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                for _ in 0..50 {
                    unified
                        .register_remote("Echo", "IEcho", false, echo_table())
                        .unwrap();
                }
                *stop.lock().unwrap() = true;
            })
        };

        // Every invocation sees some complete implementor set: all present
        // implementors answer, so the outcome count equals a then-valid size.
        let mut last_len = 1;
        while !*stop.lock().unwrap() {
            let outcomes = unified
                .invoke_and_wait("Echo", "echo", vec![json!(0)])
                .unwrap();
            assert!(outcomes.len() >= last_len);
            assert!(outcomes.iter().all(|o| !o.is_failed()));
            last_len = outcomes.len();
        }
        registrar.join().unwrap();

        let outcomes = unified
            .invoke_and_wait("Echo", "echo", vec![json!(0)])
            .unwrap();
        assert_eq!(outcomes.len(), 51);
    }

    #[test]
    fn channel_invoke_runs_subscribers_without_reply() {
        let (messenger, unified) = local_unified();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_ref = Arc::clone(&seen);
        unified
            .register_remote(
                "Display",
                "IDisplay",
                false,
                Arc::new(MethodTable::new().on("unit_moved", move |args| {
                    seen_ref.lock().unwrap().push(args[0].clone());
                    Ok(json!(null))
                })),
            )
            .unwrap();

        unified.invoke("Display", "unit_moved", vec![json!("a1")]);
        assert_eq!(*seen.lock().unwrap(), vec![json!("a1")]);

        // No results envelope goes anywhere for channel calls.
        let origin = node("guest", 4001);
        let handler: &dyn InvocationHandler = unified.as_ref();
        handler.channel_invoke(RemoteMethodCall {
            remote_name: "Display".into(),
            method: "unit_moved".into(),
            args: vec![json!("b2")],
            call_id: CallId(50),
            call_number: CallNumber(0),
            origin: origin.clone(),
        });
        assert_eq!(*seen.lock().unwrap(), vec![json!("a1"), json!("b2")]);
        assert!(messenger.sent_to(&origin).is_empty());
    }

    #[test]
    fn late_results_after_timeout_are_dropped() {
        let messenger = RecordingMessenger::new(node("host", 4000));
        let unified = UnifiedMessenger::new(
            Arc::clone(&messenger) as Arc<dyn Messenger>,
            Some(Duration::from_millis(100)),
        );
        let guest = node("guest", 4001);
        unified.registry().apply_added(&EndpointAnnounce {
            name: "Echo".into(),
            interface: "IEcho".into(),
            single_threaded: true,
            node: guest.clone(),
            implementors: 1,
        });

        let err = unified
            .invoke_and_wait("Echo", "echo", vec![json!("hi")])
            .unwrap_err();
        assert!(matches!(err, MessengerError::Timeout { .. }));

        // The late answer must be ignored, not panic or leak.
        let handler: &dyn InvocationHandler = unified.as_ref();
        handler.results(RemoteMethodResults {
            call_id: CallId(0),
            responder: guest,
            outcomes: vec![CallOutcome::Returned(json!("late"))],
        });
        assert!(unified.pending.lock().unwrap().is_empty());
    }
}
