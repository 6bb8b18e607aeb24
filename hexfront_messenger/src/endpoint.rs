// Endpoint registry: remote names → implementors, plus ordering state.
//
// Three pieces live here:
// - `RemoteService` / `MethodTable`: the implementor contract. Dispatch is an
//   explicit command-name registry — a string method name mapped to a typed
//   closure — so there is no reflection and no signature matching anywhere.
// - `EndpointRegistry`: the name → implementor mapping for this node, the
//   per-endpoint call-number counters, and the view of which other nodes hold
//   implementors (folded from registration announcements).
// - `OrderedStreams`: receiving-side buffering that applies calls from one
//   origin in strict call-number order even when delivery reorders them.
//
// All registry mutation happens under one mutex per map, so an invocation
// resolving a name sees any concurrent registration either entirely or not
// at all — never a partially-updated implementor set.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use hexfront_protocol::{CallNumber, EndpointAnnounce, Node};
use serde_json::Value;

use crate::error::MessengerError;

/// Error raised by an implementor servicing a call. The message crosses the
/// wire verbatim inside a `CallOutcome::Failed`.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ServiceError(pub String);

impl ServiceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// A concrete object that can service calls to a remote name. Game delegates,
/// displays, and players implement this (usually via `MethodTable`).
pub trait RemoteService: Send + Sync {
    fn service(&self, method: &str, args: &[Value]) -> Result<Value, ServiceError>;
}

type MethodHandler = Box<dyn Fn(&[Value]) -> Result<Value, ServiceError> + Send + Sync>;

/// Explicit method registry: command name → handler closure.
///
/// ```
/// # use hexfront_messenger::endpoint::{MethodTable, RemoteService};
/// # use serde_json::json;
/// let echo = MethodTable::new().on("echo", |args| Ok(args[0].clone()));
/// assert_eq!(echo.service("echo", &[json!("hi")]).unwrap(), json!("hi"));
/// ```
#[derive(Default)]
pub struct MethodTable {
    methods: HashMap<String, MethodHandler>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a handler to a command name. Later bindings replace earlier ones.
    #[must_use]
    pub fn on(
        mut self,
        method: &str,
        handler: impl Fn(&[Value]) -> Result<Value, ServiceError> + Send + Sync + 'static,
    ) -> Self {
        self.methods.insert(method.to_string(), Box::new(handler));
        self
    }
}

impl RemoteService for MethodTable {
    fn service(&self, method: &str, args: &[Value]) -> Result<Value, ServiceError> {
        match self.methods.get(method) {
            Some(handler) => handler(args),
            None => Err(ServiceError(format!("unknown method \"{method}\""))),
        }
    }
}

/// Implementors registered locally under one remote name.
struct LocalEndpoint {
    interface: String,
    single_threaded: bool,
    implementors: Vec<Arc<dyn RemoteService>>,
    /// Held around each implementor call when `single_threaded`, so at most
    /// one call runs at a time for this endpoint.
    exec_lock: Arc<Mutex<()>>,
}

/// Snapshot handed to the executor: the implementor set as it existed at
/// resolution time. In-flight calls complete against this snapshot even if
/// the endpoint is unregistered underneath them.
pub struct EndpointSnapshot {
    pub implementors: Vec<Arc<dyn RemoteService>>,
    pub single_threaded: bool,
    pub exec_lock: Arc<Mutex<()>>,
}

/// Another node's implementors for one remote name, per its announcements.
struct RemoteView {
    interface: String,
    nodes: BTreeMap<Node, u32>,
}

/// The per-node registry: local implementors, call-number counters, and the
/// remote implementor view.
#[derive(Default)]
pub struct EndpointRegistry {
    local: Mutex<HashMap<String, LocalEndpoint>>,
    counters: Mutex<HashMap<String, u64>>,
    remote: Mutex<HashMap<String, RemoteView>>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an implementor under `name`, creating the endpoint on first
    /// registration. Fails if `name` is already bound — locally or by any
    /// announced node — to a different interface.
    pub fn register_local(
        &self,
        name: &str,
        interface: &str,
        single_threaded: bool,
        implementor: Arc<dyn RemoteService>,
    ) -> Result<u32, MessengerError> {
        if let Some(registered) = self.remote_interface_of(name)
            && registered != interface
        {
            return Err(MessengerError::InterfaceMismatch {
                name: name.to_string(),
                registered,
                offered: interface.to_string(),
            });
        }

        let mut local = self.local.lock().expect("poisoned");
        let endpoint = local.entry(name.to_string()).or_insert_with(|| LocalEndpoint {
            interface: interface.to_string(),
            single_threaded,
            implementors: Vec::new(),
            exec_lock: Arc::new(Mutex::new(())),
        });
        if endpoint.interface != interface {
            return Err(MessengerError::InterfaceMismatch {
                name: name.to_string(),
                registered: endpoint.interface.clone(),
                offered: interface.to_string(),
            });
        }
        endpoint.implementors.push(implementor);
        #[expect(clippy::cast_possible_truncation)]
        let count = endpoint.implementors.len() as u32;
        Ok(count)
    }

    /// Remove the local endpoint entirely. Returns true if it existed.
    pub fn unregister_local(&self, name: &str) -> bool {
        self.local.lock().expect("poisoned").remove(name).is_some()
    }

    /// Take the next call number for `name`. Numbers are strictly increasing
    /// and never reused for the lifetime of this registry.
    pub fn take_a_number(&self, name: &str) -> CallNumber {
        let mut counters = self.counters.lock().expect("poisoned");
        let counter = counters.entry(name.to_string()).or_insert(0);
        let number = *counter;
        *counter += 1;
        CallNumber(number)
    }

    /// Snapshot the local implementor set for execution, or None if no local
    /// endpoint exists.
    pub fn snapshot(&self, name: &str) -> Option<EndpointSnapshot> {
        let local = self.local.lock().expect("poisoned");
        local.get(name).map(|ep| EndpointSnapshot {
            implementors: ep.implementors.clone(),
            single_threaded: ep.single_threaded,
            exec_lock: Arc::clone(&ep.exec_lock),
        })
    }

    fn remote_interface_of(&self, name: &str) -> Option<String> {
        let remote = self.remote.lock().expect("poisoned");
        remote.get(name).map(|view| view.interface.clone())
    }

    /// Fold in another node's registration announcement.
    pub fn apply_added(&self, announce: &EndpointAnnounce) {
        let mut remote = self.remote.lock().expect("poisoned");
        let view = remote
            .entry(announce.name.clone())
            .or_insert_with(|| RemoteView {
                interface: announce.interface.clone(),
                nodes: BTreeMap::new(),
            });
        view.nodes
            .insert(announce.node.clone(), announce.implementors);
    }

    /// Fold in another node's withdrawal announcement.
    pub fn apply_removed(&self, name: &str, node: &Node) {
        let mut remote = self.remote.lock().expect("poisoned");
        if let Some(view) = remote.get_mut(name) {
            view.nodes.remove(node);
            if view.nodes.is_empty() {
                remote.remove(name);
            }
        }
    }

    /// Drop a departed node from every remote view.
    pub fn forget_node(&self, node: &Node) {
        let mut remote = self.remote.lock().expect("poisoned");
        remote.retain(|_, view| {
            view.nodes.remove(node);
            !view.nodes.is_empty()
        });
    }

    /// The nodes that must answer an invocation of `name`.
    pub fn remote_nodes(&self, name: &str) -> Vec<Node> {
        let remote = self.remote.lock().expect("poisoned");
        remote
            .get(name)
            .map(|view| view.nodes.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// True if any implementor — local or announced — exists for `name`.
    pub fn has_any_implementor(&self, name: &str) -> bool {
        if self.local.lock().expect("poisoned").contains_key(name) {
            return true;
        }
        self.remote.lock().expect("poisoned").contains_key(name)
    }

    /// Local endpoints as announcements, for re-announcing to a new node.
    pub fn local_announcements(&self, local_node: &Node) -> Vec<EndpointAnnounce> {
        let local = self.local.lock().expect("poisoned");
        local
            .iter()
            .map(|(name, ep)| {
                #[expect(clippy::cast_possible_truncation)]
                let implementors = ep.implementors.len() as u32;
                EndpointAnnounce {
                    name: name.clone(),
                    interface: ep.interface.clone(),
                    single_threaded: ep.single_threaded,
                    node: local_node.clone(),
                    implementors,
                }
            })
            .collect()
    }
}

struct StreamState<T> {
    next: u64,
    buffered: BTreeMap<u64, T>,
}

/// Receiving-side ordering: applies items from one (endpoint, origin) stream
/// in strict call-number order. An item arriving early is buffered until all
/// lower numbers have been applied; an item arriving twice (or below the
/// stream position) is dropped, giving exactly-once application.
///
/// The first number seen from an origin anchors its stream — origins begin
/// numbering before every peer has implementors registered, so a receiver
/// may legitimately join an origin's stream partway through.
#[derive(Default)]
pub struct OrderedStreams<T> {
    streams: Mutex<HashMap<(String, Node), StreamState<T>>>,
}

impl<T> OrderedStreams<T> {
    pub fn new() -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// Offer one arrived item. Returns the items now ready to apply, in call
    /// order: empty when the item was buffered or a duplicate, and possibly
    /// several when this arrival unblocks buffered successors.
    pub fn accept(&self, name: &str, origin: &Node, number: CallNumber, item: T) -> Vec<T> {
        let mut streams = self.streams.lock().expect("poisoned");
        let key = (name.to_string(), origin.clone());
        let state = streams.entry(key).or_insert_with(|| StreamState {
            next: number.0,
            buffered: BTreeMap::new(),
        });

        if number.0 < state.next || state.buffered.contains_key(&number.0) {
            return Vec::new(); // already applied or already queued
        }
        if number.0 > state.next {
            state.buffered.insert(number.0, item);
            return Vec::new();
        }

        let mut ready = vec![item];
        state.next += 1;
        while let Some(next_item) = state.buffered.remove(&state.next) {
            ready.push(next_item);
            state.next += 1;
        }
        ready
    }

    /// Drop all stream state for a departed origin.
    pub fn forget_origin(&self, origin: &Node) {
        let mut streams = self.streams.lock().expect("poisoned");
        streams.retain(|(_, node), _| node != origin);
    }
}
