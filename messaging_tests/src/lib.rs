// Test harness for messaging integration tests.
//
// Wraps a real `ServerMessenger` (host side) and real `ClientMessenger` +
// `UnifiedMessenger` pairs (client side) with synchronous polling helpers,
// so scenarios read as straight-line code: start host → connect peers →
// register remotes → invoke → assert. All networking uses the same code
// paths as a real game; the only test-specific code is the polling.
//
// See `tests/invocation_pipeline.rs` for the scenarios.

use std::sync::Arc;
use std::time::{Duration, Instant};

use hexfront_messenger::client::{ClientConfig, ClientMessenger};
use hexfront_messenger::messenger::Messenger;
use hexfront_messenger::moderation::ModerationRegistry;
use hexfront_messenger::server::{HostConfig, ServerMessenger};
use hexfront_messenger::unified::UnifiedMessenger;
use hexfront_protocol::Node;

/// Default timeout for blocking poll operations.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Sleep duration between poll attempts.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Invocation bound used by the harness so a broken scenario fails instead
/// of hanging the test run.
pub const HARNESS_INVOKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll until `predicate` holds, panicking with `what` on timeout.
pub fn wait_until(what: &str, predicate: impl Fn() -> bool) {
    let deadline = Instant::now() + POLL_TIMEOUT;
    while !predicate() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// A running host with its invocation layer and moderation registry.
pub struct TestHost {
    pub server: ServerMessenger,
    pub unified: Arc<UnifiedMessenger>,
    pub moderation: ModerationRegistry,
    pub addr: String,
}

impl TestHost {
    /// Bind a host on an ephemeral port.
    pub fn start() -> Self {
        let (server, addr) = ServerMessenger::bind(&HostConfig {
            port: 0,
            ..HostConfig::default()
        })
        .expect("TestHost::start failed to bind");
        let unified = UnifiedMessenger::new(
            Arc::new(server.clone()) as Arc<dyn Messenger>,
            Some(HARNESS_INVOKE_TIMEOUT),
        );
        let moderation = ModerationRegistry::new(server.clone());
        Self {
            server,
            unified,
            moderation,
            addr: addr.to_string(),
        }
    }

    /// The connected node carrying `name`, once the handshake lands.
    pub fn node_named(&self, name: &str) -> Node {
        let deadline = Instant::now() + POLL_TIMEOUT;
        loop {
            if let Some(node) = self.server.nodes().into_iter().find(|n| n.name == name) {
                return node;
            }
            assert!(Instant::now() < deadline, "node {name} never joined");
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

/// A connected client with its invocation layer.
pub struct TestPeer {
    pub messenger: ClientMessenger,
    pub unified: Arc<UnifiedMessenger>,
}

impl TestPeer {
    /// Connect with the harness default invocation timeout.
    pub fn connect(addr: &str, name: &str) -> Self {
        Self::connect_with_timeout(addr, name, Some(HARNESS_INVOKE_TIMEOUT))
    }

    /// Connect with an explicit invocation timeout (`None` = wait forever).
    pub fn connect_with_timeout(addr: &str, name: &str, timeout: Option<Duration>) -> Self {
        let messenger = ClientMessenger::connect(addr, &ClientConfig::new(name))
            .expect("TestPeer::connect failed");
        let unified = UnifiedMessenger::new(
            Arc::new(messenger.clone()) as Arc<dyn Messenger>,
            timeout,
        );
        Self { messenger, unified }
    }

    /// Block until this peer's registry can resolve `name` somewhere.
    pub fn wait_for_remote(&self, name: &str) {
        let registry = self.unified.registry();
        wait_until(&format!("remote {name}"), || {
            registry.has_any_implementor(name)
        });
    }

    /// Block until `name` is gone from this peer's registry.
    pub fn wait_for_remote_gone(&self, name: &str) {
        let registry = self.unified.registry();
        wait_until(&format!("removal of remote {name}"), || {
            !registry.has_any_implementor(name)
        });
    }
}
