// Session registry and moderator fan-out for the host.
//
// Tracks which player is behind each connected node and pushes moderation
// notices (chat relay, mute, boot, shutdown) to every live connection using
// the messenger's broadcast primitive. Broadcast skips a connection that is
// already closing and the disconnect path prunes the session entry, so a
// notice reaches each live connection at most once and a dead connection is
// never an error.
//
// Notices travel on the generic channel as JSON, so clients consume them
// with an ordinary generic listener (`ModerationNotice::decode`).

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use hexfront_protocol::{Node, Payload};
use serde::{Deserialize, Serialize};

use crate::messenger::Messenger;
use crate::server::ServerMessenger;

/// A notice pushed from the host to all clients.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ModerationNotice {
    /// Chat relayed from one player to everyone.
    Chat { from: String, text: String },
    /// A player was muted by a moderator.
    Muted { player: String },
    /// A player was removed from the session by a moderator.
    Booted { player: String },
    /// The host is shutting the session down.
    Shutdown { reason: String },
}

impl ModerationNotice {
    pub fn decode(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

/// Node → player sessions plus the moderator actions that fan out over them.
pub struct ModerationRegistry {
    server: ServerMessenger,
    sessions: Arc<Mutex<BTreeMap<Node, String>>>,
}

impl ModerationRegistry {
    /// Attach to a host messenger. Sessions are created as nodes join (the
    /// node name doubles as the player name) and pruned as they disconnect.
    pub fn new(server: ServerMessenger) -> Self {
        let sessions = Arc::new(Mutex::new(BTreeMap::new()));

        let joined = Arc::clone(&sessions);
        server.on_node_joined(Box::new(move |node| {
            joined
                .lock()
                .expect("poisoned")
                .insert(node.clone(), node.name.clone());
        }));

        let pruned = Arc::clone(&sessions);
        server.on_disconnect(Box::new(move |node| {
            pruned.lock().expect("poisoned").remove(node);
        }));

        Self { server, sessions }
    }

    /// The player behind a node, if it is still connected.
    pub fn player_of(&self, node: &Node) -> Option<String> {
        self.sessions.lock().expect("poisoned").get(node).cloned()
    }

    /// All live sessions, in node order.
    pub fn sessions(&self) -> Vec<(Node, String)> {
        self.sessions
            .lock()
            .expect("poisoned")
            .iter()
            .map(|(node, player)| (node.clone(), player.clone()))
            .collect()
    }

    /// Relay a chat line from `from` to everyone. Unknown senders are
    /// dropped — a node that disconnected mid-send has no session.
    pub fn relay_chat(&self, from: &Node, text: &str) {
        let Some(player) = self.player_of(from) else {
            tracing::debug!(%from, "chat from unknown session dropped");
            return;
        };
        self.push(&ModerationNotice::Chat {
            from: player,
            text: text.to_string(),
        });
    }

    /// Announce a mute to all clients.
    pub fn mute(&self, node: &Node) {
        if let Some(player) = self.player_of(node) {
            self.push(&ModerationNotice::Muted { player });
        }
    }

    /// Remove a player: announce the boot, then drop their connection.
    pub fn boot(&self, node: &Node) {
        if let Some(player) = self.player_of(node) {
            self.push(&ModerationNotice::Booted { player });
        }
        self.server.disconnect_node(node);
    }

    /// End the session: announce the shutdown, then close everything.
    pub fn shutdown(&self, reason: &str) {
        self.push(&ModerationNotice::Shutdown {
            reason: reason.to_string(),
        });
        self.server.shutdown();
    }

    fn push(&self, notice: &ModerationNotice) {
        let data = match serde_json::to_vec(notice) {
            Ok(data) => data,
            Err(err) => {
                tracing::error!(error = %err, "unserializable moderation notice");
                return;
            }
        };
        self.server.broadcast(Payload::Generic { data });
    }
}
