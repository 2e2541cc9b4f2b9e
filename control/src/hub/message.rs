use serde::{Deserialize, Serialize};

use crate::services::{NodeScope, RegistryEvent};
use crate::types::{GlobalStats, Node};

/// One frame on the real-time channel.
///
/// Serialized as `{"type": "system_node" | "current_node" | "stats" | ..., ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Stored record from the registry's history.
    SystemNode { node: Node },
    /// Latest observed record of an online node.
    CurrentNode { node: Node },
    Stats { stats: GlobalStats },
    /// Console login attempt.
    Auth { secret: String },
    /// Login state of the observer. Sent by the hub after `auth`; a console
    /// may send it without a body to ask for its current state.
    AuthStatus {
        #[serde(default)]
        authenticated: bool,
    },
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::SystemNode { .. } => "system_node",
            Message::CurrentNode { .. } => "current_node",
            Message::Stats { .. } => "stats",
            Message::Auth { .. } => "auth",
            Message::AuthStatus { .. } => "auth_status",
        }
    }
}

impl From<RegistryEvent> for Message {
    fn from(event: RegistryEvent) -> Self {
        match event {
            RegistryEvent::NodeDiscovered { node, is_new: true } => Message::SystemNode { node },
            RegistryEvent::NodeDiscovered { node, is_new: false } => Message::CurrentNode { node },
            RegistryEvent::NodeUpdated {
                node,
                scope: NodeScope::System,
            } => Message::SystemNode { node },
            RegistryEvent::NodeUpdated {
                node,
                scope: NodeScope::Current,
            } => Message::CurrentNode { node },
            RegistryEvent::GlobalStats(stats) => Message::Stats { stats },
        }
    }
}
