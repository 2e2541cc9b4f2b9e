use crate::types::{GlobalStats, Node};

/// Which view of the fleet a node record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeScope {
    /// Stored (desired) record from `all_known`.
    System,
    /// Observed record from `currently_online`.
    Current,
}

#[derive(Debug, Clone)]
pub enum RegistryEvent {
    NodeDiscovered { node: Node, is_new: bool },
    NodeUpdated { node: Node, scope: NodeScope },
    GlobalStats(GlobalStats),
}

/// Receives registry events. Called while the registry lock is held, so
/// implementations must not block.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: RegistryEvent);
}

#[cfg(test)]
#[derive(Default)]
pub struct RecordingSink {
    events: parking_lot::Mutex<Vec<RegistryEvent>>,
}

#[cfg(test)]
impl RecordingSink {
    pub fn events(&self) -> Vec<RegistryEvent> {
        self.events.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

#[cfg(test)]
impl EventSink for RecordingSink {
    fn publish(&self, event: RegistryEvent) {
        self.events.lock().push(event);
    }
}
