use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use super::events::{EventSink, NodeScope, RegistryEvent};
use super::persistence::{self, PersistedState};
use super::reconciler::{self, PushQueue};
use crate::remote::{SessionKey, SessionPool, REACHABILITY_COMMAND};
use crate::telemetry;
use crate::types::{GlobalStats, Node, NodesResponse};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("node {0} has never been seen")]
    UnknownNode(String),
}

#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub state_path: Option<PathBuf>,
    pub ssh_port: u16,
    pub management_interface: Option<String>,
    pub global_site: String,
    pub global_domain: String,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            state_path: None,
            ssh_port: 22,
            management_interface: None,
            global_site: "global".to_string(),
            global_domain: "global".to_string(),
        }
    }
}

#[derive(Default)]
struct RegistryState {
    all_known: HashMap<String, Node>,
    currently_online: HashMap<String, Node>,
    statistics: Option<GlobalStats>,
}

/// Read access to the registry while its lock is held.
pub struct SnapshotView<'a> {
    state: &'a RegistryState,
}

impl SnapshotView<'_> {
    pub fn all_known(&self) -> impl Iterator<Item = &Node> {
        self.state.all_known.values()
    }

    pub fn currently_online(&self) -> impl Iterator<Item = &Node> {
        self.state.currently_online.values()
    }

    pub fn statistics(&self) -> Option<&GlobalStats> {
        self.state.statistics.as_ref()
    }
}

/// Authoritative fleet state.
///
/// `all_known` holds every node ever seen and doubles as the desired
/// configuration; `currently_online` holds the latest observed record of
/// nodes that passed a reachability check. Both maps sit behind one lock that
/// is never held across remote I/O. Sightings of the same node are
/// serialized so subscribers see its events in application order.
pub struct NodeRegistry {
    state: Mutex<RegistryState>,
    gates: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    sessions: Arc<SessionPool>,
    pushes: PushQueue,
    events: Arc<dyn EventSink>,
    settings: RegistrySettings,
}

impl NodeRegistry {
    pub fn new(
        sessions: Arc<SessionPool>,
        events: Arc<dyn EventSink>,
        settings: RegistrySettings,
    ) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            gates: Mutex::new(HashMap::new()),
            pushes: PushQueue::new(sessions.clone()),
            sessions,
            events,
            settings,
        }
    }

    pub fn session_key(&self, address: IpAddr) -> SessionKey {
        SessionKey::new(
            address,
            self.settings.ssh_port,
            self.settings.management_interface.as_deref(),
        )
    }

    /// Telemetry callback: one call per node and collection cycle.
    pub async fn insert_sighting(&self, nodeinfo: Option<Value>, statistics: Option<Value>) {
        match telemetry::candidate_node(nodeinfo, statistics) {
            Some(candidate) => self.insert_node(candidate).await,
            None => debug!("Ignoring sighting without usable nodeinfo"),
        }
    }

    pub async fn insert_node(&self, mut candidate: Node) {
        let node_id = candidate.node_id.clone();
        let gate = self.gate(&node_id);
        let _serial = gate.lock().await;

        candidate.last_seen = OffsetDateTime::now_utc();

        let address = {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            let stored = match state.all_known.entry(node_id.clone()) {
                Entry::Vacant(slot) => {
                    let stored = slot.insert(candidate.clone());
                    info!(node_id = %node_id, "Discovered new node");
                    self.events.publish(RegistryEvent::NodeDiscovered {
                        node: stored.clone(),
                        is_new: true,
                    });
                    stored
                }
                Entry::Occupied(slot) => {
                    let stored = slot.into_mut();
                    stored.stats = candidate.stats.clone();
                    stored.last_seen = candidate.last_seen;
                    stored.merge_address(candidate.address);
                    stored
                }
            };
            candidate.address = stored.address;

            if let Some(online) = state.currently_online.get_mut(&node_id) {
                *online = candidate;
                self.events.publish(RegistryEvent::NodeUpdated {
                    node: online.clone(),
                    scope: NodeScope::Current,
                });
                return;
            }

            candidate.address
        };

        // Offline until proven reachable.
        let Some(address) = address else {
            debug!(node_id = %node_id, "No management address known, skipping reachability check");
            return;
        };
        let key = self.session_key(address);
        if let Err(e) = self.sessions.connect(&key).await {
            debug!(node_id = %node_id, address = %key, "Node unreachable: {}", e);
            return;
        }
        match self.sessions.run_on(&key, REACHABILITY_COMMAND).await {
            Ok(uptime) => info!(
                node_id = %node_id,
                address = %key,
                "Node reachable, uptime: {}",
                uptime.trim()
            ),
            Err(e) => {
                debug!(node_id = %node_id, address = %key, "Reachability check failed: {}", e);
                return;
            }
        }

        let changes = {
            let mut state = self.state.lock();
            let changes = match state.all_known.get(&node_id) {
                Some(desired) => reconciler::diff(desired, &candidate),
                None => Vec::new(),
            };
            state
                .currently_online
                .insert(node_id.clone(), candidate.clone());
            self.events.publish(RegistryEvent::NodeDiscovered {
                node: candidate,
                is_new: false,
            });
            changes
        };

        if !changes.is_empty() {
            info!(
                node_id = %node_id,
                changes = changes.len(),
                "Node came online with drifted configuration"
            );
            self.pushes.schedule(&node_id, &key, changes);
        }
    }

    /// Desired configuration pushed by an operator console. Only hostname,
    /// owner, location and wireless settings are taken from `update`.
    pub async fn apply_external_update(&self, update: Node) -> Result<(), RegistryError> {
        let gate = self.gate(&update.node_id);
        let _serial = gate.lock().await;

        let (changes, key) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            let Some(stored) = state.all_known.get_mut(&update.node_id) else {
                return Err(RegistryError::UnknownNode(update.node_id));
            };

            let mut merged = stored.clone();
            merged.apply_config(&update);
            if merged.same_config(stored) {
                debug!(node_id = %update.node_id, "External update carries no configuration change");
                return Ok(());
            }

            let changes = reconciler::diff(&merged, stored);
            *stored = merged;
            self.events.publish(RegistryEvent::NodeUpdated {
                node: stored.clone(),
                scope: NodeScope::System,
            });

            let key = if state.currently_online.contains_key(&update.node_id) {
                stored.address.map(|address| self.session_key(address))
            } else {
                None
            };
            (changes, key)
        };

        match key {
            Some(key) => self.pushes.schedule(&update.node_id, &key, changes),
            None => info!(
                node_id = %update.node_id,
                "Node offline, configuration will be pushed when it returns"
            ),
        }
        Ok(())
    }

    /// Aggregate statistics from the collector; only the deployment-wide
    /// scope is kept and forwarded.
    pub fn insert_global_stats(&self, stats: GlobalStats, site: &str, domain: &str) {
        if site != self.settings.global_site || domain != self.settings.global_domain {
            debug!(site, domain, "Ignoring statistics outside the global scope");
            return;
        }

        let mut state = self.state.lock();
        state.statistics = Some(stats.clone());
        self.events.publish(RegistryEvent::GlobalStats(stats));
    }

    /// Run `f` with a consistent view of the registry. No event is published
    /// while `f` runs.
    pub fn snapshot_with<R>(&self, f: impl FnOnce(&SnapshotView<'_>) -> R) -> R {
        let state = self.state.lock();
        f(&SnapshotView { state: &state })
    }

    pub fn snapshot(&self) -> NodesResponse {
        self.snapshot_with(|view| NodesResponse {
            nodes: view
                .all_known()
                .map(|n| (n.node_id.clone(), n.clone()))
                .collect::<BTreeMap<_, _>>(),
            current: view
                .currently_online()
                .map(|n| (n.node_id.clone(), n.clone()))
                .collect::<BTreeMap<_, _>>(),
        })
    }

    pub fn statistics(&self) -> Option<GlobalStats> {
        self.state.lock().statistics.clone()
    }

    #[cfg(test)]
    pub fn is_online(&self, node_id: &str) -> bool {
        self.state.lock().currently_online.contains_key(node_id)
    }

    /// Drop online entries not seen within `max_age`. History is kept.
    pub fn prune(&self, max_age: Duration) -> usize {
        let cutoff = OffsetDateTime::now_utc() - max_age;
        let mut state = self.state.lock();

        let before = state.currently_online.len();
        state.currently_online.retain(|node_id, node| {
            let fresh = node.last_seen >= cutoff;
            if !fresh {
                debug!(node_id = %node_id, "Node went offline");
            }
            fresh
        });
        before - state.currently_online.len()
    }

    /// Persist `all_known`. The lock is only held while copying.
    pub async fn save(&self) -> Result<()> {
        let Some(path) = self.settings.state_path.clone() else {
            return Ok(());
        };

        let snapshot = {
            let state = self.state.lock();
            PersistedState {
                nodes: state
                    .all_known
                    .iter()
                    .map(|(id, node)| (id.clone(), node.clone()))
                    .collect(),
            }
        };

        tokio::task::spawn_blocking(move || persistence::write_state(&path, &snapshot))
            .await
            .context("Task join error")?
    }

    /// Hydrate `all_known` from disk. A missing or unreadable file leaves the
    /// registry empty. Returns the number of nodes restored.
    pub fn load(&self) -> usize {
        let Some(path) = self.settings.state_path.as_deref() else {
            return 0;
        };

        let persisted = match persistence::read_state(path) {
            Ok(Some(persisted)) => persisted,
            Ok(None) => {
                info!("No state file at {:?}, starting with an empty registry", path);
                return 0;
            }
            Err(e) => {
                warn!("Starting with an empty registry: {:#}", e);
                return 0;
            }
        };

        let mut state = self.state.lock();
        for node in persisted.nodes.into_values() {
            state.all_known.insert(node.node_id.clone(), node);
        }
        info!("Restored {} node(s) from {:?}", state.all_known.len(), path);
        state.all_known.len()
    }

    /// Wait for all scheduled configuration pushes to finish.
    pub async fn drain_pushes(&self) {
        self.pushes.drain().await;
    }

    pub fn close_pushes(&self) {
        self.pushes.close();
    }

    fn gate(&self, node_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.gates
            .lock()
            .entry(node_id.to_string())
            .or_default()
            .clone()
    }

    #[cfg(test)]
    fn backdate(&self, node_id: &str, by: Duration) {
        if let Some(node) = self.state.lock().currently_online.get_mut(node_id) {
            node.last_seen -= by;
        }
    }
}
