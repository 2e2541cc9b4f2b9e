use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

use crate::remote::{SessionKey, SessionPool};
use crate::types::{Location, Node, Wireless};

// ============================================================================
// Configuration Diff
// ============================================================================

/// One configuration field that differs between desired and observed state.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigChange {
    Hostname(String),
    Owner(String),
    Location(Location),
    Wireless(Wireless),
}

impl ConfigChange {
    pub fn field(&self) -> &'static str {
        match self {
            ConfigChange::Hostname(_) => "hostname",
            ConfigChange::Owner(_) => "owner",
            ConfigChange::Location(_) => "location",
            ConfigChange::Wireless(_) => "wireless",
        }
    }

    /// Applying a radio change restarts wifi and drops associated clients.
    pub fn is_client_disruptive(&self) -> bool {
        matches!(self, ConfigChange::Wireless(_))
    }

    /// Shell commands that put the node into the desired state.
    pub fn commands(&self) -> Vec<String> {
        match self {
            ConfigChange::Hostname(hostname) => vec![format!(
                "uci set system.@system[0].hostname={}; \
                 uci set wireless.priv_radio0.ssid=\"offline-$(uci get system.@system[0].hostname)\"; \
                 uci set wireless.priv_radio1.ssid=\"offline-$(uci get system.@system[0].hostname)\"; \
                 uci commit; echo $(uci get system.@system[0].hostname) > /proc/sys/kernel/hostname; wifi",
                shell_quote(hostname)
            )],
            ConfigChange::Owner(contact) => vec![format!(
                "uci set gluon-node-info.@owner[0].contact={}; uci commit gluon-node-info;",
                shell_quote(contact)
            )],
            ConfigChange::Location(location) => vec![format!(
                "uci set gluon-node-info.@location[0].latitude='{}'; \
                 uci set gluon-node-info.@location[0].longitude='{}'; \
                 uci set gluon-node-info.@location[0].share_location=1; \
                 uci commit gluon-node-info;",
                location.latitude, location.longitude
            )],
            ConfigChange::Wireless(wireless) => vec![
                radio_command('g', wireless.channel24, wireless.tx_power24),
                radio_command('a', wireless.channel5, wireless.tx_power5),
                "wifi".to_string(),
            ],
        }
    }
}

/// Set channel and power on whichever radio runs the given hwmode band.
fn radio_command(band: char, channel: u32, tx_power: u32) -> String {
    format!(
        "if [ \"$(uci get wireless.radio0.hwmode | grep -c {band})\" -ne 0 ]; then \
         uci set wireless.radio0.channel='{channel}'; uci set wireless.radio0.txpower='{tx_power}'; \
         elif [ \"$(uci get wireless.radio1.hwmode | grep -c {band})\" -ne 0 ]; then \
         uci set wireless.radio1.channel='{channel}'; uci set wireless.radio1.txpower='{tx_power}'; fi;"
    )
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Fields where `observed` deviates from `desired`. Empty when both carry
/// the same configuration, so applying a state twice pushes nothing.
pub fn diff(desired: &Node, observed: &Node) -> Vec<ConfigChange> {
    let mut changes = Vec::new();

    if desired.hostname != observed.hostname {
        changes.push(ConfigChange::Hostname(desired.hostname.clone()));
    }
    if desired.owner_contact != observed.owner_contact {
        changes.push(ConfigChange::Owner(desired.owner_contact.clone()));
    }
    if desired.location != observed.location {
        changes.push(ConfigChange::Location(desired.location));
    }
    if desired.wireless_config != observed.wireless_config {
        changes.push(ConfigChange::Wireless(desired.wireless_config));
    }

    changes
}

// ============================================================================
// Push Queue
// ============================================================================

#[derive(Debug, Clone)]
pub struct PushJob {
    pub node_id: String,
    pub key: SessionKey,
    pub change: ConfigChange,
}

#[derive(Default)]
struct Pending {
    count: AtomicUsize,
    idle: Notify,
}

impl Pending {
    fn done(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

struct Lane {
    id: u64,
    jobs: mpsc::UnboundedSender<PushJob>,
}

type Lanes = Arc<Mutex<HashMap<SessionKey, Lane>>>;

/// Hands configuration pushes to the session pool without blocking the
/// caller. Jobs for one destination run in submission order on a lane task
/// that exits once its queue is empty; different destinations proceed
/// independently.
pub struct PushQueue {
    pool: Arc<SessionPool>,
    lanes: Lanes,
    next_lane: AtomicU64,
    pending: Arc<Pending>,
    closed: AtomicBool,
}

impl PushQueue {
    pub fn new(pool: Arc<SessionPool>) -> Self {
        Self {
            pool,
            lanes: Arc::new(Mutex::new(HashMap::new())),
            next_lane: AtomicU64::new(1),
            pending: Arc::new(Pending::default()),
            closed: AtomicBool::new(false),
        }
    }

    /// Queue one job per change. Must run inside a Tokio runtime.
    pub fn schedule(&self, node_id: &str, key: &SessionKey, changes: Vec<ConfigChange>) {
        for change in changes {
            self.submit(PushJob {
                node_id: node_id.to_string(),
                key: key.clone(),
                change,
            });
        }
    }

    pub fn submit(&self, job: PushJob) {
        let mut lanes = self.lanes.lock();
        if self.closed.load(Ordering::Acquire) {
            debug!(node_id = %job.node_id, field = job.change.field(), "Push queue closed, dropping job");
            return;
        }
        self.pending.count.fetch_add(1, Ordering::AcqRel);

        let job = match lanes.get(&job.key) {
            Some(lane) => match lane.jobs.send(job) {
                Ok(()) => return,
                Err(mpsc::error::SendError(job)) => job,
            },
            None => job,
        };

        let key = job.key.clone();
        let id = self.next_lane.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        // Cannot fail: the receiver is alive until the lane task drops it.
        let _ = tx.send(job);
        lanes.insert(key.clone(), Lane { id, jobs: tx });
        tokio::spawn(run_lane(
            self.pool.clone(),
            self.lanes.clone(),
            key,
            id,
            rx,
            self.pending.clone(),
        ));
    }

    /// Wait until every job submitted so far has finished.
    pub async fn drain(&self) {
        loop {
            let idle = self.pending.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();

            if self.pending.count.load(Ordering::Acquire) == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Refuse new jobs; jobs already queued still run.
    pub fn close(&self) {
        let mut lanes = self.lanes.lock();
        self.closed.store(true, Ordering::Release);
        lanes.clear();
    }

    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.pending.count.load(Ordering::Acquire)
    }

    #[cfg(test)]
    fn lane_count(&self) -> usize {
        self.lanes.lock().len()
    }
}

async fn run_lane(
    pool: Arc<SessionPool>,
    lanes: Lanes,
    key: SessionKey,
    id: u64,
    mut jobs: mpsc::UnboundedReceiver<PushJob>,
    pending: Arc<Pending>,
) {
    loop {
        let job = match jobs.try_recv() {
            Ok(job) => job,
            Err(_) => {
                // Retire under the lanes lock so no submit slips in between.
                let mut lanes = lanes.lock();
                match jobs.try_recv() {
                    Ok(job) => job,
                    Err(_) => {
                        if lanes.get(&key).is_some_and(|lane| lane.id == id) {
                            lanes.remove(&key);
                        }
                        return;
                    }
                }
            }
        };
        push(&pool, &job).await;
        pending.done();
    }
}

async fn push(pool: &SessionPool, job: &PushJob) {
    let field = job.change.field();

    if job.change.is_client_disruptive() {
        warn!(
            node_id = %job.node_id,
            "Applying wireless change, clients on this node will be disconnected"
        );
    } else {
        info!(node_id = %job.node_id, field, "Pushing configuration change");
    }

    for command in job.change.commands() {
        match pool.run_on(&job.key, &command).await {
            Ok(_) => debug!(node_id = %job.node_id, field, "Remote command applied"),
            Err(e) if e.is_connection_level() => {
                error!(
                    node_id = %job.node_id,
                    field,
                    address = %job.key,
                    "Dropping configuration push, session unavailable: {}", e
                );
                return;
            }
            Err(e) => {
                error!(
                    node_id = %job.node_id,
                    field,
                    command = %command,
                    "Remote command failed: {}", e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::testing::FakeConnector;
    use crate::types::test_node;
    use std::net::IpAddr;

    fn key(ip: &str) -> SessionKey {
        SessionKey::new(ip.parse::<IpAddr>().unwrap(), 22, None)
    }

    #[test]
    fn test_diff_against_itself_is_empty() {
        let node = test_node("a");
        assert!(diff(&node, &node.clone()).is_empty());
    }

    #[test]
    fn test_diff_ignores_stats_and_address() {
        let desired = test_node("a");
        let mut observed = desired.clone();
        observed.stats.clients.total = 9;
        observed.address = Some("fd00::9".parse().unwrap());

        assert!(diff(&desired, &observed).is_empty());
    }

    #[test]
    fn test_diff_reports_desired_values() {
        let desired = test_node("a");
        let mut observed = desired.clone();
        observed.hostname = "drifted".to_string();
        observed.wireless_config.channel24 = 11;

        let changes = diff(&desired, &observed);
        assert_eq!(
            changes,
            vec![
                ConfigChange::Hostname(desired.hostname.clone()),
                ConfigChange::Wireless(desired.wireless_config),
            ]
        );
        assert!(!changes[0].is_client_disruptive());
        assert!(changes[1].is_client_disruptive());
    }

    #[test]
    fn test_wireless_commands_end_with_wifi_restart() {
        let mut node = test_node("a");
        node.wireless_config = Wireless {
            channel24: 13,
            channel5: 100,
            tx_power24: 9,
            tx_power5: 21,
        };

        let commands = ConfigChange::Wireless(node.wireless_config).commands();
        assert_eq!(commands.len(), 3);
        assert!(commands[0].contains("grep -c g"));
        assert!(commands[0].contains("channel='13'"));
        assert!(commands[0].contains("txpower='9'"));
        assert!(commands[1].contains("grep -c a"));
        assert!(commands[1].contains("channel='100'"));
        assert!(commands[1].contains("txpower='21'"));
        assert_eq!(commands[2], "wifi");
    }

    #[test]
    fn test_values_are_shell_quoted() {
        let commands = ConfigChange::Owner("it's me".to_string()).commands();
        assert_eq!(
            commands[0],
            "uci set gluon-node-info.@owner[0].contact='it'\\''s me'; uci commit gluon-node-info;"
        );
    }

    #[tokio::test]
    async fn test_queue_runs_jobs_in_order_and_drains() {
        let connector = Arc::new(FakeConnector::new());
        let queue = PushQueue::new(Arc::new(SessionPool::new(connector.clone())));

        queue.schedule(
            "a",
            &key("fd00::1"),
            vec![
                ConfigChange::Owner("x".to_string()),
                ConfigChange::Wireless(Wireless::default()),
            ],
        );
        queue.drain().await;

        let commands = connector.commands_for("fd00::1".parse().unwrap());
        assert_eq!(commands.len(), 4);
        assert!(commands[0].contains("@owner[0].contact='x'"));
        assert_eq!(commands[3], "wifi");
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_broken_session_drops_rest_of_job() {
        let connector = Arc::new(FakeConnector::new());
        connector.break_on("if [");
        let queue = PushQueue::new(Arc::new(SessionPool::new(connector.clone())));

        queue.schedule(
            "a",
            &key("fd00::1"),
            vec![ConfigChange::Wireless(Wireless::default())],
        );
        queue.drain().await;

        // first radio command broke the session, "wifi" was never sent
        let commands = connector.commands_for("fd00::1".parse().unwrap());
        assert_eq!(commands.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_command_does_not_stop_job() {
        let connector = Arc::new(FakeConnector::new());
        connector.fail_command("if [", 1);
        let queue = PushQueue::new(Arc::new(SessionPool::new(connector.clone())));

        queue.schedule(
            "a",
            &key("fd00::1"),
            vec![ConfigChange::Wireless(Wireless::default())],
        );
        queue.drain().await;

        let commands = connector.commands_for("fd00::1".parse().unwrap());
        assert_eq!(commands.len(), 3);
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test]
    async fn test_idle_lanes_retire() {
        let connector = Arc::new(FakeConnector::new());
        let queue = PushQueue::new(Arc::new(SessionPool::new(connector.clone())));

        queue.schedule("a", &key("fd00::1"), vec![ConfigChange::Owner("x".to_string())]);
        queue.schedule("b", &key("fd00::2"), vec![ConfigChange::Owner("y".to_string())]);
        queue.drain().await;

        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while queue.lane_count() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("lanes must exit once idle");

        // a retired lane is replaced on demand
        queue.schedule("a", &key("fd00::1"), vec![ConfigChange::Owner("z".to_string())]);
        queue.drain().await;
        assert_eq!(connector.commands_for("fd00::1".parse().unwrap()).len(), 2);
    }

    #[tokio::test]
    async fn test_closed_queue_refuses_new_jobs() {
        let connector = Arc::new(FakeConnector::new());
        let queue = PushQueue::new(Arc::new(SessionPool::new(connector.clone())));

        queue.close();
        queue.schedule("a", &key("fd00::1"), vec![ConfigChange::Owner("x".to_string())]);
        queue.drain().await;

        assert_eq!(queue.pending(), 0);
        assert_eq!(queue.lane_count(), 0);
        assert!(connector.commands().is_empty());
    }

    #[tokio::test]
    async fn test_drain_without_work_returns() {
        let queue = PushQueue::new(Arc::new(SessionPool::new(Arc::new(FakeConnector::new()))));
        queue.drain().await;
    }
}
