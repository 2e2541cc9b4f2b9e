use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::node_registry::NodeRegistry;
use crate::remote::{SessionPool, REACHABILITY_COMMAND};

/// Background task that writes `all_known` to disk every `interval`.
pub async fn save_worker(registry: Arc<NodeRegistry>, interval: Duration, cancel: CancellationToken) {
    info!("Starting state saver (every {:?})", interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        if let Err(e) = registry.save().await {
            error!("State save failed: {:#}", e);
        }
    }

    info!("State saver stopped");
}

/// Background task that drops nodes from `currently_online` once they have
/// not been sighted for `max_age`.
pub async fn prune_worker(
    registry: Arc<NodeRegistry>,
    interval: Duration,
    max_age: Duration,
    cancel: CancellationToken,
) {
    info!("Starting offline pruner (every {:?}, max age {:?})", interval, max_age);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let count = registry.prune(max_age);
        if count > 0 {
            info!("Marked {} node(s) offline due to missing sightings", count);
        }
    }

    info!("Offline pruner stopped");
}

/// Background task that exercises every pooled session each `interval`.
/// Sessions that fail at the connection level are evicted by the pool and
/// redialed on the next sighting of their node.
pub async fn keepalive_worker(
    sessions: Arc<SessionPool>,
    interval: Duration,
    cancel: CancellationToken,
) {
    info!("Starting session keepalive (every {:?})", interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        if sessions.is_closed() {
            break;
        }
        if sessions.is_empty() {
            continue;
        }
        let pooled = sessions.len();

        let mut alive = 0;
        let mut lost = 0;
        sessions
            .run_everywhere(REACHABILITY_COMMAND, |key, result| match result {
                Ok(_) => alive += 1,
                Err(e) => {
                    lost += 1;
                    debug!(address = %key, "Keepalive failed: {}", e);
                }
            })
            .await;

        if lost > 0 {
            info!("Keepalive: {} of {} session(s) alive, {} dropped", alive, pooled, lost);
        } else {
            debug!("Keepalive: {} of {} session(s) alive", alive, pooled);
        }
    }

    info!("Session keepalive stopped");
}
