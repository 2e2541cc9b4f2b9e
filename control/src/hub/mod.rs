//! Real-time fan-out of registry events to connected consoles.
//!
//! Every observer owns a bounded outbound queue. Broadcasting never waits on
//! a consumer: an observer whose queue is full is disconnected instead.
//!
//! When a secret is configured, an observer has to send `auth` with it
//! before its `system_node` updates reach the registry.

mod message;
mod observer;

pub use message::Message;
pub use observer::{ObserverHandle, ObserverState};

use futures::{Sink, Stream};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::services::{EventSink, NodeRegistry, RegistryEvent};
use observer::{begin_closing, drain_loop, read_loop, ObserverContext};

pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

struct ObserverSlot {
    id: u64,
    queue: mpsc::Sender<Message>,
    cancel: CancellationToken,
    state: Arc<watch::Sender<ObserverState>>,
}

impl ObserverSlot {
    fn shut_down(&self) {
        begin_closing(&self.state);
        self.cancel.cancel();
    }
}

pub struct NotificationHub {
    observers: Mutex<HashMap<String, ObserverSlot>>,
    next_id: AtomicU64,
    capacity: usize,
    secret: Option<String>,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            observers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
            secret: None,
        }
    }

    /// Require observers to authenticate before they may change the registry.
    pub fn with_secret(mut self, secret: Option<String>) -> Self {
        self.secret = secret.filter(|secret| !secret.is_empty());
        self
    }

    pub(crate) fn check_secret(&self, candidate: &str) -> bool {
        self.secret.as_deref().is_some_and(|secret| secret == candidate)
    }

    /// Register an observer and start its loops.
    ///
    /// The snapshot is taken and the observer registered in one registry
    /// critical section, so no event is lost or duplicated between the
    /// replay and the live stream. A previous observer with the same key is
    /// disconnected.
    pub fn connect<Si, St, E>(
        self: &Arc<Self>,
        key: impl Into<String>,
        registry: &Arc<NodeRegistry>,
        sink: Si,
        stream: St,
    ) -> ObserverHandle
    where
        Si: Sink<String> + Unpin + Send + 'static,
        Si::Error: Display,
        St: Stream<Item = Result<String, E>> + Unpin + Send + 'static,
        E: Display + Send + 'static,
    {
        let key = key.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (queue, rx) = mpsc::channel(self.capacity);
        let cancel = CancellationToken::new();
        let (state, state_rx) = watch::channel(ObserverState::Connecting);
        let state = Arc::new(state);

        let replay = registry.snapshot_with(|view| {
            let mut replay: Vec<Message> = view
                .all_known()
                .map(|node| Message::SystemNode { node: node.clone() })
                .collect();
            replay.extend(
                view.currently_online()
                    .map(|node| Message::CurrentNode { node: node.clone() }),
            );
            if let Some(stats) = view.statistics() {
                replay.push(Message::Stats {
                    stats: stats.clone(),
                });
            }

            let replaced = self.observers.lock().insert(
                key.clone(),
                ObserverSlot {
                    id,
                    queue: queue.clone(),
                    cancel: cancel.clone(),
                    state: state.clone(),
                },
            );
            if let Some(previous) = replaced {
                info!(observer = %key, "Replacing existing observer with the same key");
                previous.shut_down();
            }
            replay
        });

        info!(observer = %key, replay = replay.len(), "Observer connected");

        let ctx = ObserverContext {
            hub: Arc::clone(self),
            key: key.clone(),
            id,
            cancel,
            state: state.clone(),
            authenticated: Arc::new(AtomicBool::new(self.secret.is_none())),
            replies: queue,
        };
        let outbound = tokio::spawn(drain_loop(sink, replay, rx, ctx.clone()));
        let inbound = tokio::spawn(read_loop(stream, registry.clone(), ctx));

        state.send_if_modified(|current| {
            if *current == ObserverState::Connecting {
                *current = ObserverState::Streaming;
                true
            } else {
                false
            }
        });

        tokio::spawn(async move {
            let _ = outbound.await;
            let _ = inbound.await;
            state.send_replace(ObserverState::Closed);
        });

        ObserverHandle::new(key, state_rx)
    }

    /// Offer `message` to every observer without waiting. Observers that
    /// cannot take it are disconnected.
    pub fn broadcast(&self, message: Message) {
        let mut observers = self.observers.lock();

        observers.retain(|key, slot| match slot.queue.try_send(message.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(observer = %key, "Outbound queue full, disconnecting slow observer");
                slot.shut_down();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(observer = %key, "Dropping observer with closed queue");
                slot.shut_down();
                false
            }
        });
    }

    /// Disconnect `key`. It is out of the active set when this returns; use
    /// [`ObserverHandle::closed`] to wait for its loops.
    pub fn close(&self, key: &str) -> bool {
        match self.observers.lock().remove(key) {
            Some(slot) => {
                slot.shut_down();
                info!(observer = %key, "Observer disconnected");
                true
            }
            None => false,
        }
    }

    pub fn close_all(&self) {
        let keys: Vec<String> = self.observers.lock().keys().cloned().collect();
        for key in keys {
            self.close(&key);
        }
    }

    #[cfg(test)]
    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }

    #[cfg(test)]
    pub fn is_connected(&self, key: &str) -> bool {
        self.observers.lock().contains_key(key)
    }

    /// Remove `key` only if it still belongs to observer `id`.
    fn unregister(&self, key: &str, id: u64) {
        let mut observers = self.observers.lock();
        if observers.get(key).is_some_and(|slot| slot.id == id) {
            observers.remove(key);
            debug!(observer = %key, "Observer unregistered");
        }
    }
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for NotificationHub {
    fn publish(&self, event: RegistryEvent) {
        self.broadcast(Message::from(event));
    }
}
