use futures::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Message, NotificationHub};
use crate::services::{NodeRegistry, RegistryError};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ObserverState {
    Connecting,
    Streaming,
    Closing,
    Closed,
}

/// Caller-side view of one observer's lifecycle.
pub struct ObserverHandle {
    key: String,
    state: watch::Receiver<ObserverState>,
}

impl ObserverHandle {
    pub(super) fn new(key: String, state: watch::Receiver<ObserverState>) -> Self {
        Self { key, state }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    #[cfg(test)]
    pub fn state(&self) -> ObserverState {
        *self.state.borrow()
    }

    /// Resolves once both loops have exited.
    pub async fn closed(&mut self) {
        let _ = self
            .state
            .wait_for(|state| *state == ObserverState::Closed)
            .await;
    }
}

/// Shared by both loops of one observer.
#[derive(Clone)]
pub(super) struct ObserverContext {
    pub hub: Arc<NotificationHub>,
    pub key: String,
    pub id: u64,
    pub cancel: CancellationToken,
    pub state: Arc<watch::Sender<ObserverState>>,
    /// Whether inbound `system_node` updates are accepted.
    pub authenticated: Arc<AtomicBool>,
    /// Direct replies share the observer's outbound queue.
    pub replies: mpsc::Sender<Message>,
}

impl ObserverContext {
    /// Leave the active set and stop the sibling loop. Safe to call from
    /// both loops and from the hub.
    fn release(&self) {
        begin_closing(&self.state);
        self.cancel.cancel();
        self.hub.unregister(&self.key, self.id);
    }
}

pub(super) fn begin_closing(state: &watch::Sender<ObserverState>) {
    state.send_if_modified(|current| {
        if *current < ObserverState::Closing {
            *current = ObserverState::Closing;
            true
        } else {
            false
        }
    });
}

/// Replay the snapshot, then forward queued messages until cancelled or the
/// transport fails.
pub(super) async fn drain_loop<Si>(
    mut sink: Si,
    replay: Vec<Message>,
    mut queue: mpsc::Receiver<Message>,
    ctx: ObserverContext,
) where
    Si: Sink<String> + Unpin + Send,
    Si::Error: Display,
{
    let mut healthy = true;

    for message in &replay {
        if !send(&mut sink, message, &ctx).await {
            healthy = false;
            break;
        }
    }

    while healthy {
        let message = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            message = queue.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        healthy = send(&mut sink, &message, &ctx).await;
    }

    let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await;
    ctx.release();
    debug!(observer = %ctx.key, "Outbound loop finished");
}

async fn send<Si>(sink: &mut Si, message: &Message, ctx: &ObserverContext) -> bool
where
    Si: Sink<String> + Unpin + Send,
    Si::Error: Display,
{
    let text = match serde_json::to_string(message) {
        Ok(text) => text,
        Err(e) => {
            warn!(observer = %ctx.key, kind = message.kind(), "Failed to serialize message: {}", e);
            return true;
        }
    };

    tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => false,
        sent = sink.send(text) => match sent {
            Ok(()) => true,
            Err(e) => {
                debug!(observer = %ctx.key, "Transport send failed: {}", e);
                false
            }
        },
    }
}

/// Read client frames until EOF, error or cancellation.
pub(super) async fn read_loop<St, E>(mut stream: St, registry: Arc<NodeRegistry>, ctx: ObserverContext)
where
    St: Stream<Item = Result<String, E>> + Unpin + Send,
    E: Display,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            frame = stream.next() => frame,
        };

        match frame {
            Some(Ok(text)) => dispatch(&registry, &ctx, &text).await,
            Some(Err(e)) => {
                debug!(observer = %ctx.key, "Transport receive failed: {}", e);
                break;
            }
            None => {
                debug!(observer = %ctx.key, "Observer closed the connection");
                break;
            }
        }
    }

    ctx.release();
    debug!(observer = %ctx.key, "Inbound loop finished");
}

async fn dispatch(registry: &NodeRegistry, ctx: &ObserverContext, text: &str) {
    let observer = ctx.key.as_str();
    let message = match serde_json::from_str::<Message>(text) {
        Ok(message) => message,
        Err(e) => {
            debug!(observer, "Ignoring unrecognized message: {}", e);
            return;
        }
    };

    match message {
        Message::SystemNode { node } => {
            let node_id = node.node_id.clone();
            if !ctx.authenticated.load(Ordering::Acquire) {
                warn!(observer, node_id = %node_id, "Rejecting update from unauthenticated observer");
                return;
            }
            match registry.apply_external_update(node).await {
                Ok(()) => debug!(observer, node_id = %node_id, "Applied update from observer"),
                Err(RegistryError::UnknownNode(_)) => {
                    warn!(observer, node_id = %node_id, "Observer sent update for unknown node")
                }
            }
        }
        Message::Auth { secret } => {
            let accepted = ctx.hub.check_secret(&secret);
            if accepted {
                ctx.authenticated.store(true, Ordering::Release);
                info!(observer, "Observer authenticated");
            } else {
                warn!(observer, "Observer sent a wrong secret");
            }
            reply_status(ctx);
        }
        Message::AuthStatus { .. } => reply_status(ctx),
        other => debug!(observer, kind = other.kind(), "Ignoring inbound message"),
    }
}

fn reply_status(ctx: &ObserverContext) {
    let status = Message::AuthStatus {
        authenticated: ctx.authenticated.load(Ordering::Acquire),
    };
    if let Err(e) = ctx.replies.try_send(status) {
        debug!(observer = %ctx.key, "Dropping auth status reply: {}", e);
    }
}
