use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::{PoolError, RemoteSession, SessionConnector, SessionKey};

type Slot = Arc<tokio::sync::Mutex<Option<Box<dyn RemoteSession>>>>;
type SlotGuard = OwnedMutexGuard<Option<Box<dyn RemoteSession>>>;

/// Pool of remote sessions, safe to share between tasks.
///
/// Each key owns a slot guarded by an async mutex: commands for the same key
/// queue up on it, commands for different keys run in parallel. A key is
/// only pooled while its session is alive or being established; failed
/// connects and broken sessions remove it.
pub struct SessionPool {
    connector: Arc<dyn SessionConnector>,
    slots: Mutex<HashMap<SessionKey, Slot>>,
    closed: CancellationToken,
}

impl SessionPool {
    pub fn new(connector: Arc<dyn SessionConnector>) -> Self {
        Self {
            connector,
            slots: Mutex::new(HashMap::new()),
            closed: CancellationToken::new(),
        }
    }

    /// Establish a session for `key` unless one is already pooled.
    pub async fn connect(&self, key: &SessionKey) -> Result<(), PoolError> {
        let (slot, mut guard) = self.acquire(key).await?;
        if let Err(e) = self.session(key, &mut guard).await {
            self.evict(key, &slot);
            return Err(e);
        }
        Ok(())
    }

    /// Run `command` on the session for `key`, connecting lazily.
    pub async fn run_on(&self, key: &SessionKey, command: &str) -> Result<String, PoolError> {
        let (slot, guard) = self.acquire(key).await?;
        self.execute(key, &slot, guard, command).await
    }

    /// Run `command` on every live session concurrently, one task per key.
    /// Each outcome reaches `handler` as soon as it is available; a failing
    /// key never cancels the others. Nothing is dialed.
    pub async fn run_everywhere<F>(self: &Arc<Self>, command: &str, mut handler: F)
    where
        F: FnMut(&SessionKey, Result<String, PoolError>),
    {
        let live: Vec<(SessionKey, Slot)> = self
            .slots
            .lock()
            .iter()
            .filter(|(_, slot)| slot.try_lock().map_or(true, |session| session.is_some()))
            .map(|(key, slot)| (key.clone(), slot.clone()))
            .collect();

        let mut tasks = JoinSet::new();
        for (key, slot) in live {
            let pool = Arc::clone(self);
            let command = command.to_string();
            tasks.spawn(async move {
                let result = pool.run_on_live(&key, slot, &command).await;
                (key, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((key, result)) => handler(&key, result),
                Err(e) => error!("Broadcast command task failed: {}", e),
            }
        }
    }

    /// Close every session. Pending and later calls fail with
    /// [`PoolError::Closed`].
    pub async fn close(&self) {
        self.closed.cancel();

        let slots: Vec<(SessionKey, Slot)> = self.slots.lock().drain().collect();
        for (key, slot) in slots {
            let mut guard = slot.lock().await;
            if let Some(mut session) = guard.take() {
                session.close().await;
                debug!(%key, "Closed session");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Run on an already pooled session; never dials.
    async fn run_on_live(
        &self,
        key: &SessionKey,
        slot: Slot,
        command: &str,
    ) -> Result<String, PoolError> {
        let guard = self.lock_slot(slot.clone()).await?;
        if guard.is_none() || !self.is_current(key, &slot) {
            return Err(PoolError::NotConnected(key.to_string()));
        }
        self.execute(key, &slot, guard, command).await
    }

    async fn execute(
        &self,
        key: &SessionKey,
        slot: &Slot,
        mut guard: SlotGuard,
        command: &str,
    ) -> Result<String, PoolError> {
        let session = match self.session(key, &mut guard).await {
            Ok(session) => session,
            Err(e) => {
                self.evict(key, slot);
                return Err(e);
            }
        };

        let result = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(PoolError::Closed),
            result = session.exec(command) => result,
        };

        match result {
            Ok(output) => Ok(output),
            Err(e) if e.is_connection_level() => {
                warn!(%key, "Evicting broken session: {}", e);
                guard.take();
                self.evict(key, slot);
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Lock the slot currently pooled for `key`, creating it if needed.
    /// Waiters on a slot that was evicted meanwhile move to its replacement.
    async fn acquire(&self, key: &SessionKey) -> Result<(Slot, SlotGuard), PoolError> {
        loop {
            let slot = {
                if self.closed.is_cancelled() {
                    return Err(PoolError::Closed);
                }
                let mut slots = self.slots.lock();
                slots.entry(key.clone()).or_default().clone()
            };

            let guard = self.lock_slot(slot.clone()).await?;
            if self.is_current(key, &slot) {
                return Ok((slot, guard));
            }
        }
    }

    async fn lock_slot(&self, slot: Slot) -> Result<SlotGuard, PoolError> {
        let guard = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(PoolError::Closed),
            guard = slot.lock_owned() => guard,
        };
        if self.closed.is_cancelled() {
            return Err(PoolError::Closed);
        }
        Ok(guard)
    }

    fn is_current(&self, key: &SessionKey, slot: &Slot) -> bool {
        self.slots
            .lock()
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
    }

    /// Drop `key` from the pool if it still maps to `slot`.
    fn evict(&self, key: &SessionKey, slot: &Slot) {
        let mut slots = self.slots.lock();
        if slots.get(key).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            slots.remove(key);
        }
    }

    async fn session<'g>(
        &self,
        key: &SessionKey,
        slot: &'g mut Option<Box<dyn RemoteSession>>,
    ) -> Result<&'g mut Box<dyn RemoteSession>, PoolError> {
        let session = match slot.take() {
            Some(session) => session,
            None => {
                let connected = tokio::select! {
                    biased;
                    _ = self.closed.cancelled() => return Err(PoolError::Closed),
                    connected = self.connector.connect(key) => connected,
                };
                let session = connected.map_err(|e| {
                    debug!(%key, "Connect failed: {}", e);
                    PoolError::from(e)
                })?;
                debug!(%key, "Session established");
                session
            }
        };
        Ok(slot.insert(session))
    }
}
