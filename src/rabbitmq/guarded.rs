// src/rabbitmq/guarded.rs

use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::{Mutex, MutexGuard};

/// A lazily created, health-checked shared handle.
///
/// Readers take the fast path through the `RwLock` when the current handle is
/// healthy. Recreation is serialized by the async `gate` and re-checks the
/// handle after acquiring it, so tasks racing through first use or a repair
/// converge on a single new handle.
pub struct GuardedSlot<T: ?Sized> {
    current: RwLock<Option<Arc<T>>>,
    gate: Mutex<()>,
}

impl<T: ?Sized> Default for GuardedSlot<T> {
    fn default() -> Self {
        Self {
            current: RwLock::new(None),
            gate: Mutex::new(()),
        }
    }
}

impl<T: ?Sized + Send + Sync> GuardedSlot<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Option<Arc<T>>> {
        self.current.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Option<Arc<T>>> {
        self.current.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// The current handle, if there is one and it passes `healthy`.
    pub fn current_if(&self, healthy: impl Fn(&T) -> bool) -> Option<Arc<T>> {
        self.read().as_ref().filter(|handle| healthy(handle.as_ref())).cloned()
    }

    /// Returns the healthy handle or builds a new one.
    ///
    /// `create` receives the stale handle (if any) so it can dispose of it
    /// before opening the replacement. It runs with the gate held; a failed
    /// `create` leaves the slot empty.
    pub async fn get_or_create<E, F, Fut>(
        &self,
        healthy: impl Fn(&T) -> bool,
        create: F,
    ) -> Result<Arc<T>, E>
    where
        F: FnOnce(Option<Arc<T>>) -> Fut,
        Fut: Future<Output = Result<Arc<T>, E>>,
    {
        if let Some(handle) = self.current_if(&healthy) {
            return Ok(handle);
        }

        let _gate = self.gate.lock().await;

        if let Some(handle) = self.current_if(&healthy) {
            return Ok(handle);
        }

        let stale = self.write().take();
        let fresh = create(stale).await?;
        *self.write() = Some(fresh.clone());
        Ok(fresh)
    }

    /// Empties the slot and hands back the gate so the caller can finish
    /// teardown before anyone else may recreate.
    pub async fn lock_and_take(&self) -> (MutexGuard<'_, ()>, Option<Arc<T>>) {
        let gate = self.gate.lock().await;
        let handle = self.write().take();
        (gate, handle)
    }
}
