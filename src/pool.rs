//! Bounded reasoning-engine connection pool
//!
//! Owns a fixed number of engine sessions and mediates all access
//! through `acquire`/`release`; no component touches a session outside
//! that protocol. Conservation invariant: every slot is in exactly one
//! of {available, checked-out, being-replaced}, and available +
//! checked-out always equals the configured size.
//!
//! The invariant is structural: a semaphore permit is forgotten on
//! acquire and re-added on release, and a permit always corresponds to
//! exactly one slot. A handle dropped without release (e.g. a worker
//! future aborted by a chunk timeout) recycles its slot from `Drop`, and
//! a slot claimed across a connect await is guarded the same way, so the
//! pool can never leak below size.

use crate::engine::{EngineFailure, EngineRequest, EngineSession, SessionFactory};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Errors from pool operations.
#[derive(Debug, Error)]
pub enum PoolError {
    /// No handle became available within the timeout. Backpressure,
    /// not a fatal condition; the caller may wait and retry.
    #[error("pool exhausted: no handle available within {0:?}")]
    Exhausted(Duration),
    /// The pool is draining and refuses new acquisitions.
    #[error("pool is shutting down")]
    ShuttingDown,
    /// A vacant slot could not be reconnected.
    #[error("failed to establish engine session: {0}")]
    Connect(#[source] EngineFailure),
}

/// What the worker observed about the handle it is returning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The prior call left the session usable
    Healthy,
    /// The prior call failed at the connection level; the session is
    /// disconnected and replaced
    Broken,
}

/// One pool slot: either a ready session or a vacancy awaiting reconnect.
enum Slot {
    Ready(Box<dyn EngineSession>),
    Vacant,
}

struct PoolShared {
    slots: Mutex<Vec<Slot>>,
    permits: Arc<Semaphore>,
    size: usize,
    draining: AtomicBool,
    factory: Arc<dyn SessionFactory>,
}

impl PoolShared {
    fn slots(&self) -> MutexGuard<'_, Vec<Slot>> {
        self.slots.lock().expect("pool slot state poisoned")
    }

    /// Return a slot to the available set and wake one waiter.
    fn restore(&self, slot: Slot) {
        self.slots().push(slot);
        self.permits.add_permits(1);
    }
}

/// Holds a claimed slot across a connect await. If the surrounding
/// future is dropped at that await (a chunk timeout aborting a worker),
/// `Drop` puts the slot back as vacant, so the claim can never outlive
/// the future that made it.
struct SlotClaim<'a> {
    shared: &'a PoolShared,
    armed: bool,
}

impl<'a> SlotClaim<'a> {
    fn new(shared: &'a PoolShared) -> Self {
        Self {
            shared,
            armed: true,
        }
    }

    /// The connect resolved; the slot's disposition is the caller's again.
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for SlotClaim<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!("connect interrupted; slot returned as vacant");
            self.shared.restore(Slot::Vacant);
        }
    }
}

/// An exclusive engine session checked out of the pool.
///
/// Owned by exactly one worker while checked out. Must be returned via
/// `ConnectionPool::release`; if it is dropped instead, the slot is
/// recycled as vacant since the session state is unknown.
pub struct ConnectionHandle {
    id: Uuid,
    session: Option<Box<dyn EngineSession>>,
    shared: Arc<PoolShared>,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl ConnectionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Invoke the engine on this handle's session.
    pub async fn extract(&mut self, request: &EngineRequest) -> Result<String, EngineFailure> {
        match self.session.as_mut() {
            Some(session) => session.extract(request).await,
            // Unreachable via the public API: the session is only taken
            // out during release, which consumes the handle.
            None => Err(EngineFailure::Connection(
                "handle has no session".to_string(),
            )),
        }
    }

    fn take_session(&mut self) -> Option<Box<dyn EngineSession>> {
        self.session.take()
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        if self.session.take().is_some() {
            warn!(handle = %self.id, "handle dropped without release; recycling slot as vacant");
            self.shared.restore(Slot::Vacant);
        }
    }
}

/// Fixed-size pool of reasoning-engine sessions.
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl ConnectionPool {
    /// Create a pool of `size` slots. All slots start vacant; sessions
    /// are connected by `warm_up` or lazily on first acquire.
    pub fn new(factory: Arc<dyn SessionFactory>, size: usize) -> Self {
        let slots = (0..size).map(|_| Slot::Vacant).collect();
        Self {
            shared: Arc::new(PoolShared {
                slots: Mutex::new(slots),
                permits: Arc::new(Semaphore::new(size)),
                size,
                draining: AtomicBool::new(false),
                factory,
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.shared.size
    }

    /// Slots currently in the available set (ready or vacant).
    pub fn available(&self) -> usize {
        self.shared.slots().len()
    }

    /// Handles currently checked out.
    pub fn checked_out(&self) -> usize {
        self.shared.size - self.available()
    }

    /// Eagerly connect every slot by cycling all handles through
    /// acquire/release once. Fails if any session cannot be established.
    pub async fn warm_up(&self) -> Result<(), PoolError> {
        let mut held = Vec::with_capacity(self.shared.size);
        for _ in 0..self.shared.size {
            held.push(self.acquire(Duration::from_secs(30)).await?);
        }
        for handle in held {
            self.release(handle, ReleaseOutcome::Healthy).await;
        }
        info!(size = self.shared.size, "connection pool warmed up");
        Ok(())
    }

    /// Block until a handle is available or the timeout elapses.
    ///
    /// The returned handle is exclusively owned by the caller until it
    /// is passed back to `release`.
    pub async fn acquire(&self, timeout: Duration) -> Result<ConnectionHandle, PoolError> {
        if self.shared.draining.load(Ordering::SeqCst) {
            return Err(PoolError::ShuttingDown);
        }

        let permits = Arc::clone(&self.shared.permits);
        let permit = match tokio::time::timeout(timeout, permits.acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PoolError::ShuttingDown),
            Err(_) => return Err(PoolError::Exhausted(timeout)),
        };

        // Re-check after the wait: shutdown may have started meanwhile.
        // Dropping the permit hands it straight to the drain loop.
        if self.shared.draining.load(Ordering::SeqCst) {
            drop(permit);
            return Err(PoolError::ShuttingDown);
        }
        permit.forget();

        // A forgotten permit always corresponds to exactly one slot.
        let slot = self.shared.slots().pop().unwrap_or(Slot::Vacant);
        let session = match slot {
            Slot::Ready(session) => session,
            Slot::Vacant => {
                let claim = SlotClaim::new(&self.shared);
                match self.shared.factory.connect().await {
                    Ok(session) => {
                        claim.disarm();
                        debug!("reconnected vacant pool slot");
                        session
                    }
                    Err(e) => {
                        drop(claim); // restores the vacant slot
                        return Err(PoolError::Connect(e));
                    }
                }
            }
        };

        Ok(ConnectionHandle {
            id: Uuid::new_v4(),
            session: Some(session),
            shared: Arc::clone(&self.shared),
        })
    }

    /// Return a handle to the pool.
    ///
    /// A healthy handle goes straight back to the available set. A
    /// broken handle's session is disconnected and a fresh session is
    /// connected to replace it before the slot is made available; if the
    /// replacement fails, the slot is left vacant and reconnects lazily
    /// on a later acquire. Pool size is preserved in every case.
    pub async fn release(&self, mut handle: ConnectionHandle, outcome: ReleaseOutcome) {
        let Some(session) = handle.take_session() else {
            return;
        };

        match outcome {
            ReleaseOutcome::Healthy => {
                self.shared.restore(Slot::Ready(session));
            }
            ReleaseOutcome::Broken => {
                drop(session); // disconnect
                let claim = SlotClaim::new(&self.shared);
                match self.shared.factory.connect().await {
                    Ok(fresh) => {
                        claim.disarm();
                        debug!(handle = %handle.id, "replaced broken engine session");
                        self.shared.restore(Slot::Ready(fresh));
                    }
                    Err(e) => {
                        warn!(handle = %handle.id, error = %e,
                              "replacement session failed; slot left vacant");
                        // The claim restores the vacant slot on drop.
                    }
                }
            }
        }
    }

    /// Drain the pool: refuse new acquisitions, wait for every in-flight
    /// handle to come back, then disconnect every session exactly once.
    pub async fn shutdown(&self) {
        if self.shared.draining.swap(true, Ordering::SeqCst) {
            return; // already draining
        }
        for _ in 0..self.shared.size {
            match Arc::clone(&self.shared.permits).acquire_owned().await {
                Ok(permit) => permit.forget(),
                Err(_) => break,
            }
        }
        self.shared.slots().clear();
        info!("connection pool drained");
    }
}
