//! Bounded pool of lazily-created resources with FIFO waiters.
//!
//! Capacity accounting is optimistic: `total` is incremented before `create`
//! runs and given back if it fails, so concurrent `acquire` calls can never
//! create more than `limit` resources between them.
//!
//! A released resource goes straight to the oldest waiter and only reaches the
//! idle list when nobody is waiting. After `close()` every released resource is
//! disposed instead of reused.

mod lease;
mod manage;

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use tokio::runtime::Handle;

pub use lease::Lease;
use lease::Reservation;
pub use manage::{FnManager, Manage, from_fn};

use crate::config::PoolConfig;
use crate::error::{ConfigError, DisposalErrors, DisposeFailure, DisposeStage, PoolError};
use crate::id::ResourceId;
use crate::stats::PoolStats;
use crate::waiter::{Signal, WaiterQueue};

/// What a waiter is handed when it reaches the front of the queue.
enum Grant<M: Manage> {
    /// A released resource, already marked in use for the waiter.
    Resource(Lease<M>),
    /// Capacity freed by a failed creation: the waiter creates its own.
    Vacancy(Reservation<M>),
}

impl<M: Manage> Grant<M> {
    /// Disarm a grant nobody accepted, returning the resource if it carried one.
    fn reclaim(self) -> Option<(ResourceId, M::Resource)> {
        match self {
            Grant::Resource(lease) => lease.reclaim(),
            Grant::Vacancy(reservation) => {
                reservation.disarm();
                None
            }
        }
    }
}

struct IdleResource<R> {
    id: ResourceId,
    resource: R,
}

struct PoolState<M: Manage> {
    /// Resources alive or being created.
    total: usize,
    free: Vec<IdleResource<M::Resource>>,
    in_use: HashSet<ResourceId>,
    waiters: WaiterQueue<Grant<M>>,
    closed: bool,
    failures: DisposalErrors,
}

pub(crate) struct PoolInner<M: Manage> {
    manager: M,
    limit: usize,
    state: Mutex<PoolState<M>>,
    /// Notified whenever `total` shrinks.
    drained: Signal,
    runtime: OnceLock<Handle>,
}

impl<M: Manage> PoolInner<M> {
    fn lock(&self) -> MutexGuard<'_, PoolState<M>> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Resource pool state mutex poisoned - recovering");
            poisoned.into_inner()
        })
    }

    fn remember_runtime(&self) {
        if self.runtime.get().is_none()
            && let Ok(handle) = Handle::try_current()
        {
            let _ = self.runtime.set(handle);
        }
    }

    /// Return a leased resource.
    fn release(pool: &Arc<Self>, id: ResourceId, resource: M::Resource) {
        let mut state = pool.lock();
        if !state.in_use.remove(&id) {
            tracing::warn!(resource = %id, "Released a resource that is not in use - ignoring");
            return;
        }

        if state.closed {
            drop(state);
            tracing::debug!(resource = %id, "Pool closed - disposing released resource");
            Self::spawn_dispose(pool, id, resource);
            return;
        }

        state.in_use.insert(id);
        let lease = Lease::new(Arc::clone(pool), id, resource);
        match state.waiters.grant(Grant::Resource(lease)) {
            Ok(()) => {
                tracing::trace!(resource = %id, "Handed released resource to waiter");
            }
            Err(grant) => {
                state.in_use.remove(&id);
                if let Some((id, resource)) = grant.reclaim() {
                    state.free.push(IdleResource { id, resource });
                }
            }
        }
    }

    /// Give back capacity whose creation never completed.
    fn release_reservation(pool: &Arc<Self>) {
        let mut state = pool.lock();
        if !state.closed {
            let vacancy = Reservation::new(Arc::clone(pool));
            match state.waiters.grant(Grant::Vacancy(vacancy)) {
                Ok(()) => {
                    tracing::debug!("Handed freed capacity to waiter");
                    return;
                }
                Err(grant) => {
                    grant.reclaim();
                }
            }
        }
        state.total = state.total.saturating_sub(1);
        drop(state);
        pool.drained.notify();
    }

    fn spawn_dispose(pool: &Arc<Self>, id: ResourceId, resource: M::Resource) {
        let handle = match pool.runtime.get() {
            Some(handle) => handle.clone(),
            None => match Handle::try_current() {
                Ok(handle) => handle,
                Err(_) => {
                    tracing::error!(resource = %id, "No runtime available to dispose resource");
                    Self::finish_disposal(pool, id, Some("no runtime available".to_string()));
                    return;
                }
            },
        };
        let pool = Arc::clone(pool);
        handle.spawn(async move { pool.dispose(id, resource).await });
    }

    async fn dispose(&self, id: ResourceId, resource: M::Resource) {
        let error = match self.manager.dispose(resource).await {
            Ok(()) => {
                tracing::debug!(resource = %id, "Disposed resource");
                None
            }
            Err(e) => {
                tracing::error!(resource = %id, error = %e, "Failed to dispose resource");
                Some(e.to_string())
            }
        };
        Self::finish_disposal(self, id, error);
    }

    fn finish_disposal(&self, id: ResourceId, error: Option<String>) {
        let mut state = self.lock();
        if let Some(message) = error {
            state
                .failures
                .push(DisposeFailure::new(id, DisposeStage::Dispose, message));
        }
        state.total = state.total.saturating_sub(1);
        drop(state);
        self.drained.notify();
    }
}

impl<M: Manage> Drop for PoolInner<M> {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|p| p.into_inner());
        if !state.closed && state.total > 0 {
            tracing::warn!(
                total = state.total,
                "Resource pool dropped without close() - resources were not disposed"
            );
        }
    }
}

enum Take<M: Manage> {
    Idle(IdleResource<M::Resource>),
    Create,
    Wait(tokio::sync::oneshot::Receiver<Grant<M>>),
}

/// Bounded pool of lazily-created resources.
///
/// Cheap to clone; clones share the same pool.
pub struct Pool<M: Manage> {
    inner: Arc<PoolInner<M>>,
}

impl<M: Manage> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: Manage> Pool<M> {
    pub fn new(config: PoolConfig, manager: M) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(PoolInner {
                manager,
                limit: config.limit,
                state: Mutex::new(PoolState {
                    total: 0,
                    free: Vec::new(),
                    in_use: HashSet::new(),
                    waiters: WaiterQueue::new(),
                    closed: false,
                    failures: DisposalErrors::new(),
                }),
                drained: Signal::new(),
                runtime: OnceLock::new(),
            }),
        })
    }

    pub fn manager(&self) -> &M {
        &self.inner.manager
    }

    pub fn limit(&self) -> usize {
        self.inner.limit
    }

    /// Lease a resource, creating one if below `limit`, otherwise waiting.
    ///
    /// An idle resource is granted without suspending. Waiters are served in
    /// arrival order. Dropping the returned future abandons the request; a
    /// resource granted to an abandoned request goes to the next waiter.
    pub async fn acquire(&self) -> Result<Lease<M>, PoolError> {
        self.inner.remember_runtime();

        let take = {
            let mut state = self.inner.lock();
            if state.closed {
                return Err(PoolError::Closed);
            }
            if let Some(idle) = state.free.pop() {
                state.in_use.insert(idle.id);
                Take::Idle(idle)
            } else if state.total < self.inner.limit {
                state.total += 1;
                Take::Create
            } else {
                Take::Wait(state.waiters.push())
            }
        };

        match take {
            Take::Idle(idle) => Ok(Lease::new(
                Arc::clone(&self.inner),
                idle.id,
                idle.resource,
            )),
            Take::Create => self.create(Reservation::new(Arc::clone(&self.inner))).await,
            Take::Wait(rx) => match rx.await {
                Ok(Grant::Resource(lease)) => Ok(lease),
                Ok(Grant::Vacancy(reservation)) => self.create(reservation).await,
                Err(_) => Err(PoolError::Closed),
            },
        }
    }

    /// Lease an idle resource if one is available right now.
    ///
    /// Never creates and never waits.
    pub fn try_acquire(&self) -> Option<Lease<M>> {
        self.inner.remember_runtime();

        let mut state = self.inner.lock();
        if state.closed {
            return None;
        }
        let idle = state.free.pop()?;
        state.in_use.insert(idle.id);
        drop(state);
        Some(Lease::new(Arc::clone(&self.inner), idle.id, idle.resource))
    }

    async fn create(&self, reservation: Reservation<M>) -> Result<Lease<M>, PoolError> {
        if reservation.pool().lock().closed {
            return Err(PoolError::Closed);
        }

        match self.inner.manager.create().await {
            Ok(resource) => match reservation.commit(resource) {
                Ok(lease) => Ok(lease),
                Err((id, resource)) => {
                    tracing::debug!(resource = %id, "Pool closed during creation - disposing");
                    self.inner.dispose(id, resource).await;
                    Err(PoolError::Closed)
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "Failed to create resource");
                drop(reservation);
                Err(PoolError::Creation(Box::new(e)))
            }
        }
    }

    /// Return a lease. Equivalent to [`Lease::release`] or dropping it.
    pub fn release(&self, lease: Lease<M>) {
        if !lease.belongs_to(&self.inner) {
            tracing::warn!(resource = %lease.id(), "Lease released through a different pool");
        }
        lease.release();
    }

    /// Close the pool and dispose every resource it created.
    ///
    /// Pending waiters are rejected with [`PoolError::Closed`]. Idle resources
    /// are disposed concurrently; leased ones are disposed as their holders
    /// release them. Resolves once nothing is left alive, for every caller.
    pub async fn close(&self) -> Result<(), PoolError> {
        self.inner.remember_runtime();

        let idle = {
            let mut state = self.inner.lock();
            if state.closed {
                Vec::new()
            } else {
                state.closed = true;
                let rejected = state.waiters.reject_all();
                tracing::debug!(
                    rejected,
                    idle = state.free.len(),
                    in_use = state.in_use.len(),
                    "Closing resource pool"
                );
                std::mem::take(&mut state.free)
            }
        };

        for IdleResource { id, resource } in idle {
            PoolInner::spawn_dispose(&self.inner, id, resource);
        }

        self.inner
            .drained
            .wait_until(|| self.inner.lock().total == 0)
            .await;

        let failures = self.inner.lock().failures.clone();
        failures.into_result().map_err(PoolError::Disposal)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Number of idle resources.
    pub fn idle(&self) -> usize {
        self.inner.lock().free.len()
    }

    /// Number of leased resources.
    pub fn in_use(&self) -> usize {
        self.inner.lock().in_use.len()
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.lock();
        PoolStats {
            limit: self.inner.limit,
            total: state.total,
            idle: state.free.len(),
            in_use: state.in_use.len(),
            waiting: state.waiters.len(),
            closed: state.closed,
        }
    }
}
