//! Lease and reservation guards.
//!
//! Both guards release on drop, so every exit path of the holder (explicit
//! release, early return, `?`, panic unwind, cancelled future) goes through the
//! same release path exactly once. A guard that the pool takes back while
//! holding its state lock is disarmed first, so its `Drop` never re-enters the
//! lock.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{Manage, PoolInner};
use crate::id::ResourceId;

/// Exclusive use of one pooled resource.
///
/// Dereferences to the resource. Returns it to the pool on drop or on
/// [`Lease::release`].
#[must_use = "dropping a lease immediately returns the resource to the pool"]
pub struct Lease<M: Manage> {
    pool: Arc<PoolInner<M>>,
    id: ResourceId,
    resource: Option<M::Resource>,
    acquired_at: Instant,
}

impl<M: Manage> Lease<M> {
    pub(super) fn new(pool: Arc<PoolInner<M>>, id: ResourceId, resource: M::Resource) -> Self {
        Self {
            pool,
            id,
            resource: Some(resource),
            acquired_at: Instant::now(),
        }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    /// How long this lease has been held.
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// Return the resource to the pool. Same as dropping the lease.
    pub fn release(self) {
        drop(self);
    }

    pub(super) fn belongs_to(&self, pool: &Arc<PoolInner<M>>) -> bool {
        Arc::ptr_eq(&self.pool, pool)
    }

    /// Take the resource back without running the release path.
    pub(super) fn reclaim(mut self) -> Option<(ResourceId, M::Resource)> {
        self.resource.take().map(|resource| (self.id, resource))
    }
}

impl<M: Manage> Deref for Lease<M> {
    type Target = M::Resource;

    fn deref(&self) -> &Self::Target {
        self.resource
            .as_ref()
            .expect("lease holds its resource until released")
    }
}

impl<M: Manage> DerefMut for Lease<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.resource
            .as_mut()
            .expect("lease holds its resource until released")
    }
}

impl<M: Manage> std::fmt::Debug for Lease<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.id)
            .field("held_for", &self.held_for())
            .finish()
    }
}

impl<M: Manage> Drop for Lease<M> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            PoolInner::release(&self.pool, self.id, resource);
        }
    }
}

/// One unit of capacity counted in `total` but not yet backed by a resource.
///
/// Dropped without [`Reservation::commit`] (creation failed, or the creating
/// future was cancelled), the capacity goes to the oldest waiter or back to
/// the pool.
pub(super) struct Reservation<M: Manage> {
    pool: Arc<PoolInner<M>>,
    armed: bool,
}

impl<M: Manage> Reservation<M> {
    pub(super) fn new(pool: Arc<PoolInner<M>>) -> Self {
        Self { pool, armed: true }
    }

    pub(super) fn pool(&self) -> &Arc<PoolInner<M>> {
        &self.pool
    }

    /// Back the reservation with a freshly created resource.
    ///
    /// Fails with the resource handed back when the pool closed while it was
    /// being created; the caller must dispose it.
    pub(super) fn commit(
        mut self,
        resource: M::Resource,
    ) -> Result<Lease<M>, (ResourceId, M::Resource)> {
        self.armed = false;
        let id = ResourceId::new();
        let mut state = self.pool.lock();
        if state.closed {
            return Err((id, resource));
        }
        state.in_use.insert(id);
        drop(state);

        tracing::debug!(resource = %id, "Created resource");
        Ok(Lease::new(Arc::clone(&self.pool), id, resource))
    }

    pub(super) fn disarm(mut self) {
        self.armed = false;
    }
}

impl<M: Manage> Drop for Reservation<M> {
    fn drop(&mut self) {
        if self.armed {
            PoolInner::release_reservation(&self.pool);
        }
    }
}
