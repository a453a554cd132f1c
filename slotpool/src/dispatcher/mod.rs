//! Queue-backed dispatcher: runs submitted tasks on at most `concurrency`
//! slots, creating slots lazily through an [`Adapter`].
//!
//! Tasks start in submission order. A slot is reused oldest-idle-first and
//! goes back to the idle list when its task settles, whatever the outcome.
//! The queue itself is unbounded; callers that need backpressure go through
//! [`Dispatcher::await_backpressure`].

mod adapter;
mod slot;
mod task;

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

pub use adapter::Adapter;
use slot::Slot;
pub use slot::SlotState;
use task::Job;
pub use task::TaskHandle;

use crate::config::DispatcherConfig;
use crate::error::{ConfigError, DispatchError, DisposalErrors, DisposeFailure, DisposeStage};
use crate::stats::DispatcherStats;
use crate::waiter::Signal;

struct DispatcherState<A: Adapter> {
    queue: VecDeque<Box<dyn Job<A::Remote>>>,
    running: usize,
    /// Slots whose endpoint is being created; not yet in `slots`.
    creating: usize,
    slots: Vec<Arc<Slot<A>>>,
    idle: VecDeque<Arc<Slot<A>>>,
    closed: bool,
    /// Failures from slots disposed outside `terminate` after close.
    late_failures: DisposalErrors,
}

/// What a dequeued task runs on, reserved while it left the queue.
enum Checkout<A: Adapter> {
    /// An idle slot, already marked running.
    Reuse(Arc<Slot<A>>),
    /// Counted in `creating`; the task creates its own slot.
    Create,
}

/// Oldest idle slot that can still start.
fn take_idle<A: Adapter>(state: &mut DispatcherState<A>) -> Option<Arc<Slot<A>>> {
    while let Some(slot) = state.idle.pop_front() {
        if slot.try_start() {
            return Some(slot);
        }
    }
    None
}

struct Inner<A: Adapter> {
    adapter: A,
    concurrency: usize,
    state: Mutex<DispatcherState<A>>,
    /// Notified whenever the queue shrinks, a task settles, or a creation
    /// settles.
    signal: Signal,
}

impl<A: Adapter> Inner<A> {
    fn lock(&self) -> MutexGuard<'_, DispatcherState<A>> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Dispatcher state mutex poisoned - recovering");
            poisoned.into_inner()
        })
    }
}

impl<A: Adapter> Drop for Inner<A> {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|p| p.into_inner());
        let live = state.slots.iter().filter(|s| s.state().is_live()).count();
        if !state.closed && live > 0 {
            tracing::warn!(
                slots = live,
                "Dispatcher dropped without terminate() - endpoints were not terminated"
            );
        }
    }
}

/// Runs tasks against a bounded set of lazily created slots.
///
/// Cheap to clone; clones share the same queue and slots. `submit` spawns onto
/// the current Tokio runtime.
pub struct Dispatcher<A: Adapter> {
    inner: Arc<Inner<A>>,
}

impl<A: Adapter> Clone for Dispatcher<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: Adapter> Dispatcher<A> {
    pub fn new(config: DispatcherConfig, adapter: A) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                adapter,
                concurrency: config.concurrency,
                state: Mutex::new(DispatcherState {
                    queue: VecDeque::new(),
                    running: 0,
                    creating: 0,
                    slots: Vec::new(),
                    idle: VecDeque::new(),
                    closed: false,
                    late_failures: DisposalErrors::new(),
                }),
                signal: Signal::new(),
            }),
        })
    }

    /// Like [`Dispatcher::new`], then warms up every slot unless the config
    /// is lazy.
    ///
    /// If warm-up fails the dispatcher is terminated and the creation error
    /// returned.
    pub async fn start(config: DispatcherConfig, adapter: A) -> Result<Self, DispatchError> {
        let lazy = config.lazy;
        let dispatcher = Self::new(config, adapter)?;
        if !lazy && let Err(e) = dispatcher.warm_up().await {
            if let Err(cleanup) = dispatcher.terminate().await {
                tracing::warn!(error = %cleanup, "Failed to clean up after warm-up failure");
            }
            return Err(e);
        }
        Ok(dispatcher)
    }

    pub fn adapter(&self) -> &A {
        &self.inner.adapter
    }

    pub fn concurrency(&self) -> usize {
        self.inner.concurrency
    }

    /// Queue `task` and return a handle resolving to its output.
    ///
    /// The task's position in the queue is fixed by this call. It receives the
    /// remote of whichever slot it runs on.
    pub fn submit<F, Fut, T>(&self, task: F) -> Result<TaskHandle<T>, DispatchError>
    where
        F: FnOnce(Arc<A::Remote>) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (job, handle) = task::job(task);
        {
            let mut state = self.inner.lock();
            if state.closed {
                return Err(DispatchError::Closed);
            }
            state.queue.push_back(job);
        }
        self.pump();
        Ok(handle)
    }

    /// Wait until at most `target` tasks are queued, then queue `task`.
    ///
    /// The length check and the enqueue happen atomically, so concurrent
    /// callers never push the queue past `target + 1`. An invalid target is
    /// rejected before suspending.
    pub async fn await_backpressure<N, F, Fut, T>(
        &self,
        target: N,
        task: F,
    ) -> Result<TaskHandle<T>, DispatchError>
    where
        N: TryInto<usize> + fmt::Display + Copy,
        F: FnOnce(Arc<A::Remote>) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let target: usize = target.try_into().map_err(|_| {
            DispatchError::InvalidConfiguration(format!(
                "backpressure target must be a non-negative queue length, got {target}"
            ))
        })?;

        let (job, handle) = task::job(task);
        let mut pending = Some(job);
        self.inner
            .signal
            .wait_until(|| {
                let mut state = self.inner.lock();
                if state.closed {
                    return true;
                }
                if state.queue.len() > target {
                    return false;
                }
                if let Some(job) = pending.take() {
                    state.queue.push_back(job);
                }
                true
            })
            .await;

        if pending.is_some() {
            return Err(DispatchError::Closed);
        }
        self.pump();
        Ok(handle)
    }

    /// Start queued tasks while below `concurrency`.
    ///
    /// Each started task leaves the queue holding either an idle slot already
    /// marked running or a creation reservation, so it never has to compete
    /// for a slot after being dequeued.
    fn pump(&self) {
        let mut started = Vec::new();
        let mut abandoned = Vec::new();
        {
            let mut state = self.inner.lock();
            while !state.closed && state.running < self.inner.concurrency {
                let Some(job) = state.queue.pop_front() else {
                    break;
                };
                if job.is_abandoned() {
                    abandoned.push(job);
                    continue;
                }
                let checkout = if let Some(slot) = take_idle(&mut state) {
                    Checkout::Reuse(slot)
                } else if state.slots.len() + state.creating < self.inner.concurrency {
                    state.creating += 1;
                    Checkout::Create
                } else {
                    // Every slot is spoken for; a slot being warmed up will
                    // pump again once it lands in the idle list.
                    state.queue.push_front(job);
                    break;
                };
                state.running += 1;
                started.push((job, checkout));
            }
        }

        if !abandoned.is_empty() {
            tracing::trace!(count = abandoned.len(), "Dropped abandoned tasks");
        }
        let shrank = !abandoned.is_empty() || !started.is_empty();
        drop(abandoned);

        if shrank {
            self.inner.signal.notify();
        }
        for (job, checkout) in started {
            let dispatcher = self.clone();
            tokio::spawn(async move { dispatcher.execute(job, checkout).await });
        }
    }

    async fn execute(&self, job: Box<dyn Job<A::Remote>>, checkout: Checkout<A>) {
        let slot = match checkout {
            Checkout::Reuse(slot) => slot,
            Checkout::Create => match self.create_slot().await {
                Ok(slot) => self.adopt_running(slot),
                Err(e) => {
                    self.creation_settled();
                    job.reject(e);
                    self.finish(None).await;
                    return;
                }
            },
        };

        tracing::trace!(slot = %slot.id(), "Running task");
        job.run(slot.remote_handle()).await;
        self.finish(Some(slot)).await;
    }

    async fn finish(&self, slot: Option<Arc<Slot<A>>>) {
        let mut orphan = None;
        {
            let mut state = self.inner.lock();
            state.running = state.running.saturating_sub(1);
            if let Some(slot) = slot
                && slot.try_finish()
            {
                if !state.closed {
                    state.idle.push_back(slot);
                } else if slot.begin_dispose() {
                    orphan = Some(slot);
                }
            }
        }
        self.inner.signal.notify();

        // Closed while the task ran and no terminate claimed the slot.
        if let Some(slot) = orphan {
            tracing::debug!(slot = %slot.id(), "Disposing slot returned after close");
            let failures = self.dispose_slot(&slot, true).await;
            self.inner.lock().late_failures.extend(failures);
            self.inner.signal.notify();
        }
        self.pump();
    }

    async fn create_slot(&self) -> Result<Slot<A>, DispatchError> {
        let adapter = &self.inner.adapter;
        let endpoint = adapter.create_endpoint().await.map_err(|e| {
            tracing::warn!(error = %e, "Failed to create endpoint");
            DispatchError::Creation(Box::new(e))
        })?;

        let remote = match adapter.wrap(&endpoint) {
            Ok(remote) => remote,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to wrap endpoint - terminating it");
                if let Err(te) = adapter.terminate(&endpoint).await {
                    tracing::warn!(error = %te, "Failed to terminate unwrapped endpoint");
                }
                return Err(DispatchError::Creation(Box::new(e)));
            }
        };

        let slot = Slot::new(endpoint, remote);
        tracing::debug!(slot = %slot.id(), "Created slot");
        Ok(slot)
    }

    /// Register a slot created for a dequeued task, already marked running.
    ///
    /// Registered even after close: the task was promised a slot, and a
    /// terminate still waiting on `creating` picks the slot up for disposal.
    fn adopt_running(&self, slot: Slot<A>) -> Arc<Slot<A>> {
        let slot = {
            let mut state = self.inner.lock();
            state.creating = state.creating.saturating_sub(1);
            let slot = Arc::new(slot);
            slot.try_start();
            state.slots.push(Arc::clone(&slot));
            slot
        };
        self.inner.signal.notify();
        slot
    }

    /// Register a warmed-up slot as idle, or hand it back if the dispatcher
    /// closed while it was being created.
    fn adopt_idle(&self, slot: Slot<A>) -> Result<(), Slot<A>> {
        {
            let mut state = self.inner.lock();
            if state.closed {
                return Err(slot);
            }
            state.creating = state.creating.saturating_sub(1);
            let slot = Arc::new(slot);
            state.slots.push(Arc::clone(&slot));
            state.idle.push_back(slot);
        }
        self.inner.signal.notify();
        Ok(())
    }

    /// Terminate a slot created after close. Still counted in `creating`
    /// until this finishes, so `terminate()` waits for it.
    async fn discard_created(&self, slot: Slot<A>) {
        tracing::debug!(slot = %slot.id(), "Dispatcher closed during slot creation - terminating");
        slot.begin_dispose();
        let failures = self.dispose_slot(&slot, false).await;
        self.inner.lock().late_failures.extend(failures);
        self.creation_settled();
    }

    fn creation_settled(&self) {
        {
            let mut state = self.inner.lock();
            state.creating = state.creating.saturating_sub(1);
        }
        self.inner.signal.notify();
    }

    /// Create slots until `concurrency` exist. Returns how many were created.
    ///
    /// Tasks submitted meanwhile wait for the new slots rather than creating
    /// their own.
    pub async fn warm_up(&self) -> Result<usize, DispatchError> {
        let mut created = 0;
        loop {
            {
                let mut state = self.inner.lock();
                if state.closed {
                    return Err(DispatchError::Closed);
                }
                if state.slots.len() + state.creating >= self.inner.concurrency {
                    break;
                }
                state.creating += 1;
            }

            let slot = match self.create_slot().await {
                Ok(slot) => slot,
                Err(e) => {
                    self.creation_settled();
                    // Queued tasks may now create the slot themselves.
                    self.pump();
                    return Err(e);
                }
            };
            if let Err(slot) = self.adopt_idle(slot) {
                self.discard_created(slot).await;
                return Err(DispatchError::Closed);
            }
            created += 1;
            self.pump();
        }

        tracing::debug!(created, "Warmed up dispatcher slots");
        Ok(created)
    }

    /// Resolves once nothing is queued and nothing is running.
    pub async fn on_idle(&self) {
        self.inner
            .signal
            .wait_until(|| {
                let state = self.inner.lock();
                state.queue.is_empty() && state.running == 0
            })
            .await;
    }

    /// Resolves once nothing is queued. Tasks may still be running.
    pub async fn on_empty(&self) {
        self.inner
            .signal
            .wait_until(|| self.inner.lock().queue.is_empty())
            .await;
    }

    /// Reject every queued task with [`DispatchError::Cleared`].
    ///
    /// Running tasks are unaffected. Returns how many tasks were dropped.
    pub fn clear_queue(&self) -> usize {
        let cleared: Vec<_> = self.inner.lock().queue.drain(..).collect();
        let count = cleared.len();
        for job in cleared {
            job.reject(DispatchError::Cleared);
        }
        if count > 0 {
            tracing::debug!(count, "Cleared task queue");
            self.inner.signal.notify();
        }
        count
    }

    /// Close to new work and reject everything queued. Returns the slots the
    /// caller should try to dispose.
    fn close(&self) -> Vec<Arc<Slot<A>>> {
        let (slots, rejected) = {
            let mut state = self.inner.lock();
            state.closed = true;
            state.idle.clear();
            let rejected: Vec<_> = state.queue.drain(..).collect();
            (state.slots.clone(), rejected)
        };
        if !rejected.is_empty() {
            tracing::debug!(count = rejected.len(), "Rejecting queued tasks on terminate");
        }
        for job in rejected {
            job.reject(DispatchError::Closed);
        }
        self.inner.signal.notify();
        slots
    }

    async fn dispose_slot(&self, slot: &Slot<A>, run_hook: bool) -> DisposalErrors {
        let adapter = &self.inner.adapter;
        let mut failures = DisposalErrors::new();

        if run_hook && let Err(e) = adapter.before_dispose(slot.remote(), slot.endpoint()).await {
            tracing::warn!(slot = %slot.id(), error = %e, "Pre-dispose hook failed - terminating anyway");
            failures.push(DisposeFailure::new(slot.id(), DisposeStage::Cleanup, e));
        }

        match adapter.terminate(slot.endpoint()).await {
            Ok(()) => tracing::debug!(slot = %slot.id(), "Terminated slot"),
            Err(e) => {
                tracing::error!(slot = %slot.id(), error = %e, "Failed to terminate slot");
                failures.push(DisposeFailure::new(slot.id(), DisposeStage::Dispose, e));
            }
        }

        slot.mark_disposed();
        failures
    }

    /// Dispose, one at a time, every slot in `slots` this caller manages to
    /// claim.
    async fn dispose_claimed(&self, slots: &[Arc<Slot<A>>]) -> DisposalErrors {
        let mut failures = DisposalErrors::new();
        for slot in slots {
            if !slot.begin_dispose() {
                continue;
            }
            failures.extend(self.dispose_slot(slot, true).await);
            self.inner.signal.notify();
        }
        failures
    }

    /// Wait until every slot in `slots` is disposed, whoever claimed it.
    async fn wait_disposed(&self, slots: &[Arc<Slot<A>>]) {
        self.inner
            .signal
            .wait_until(|| {
                slots
                    .iter()
                    .all(|slot| slot.state() == SlotState::Disposed)
            })
            .await;
    }

    fn forget_disposed(&self) -> DisposalErrors {
        let mut state = self.inner.lock();
        state.slots.retain(|slot| slot.state() != SlotState::Disposed);
        std::mem::take(&mut state.late_failures)
    }

    /// Close the dispatcher and dispose every slot.
    ///
    /// Queued tasks are rejected with [`DispatchError::Closed`]. Each slot runs
    /// `before_dispose` then `terminate`, one slot at a time; `terminate` runs
    /// even when the hook failed. Waits for in-flight slot creations to
    /// settle, and for slots claimed by a concurrent terminate to finish
    /// disposing. Running tasks are not awaited; use [`Dispatcher::shutdown`]
    /// for that.
    pub async fn terminate(&self) -> Result<(), DispatchError> {
        let mut slots = self.close();
        let mut failures = self.dispose_claimed(&slots).await;

        self.inner
            .signal
            .wait_until(|| self.inner.lock().creating == 0)
            .await;

        // Slots created for tasks that were dequeued before close.
        let late: Vec<_> = {
            let state = self.inner.lock();
            state
                .slots
                .iter()
                .filter(|slot| !slots.iter().any(|known| Arc::ptr_eq(known, *slot)))
                .cloned()
                .collect()
        };
        failures.extend(self.dispose_claimed(&late).await);
        slots.extend(late);

        self.wait_disposed(&slots).await;
        failures.extend(self.forget_disposed());

        tracing::debug!(failures = failures.len(), "Dispatcher terminated");
        failures.into_result().map_err(DispatchError::Disposal)
    }

    /// Close the dispatcher and terminate every slot concurrently.
    ///
    /// Skips `before_dispose` and does not wait for running tasks or in-flight
    /// creations. Slots claimed by a concurrent terminate are waited for.
    pub async fn terminate_now(&self) -> Result<(), DispatchError> {
        let slots = self.close();
        let claimed: Vec<_> = slots.iter().filter(|slot| slot.begin_dispose()).collect();

        let results =
            futures::future::join_all(claimed.iter().map(|slot| self.dispose_slot(slot, false)))
                .await;
        self.inner.signal.notify();

        let mut failures = DisposalErrors::new();
        for result in results {
            failures.extend(result);
        }
        self.wait_disposed(&slots).await;
        failures.extend(self.forget_disposed());
        failures.into_result().map_err(DispatchError::Disposal)
    }

    /// Wait for queued and running tasks to finish, then [`terminate`](Self::terminate).
    pub async fn shutdown(&self) -> Result<(), DispatchError> {
        self.on_idle().await;
        self.terminate().await
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Number of queued tasks.
    pub fn size(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn stats(&self) -> DispatcherStats {
        let state = self.inner.lock();
        DispatcherStats {
            concurrency: self.inner.concurrency,
            queued: state.queue.len(),
            running: state.running,
            slots: state.slots.iter().filter(|s| s.state().is_live()).count(),
            idle_slots: state.idle.len(),
            creating: state.creating,
            closed: state.closed,
        }
    }
}
