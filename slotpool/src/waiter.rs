//! Waiter primitives shared by the pool and the dispatcher.
//!
//! - [`WaiterQueue`]: FIFO of single-assignment result cells. Each cell is
//!   completed exactly once: granted a value, or rejected by dropping the
//!   sending half (the receiver then observes a closed channel).
//! - [`Signal`]: a generation counter that wakes every task parked in
//!   [`Signal::wait_until`] so it can re-check its condition.
//!
//! Neither primitive holds a lock. Callers keep them inside their own state
//! mutex and never await while that mutex is held.

use std::collections::VecDeque;

use tokio::sync::{oneshot, watch};

/// FIFO queue of pending requests, each resolved at most once.
pub(crate) struct WaiterQueue<T> {
    waiters: VecDeque<oneshot::Sender<T>>,
}

impl<T> WaiterQueue<T> {
    pub fn new() -> Self {
        Self {
            waiters: VecDeque::new(),
        }
    }

    /// Enqueue a new waiter behind every existing one.
    pub fn push(&mut self) -> oneshot::Receiver<T> {
        // Abandoned waiters would otherwise accumulate until the next grant.
        self.waiters.retain(|tx| !tx.is_closed());

        let (tx, rx) = oneshot::channel();
        self.waiters.push_back(tx);
        rx
    }

    /// Hand `value` to the oldest waiter that is still listening.
    ///
    /// Waiters whose receiver was dropped are skipped. Returns the value back
    /// when nobody took it.
    pub fn grant(&mut self, mut value: T) -> Result<(), T> {
        while let Some(tx) = self.waiters.pop_front() {
            if tx.is_closed() {
                tracing::trace!("Skipping abandoned waiter");
                continue;
            }
            match tx.send(value) {
                Ok(()) => return Ok(()),
                Err(returned) => value = returned,
            }
        }
        Err(value)
    }

    /// Reject every pending waiter. Returns how many were still listening.
    pub fn reject_all(&mut self) -> usize {
        let live = self.len();
        self.waiters.clear();
        live
    }

    /// Number of waiters still listening.
    pub fn len(&self) -> usize {
        self.waiters.iter().filter(|tx| !tx.is_closed()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for WaiterQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Broadcast "something changed" to tasks waiting on a condition.
pub(crate) struct Signal {
    tx: watch::Sender<u64>,
}

impl Signal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { tx }
    }

    /// Wake every waiter so it re-evaluates its condition.
    pub fn notify(&self) {
        self.tx.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    /// Suspend until `ready` returns true.
    ///
    /// The subscription is taken before the first check, so a `notify` that
    /// lands between the check and the wait is never lost.
    pub async fn wait_until(&self, mut ready: impl FnMut() -> bool) {
        let mut rx = self.tx.subscribe();
        loop {
            if ready() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn grant_goes_to_oldest_waiter() {
        let mut queue = WaiterQueue::new();
        let mut first = queue.push();
        let mut second = queue.push();

        assert!(queue.grant(1).is_ok());
        assert_eq!(first.try_recv().unwrap(), 1);
        assert!(second.try_recv().is_err());

        assert!(queue.grant(2).is_ok());
        assert_eq!(second.try_recv().unwrap(), 2);
    }

    #[test]
    fn grant_skips_abandoned_waiters() {
        let mut queue = WaiterQueue::new();
        let abandoned = queue.push();
        let mut live = queue.push();
        drop(abandoned);

        assert_eq!(queue.len(), 1);
        assert!(queue.grant("value").is_ok());
        assert_eq!(live.try_recv().unwrap(), "value");
    }

    #[test]
    fn grant_returns_value_when_nobody_waits() {
        let mut queue: WaiterQueue<u32> = WaiterQueue::new();
        assert_eq!(queue.grant(7), Err(7));

        let rx = queue.push();
        drop(rx);
        assert_eq!(queue.grant(8), Err(8));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn reject_all_closes_receivers() {
        let mut queue: WaiterQueue<u32> = WaiterQueue::new();
        let rx1 = queue.push();
        let rx2 = queue.push();

        assert_eq!(queue.reject_all(), 2);
        assert!(rx1.await.is_err());
        assert!(rx2.await.is_err());
    }

    #[tokio::test]
    async fn signal_wakes_when_condition_flips() {
        let signal = Arc::new(Signal::new());
        let flag = Arc::new(AtomicBool::new(false));

        let waiter = {
            let signal = Arc::clone(&signal);
            let flag = Arc::clone(&flag);
            tokio::spawn(async move {
                signal.wait_until(|| flag.load(Ordering::SeqCst)).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        // A notify without a state change must not release the waiter.
        signal.notify();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        flag.store(true, Ordering::SeqCst);
        signal.notify();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter was not released")
            .unwrap();
    }

    #[tokio::test]
    async fn signal_returns_immediately_when_ready() {
        let signal = Signal::new();
        tokio::time::timeout(Duration::from_millis(100), signal.wait_until(|| true))
            .await
            .expect("ready condition should not suspend");
    }
}
