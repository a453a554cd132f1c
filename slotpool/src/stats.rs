//! Point-in-time snapshots of pool and dispatcher state.

use serde::Serialize;

/// Snapshot of a [`Pool`](crate::Pool).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub limit: usize,
    /// Resources alive or being created.
    pub total: usize,
    pub idle: usize,
    pub in_use: usize,
    /// Acquirers still listening for a resource.
    pub waiting: usize,
    pub closed: bool,
}

impl PoolStats {
    /// Every resource is leased and no more may be created.
    pub fn is_saturated(&self) -> bool {
        self.total >= self.limit && self.idle == 0
    }

    /// Capacity an `acquire` could use without waiting.
    pub fn available(&self) -> usize {
        self.idle + self.limit.saturating_sub(self.total)
    }
}

/// Snapshot of a [`Dispatcher`](crate::Dispatcher).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    pub concurrency: usize,
    /// Tasks waiting to start.
    pub queued: usize,
    pub running: usize,
    /// Live slots, idle or busy.
    pub slots: usize,
    pub idle_slots: usize,
    /// Slots whose endpoint is still being created.
    pub creating: usize,
    pub closed: bool,
}

impl DispatcherStats {
    /// Nothing queued and nothing running.
    pub fn is_idle(&self) -> bool {
        self.queued == 0 && self.running == 0
    }

    /// Nothing queued. Tasks may still be running.
    pub fn is_empty(&self) -> bool {
        self.queued == 0
    }

    /// Every concurrency slot is running a task.
    pub fn is_busy(&self) -> bool {
        self.running >= self.concurrency
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_stats_serialize() {
        let stats = PoolStats {
            limit: 4,
            total: 3,
            idle: 1,
            in_use: 2,
            waiting: 0,
            closed: false,
        };
        insta::assert_json_snapshot!(stats, @r#"
        {
          "limit": 4,
          "total": 3,
          "idle": 1,
          "in_use": 2,
          "waiting": 0,
          "closed": false
        }
        "#);
    }

    #[test]
    fn pool_saturation() {
        let mut stats = PoolStats {
            limit: 2,
            total: 2,
            idle: 0,
            in_use: 2,
            waiting: 1,
            closed: false,
        };
        assert!(stats.is_saturated());
        assert_eq!(stats.available(), 0);

        stats.total = 1;
        stats.in_use = 1;
        assert!(!stats.is_saturated());
        assert_eq!(stats.available(), 1);
    }

    #[test]
    fn dispatcher_stats_serialize() {
        let stats = DispatcherStats {
            concurrency: 2,
            queued: 5,
            running: 2,
            slots: 2,
            idle_slots: 0,
            creating: 0,
            closed: false,
        };
        insta::assert_json_snapshot!(stats, @r#"
        {
          "concurrency": 2,
          "queued": 5,
          "running": 2,
          "slots": 2,
          "idle_slots": 0,
          "creating": 0,
          "closed": false
        }
        "#);
        assert!(stats.is_busy());
        assert!(!stats.is_idle());
        assert!(!stats.is_empty());
    }
}
