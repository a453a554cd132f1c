//! slotpool: bounded pools of lazily-created async resources, and a
//! queue-backed dispatcher that runs tasks on a bounded set of slots.

mod id;
mod stats;
mod waiter;

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod pool;
pub mod retry;
pub mod telemetry;

pub use config::{DispatcherConfig, PoolConfig};
pub use dispatcher::{Adapter, Dispatcher, SlotState, TaskHandle};
pub use error::{
    BoxError, ConfigError, DispatchError, DisposalErrors, DisposeFailure, DisposeStage, PoolError,
};
pub use id::{ResourceId, SlotId};
pub use pool::{FnManager, Lease, Manage, Pool, from_fn};
pub use retry::{Backoff, RetryConfig, RetryError, Retrying, retry, retry_if};
pub use stats::{DispatcherStats, PoolStats};
pub use telemetry::init_tracing;
