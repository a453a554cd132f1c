//! slotpool-process: run dispatcher slots as child processes.
//!
//! ```ignore
//! let spawner = CommandSpawner::new("python").with_args(["-u", "worker.py"]);
//! let dispatcher: WorkerDispatcher<Request, Response> =
//!     worker_dispatcher(spawner, DispatcherConfig::new(4))?;
//!
//! let handle = dispatcher.submit(|worker| async move { worker.call(Request::Ping).await })?;
//! let response = handle.await??;
//! dispatcher.shutdown().await?;
//! ```

pub mod adapter;
pub mod codec;
pub mod spawner;

pub use adapter::{ChannelError, ProcessAdapter, ProcessError, WorkerChannel, WorkerProcess};
pub use codec::JsonCodec;
pub use spawner::{CommandSpawner, SpawnError, WorkerSpawner};

use serde::{Serialize, de::DeserializeOwned};
use slotpool::{ConfigError, Dispatcher, DispatcherConfig};

/// Dispatcher whose slots are worker processes speaking `Req`/`Resp`.
pub type WorkerDispatcher<Req, Resp> = Dispatcher<ProcessAdapter<Req, Resp>>;

/// Dispatcher spawning workers through `spawner` with default adapter settings.
///
/// Use [`ProcessAdapter`] with [`Dispatcher::new`] directly to set a grace
/// period or shutdown request.
pub fn worker_dispatcher<Req, Resp>(
    spawner: impl WorkerSpawner,
    config: DispatcherConfig,
) -> Result<WorkerDispatcher<Req, Resp>, ConfigError>
where
    Req: Serialize + Clone + Send + Sync + 'static,
    Resp: DeserializeOwned + Send + 'static,
{
    Dispatcher::new(config, ProcessAdapter::new(spawner))
}
