//! [`Adapter`] that backs each dispatcher slot with a child process.
//!
//! Each slot owns one child. Tasks talk to it through a [`WorkerChannel`]: one
//! framed JSON request on the child's stdin, one framed JSON response read
//! back from its stdout. Termination sends SIGTERM, waits for a grace period,
//! then kills.

use std::io;
use std::marker::PhantomData;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Serialize, de::DeserializeOwned};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};

use slotpool::Adapter;

use crate::codec::JsonCodec;
use crate::spawner::{SpawnError, WorkerSpawner};

/// How long a worker gets to exit after SIGTERM before it is killed.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("failed to send request: {0}")]
    Send(#[source] io::Error),
    #[error("failed to read response: {0}")]
    Receive(#[source] io::Error),
    #[error("worker closed its output")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error("worker {0} not captured")]
    Stdio(&'static str),
    #[error("failed to signal worker: {0}")]
    Signal(String),
    #[error("failed to wait for worker: {0}")]
    Wait(#[source] io::Error),
    #[error("failed to kill worker: {0}")]
    Kill(#[source] io::Error),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("shutdown request not written within {0:?}")]
    ShutdownTimeout(Duration),
}

type Pipes = (ChildStdin, ChildStdout);

/// A running worker child. The dispatcher's endpoint type.
pub struct WorkerProcess {
    pid: Option<u32>,
    child: Mutex<Child>,
    /// Taken once, when the slot's channel is built.
    pipes: StdMutex<Option<Pipes>>,
}

impl WorkerProcess {
    fn new(mut child: Child) -> Result<Self, ProcessError> {
        let stdin = child.stdin.take().ok_or(ProcessError::Stdio("stdin"));
        let stdout = child.stdout.take().ok_or(ProcessError::Stdio("stdout"));
        let (stdin, stdout) = match (stdin, stdout) {
            (Ok(stdin), Ok(stdout)) => (stdin, stdout),
            (Err(e), _) | (_, Err(e)) => {
                if let Err(kill_err) = child.start_kill() {
                    tracing::warn!(error = %kill_err, "Failed to kill worker without stdio");
                }
                return Err(e);
            }
        };

        Ok(Self {
            pid: child.id(),
            child: Mutex::new(child),
            pipes: StdMutex::new(Some((stdin, stdout))),
        })
    }

    /// OS process id, if the child had not exited when it was spawned.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit status if the child has already exited.
    pub async fn try_wait(&self) -> io::Result<Option<ExitStatus>> {
        self.child.lock().await.try_wait()
    }

    fn take_pipes(&self) -> Option<Pipes> {
        self.pipes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

/// Request/response channel to one worker. The dispatcher's remote type.
///
/// Calls are serialized: a second `call` waits until the first has its
/// response. `notify` only needs the write half, so it never waits on a
/// response.
pub struct WorkerChannel<Req, Resp> {
    pid: Option<u32>,
    writer: Mutex<FramedWrite<ChildStdin, JsonCodec<Req>>>,
    /// Held for the whole of a `call`, which keeps responses paired with
    /// their requests.
    reader: Mutex<FramedRead<ChildStdout, JsonCodec<Resp>>>,
}

impl<Req, Resp> WorkerChannel<Req, Resp>
where
    Req: Serialize,
    Resp: DeserializeOwned,
{
    fn new(pid: Option<u32>, (stdin, stdout): Pipes) -> Self {
        Self {
            pid,
            writer: Mutex::new(FramedWrite::new(stdin, JsonCodec::new())),
            reader: Mutex::new(FramedRead::new(stdout, JsonCodec::new())),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Send one request and wait for the worker's response to it.
    pub async fn call(&self, request: Req) -> Result<Resp, ChannelError> {
        let mut reader = self.reader.lock().await;
        self.notify(request).await?;
        match reader.next().await {
            Some(Ok(response)) => Ok(response),
            Some(Err(e)) => Err(ChannelError::Receive(e)),
            None => Err(ChannelError::Closed),
        }
    }

    /// Send a request without waiting for a response.
    pub async fn notify(&self, request: Req) -> Result<(), ChannelError> {
        let mut writer = self.writer.lock().await;
        writer.send(request).await.map_err(ChannelError::Send)
    }
}

/// Dispatcher adapter running each slot as a child process.
pub struct ProcessAdapter<Req, Resp> {
    spawner: Arc<dyn WorkerSpawner>,
    grace_period: Duration,
    shutdown_request: Option<Req>,
    _marker: PhantomData<fn() -> Resp>,
}

impl<Req, Resp> ProcessAdapter<Req, Resp> {
    pub fn new(spawner: impl WorkerSpawner) -> Self {
        Self {
            spawner: Arc::new(spawner),
            grace_period: DEFAULT_GRACE_PERIOD,
            shutdown_request: None,
            _marker: PhantomData,
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Request sent to each worker before it is terminated, so it can exit
    /// on its own.
    pub fn with_shutdown_request(mut self, request: Req) -> Self {
        self.shutdown_request = Some(request);
        self
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }
}

#[async_trait]
impl<Req, Resp> Adapter for ProcessAdapter<Req, Resp>
where
    Req: Serialize + Clone + Send + Sync + 'static,
    Resp: DeserializeOwned + Send + 'static,
{
    type Endpoint = WorkerProcess;
    type Remote = WorkerChannel<Req, Resp>;
    type Error = ProcessError;

    async fn create_endpoint(&self) -> Result<WorkerProcess, ProcessError> {
        let child = self.spawner.spawn()?;
        let process = WorkerProcess::new(child)?;
        tracing::debug!(pid = process.pid, "Worker process started");
        Ok(process)
    }

    fn wrap(&self, endpoint: &WorkerProcess) -> Result<WorkerChannel<Req, Resp>, ProcessError> {
        let pipes = endpoint
            .take_pipes()
            .ok_or(ProcessError::Stdio("stdio (already wrapped)"))?;
        Ok(WorkerChannel::new(endpoint.pid, pipes))
    }

    async fn terminate(&self, endpoint: &WorkerProcess) -> Result<(), ProcessError> {
        let mut child = endpoint.child.lock().await;
        if let Some(status) = child.try_wait().map_err(ProcessError::Wait)? {
            tracing::debug!(pid = endpoint.pid, %status, "Worker already exited");
            return Ok(());
        }

        #[cfg(unix)]
        {
            if let Some(pid) = child.id()
                && let Err(e) = send_sigterm(pid)
            {
                tracing::warn!(pid, error = %e, "Failed to send SIGTERM to worker");
            }
        }

        match tokio::time::timeout(self.grace_period, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(pid = endpoint.pid, %status, "Worker exited");
                Ok(())
            }
            Ok(Err(e)) => Err(ProcessError::Wait(e)),
            Err(_) => {
                tracing::warn!(
                    pid = endpoint.pid,
                    grace_ms = self.grace_period.as_millis() as u64,
                    "Worker did not exit within grace period - killing"
                );
                child.kill().await.map_err(ProcessError::Kill)
            }
        }
    }

    async fn before_dispose(
        &self,
        remote: &WorkerChannel<Req, Resp>,
        _endpoint: &WorkerProcess,
    ) -> Result<(), ProcessError> {
        let Some(request) = &self.shutdown_request else {
            return Ok(());
        };
        // A worker that stopped reading must not hold up termination.
        tokio::time::timeout(self.grace_period, remote.notify(request.clone()))
            .await
            .map_err(|_| ProcessError::ShutdownTimeout(self.grace_period))??;
        tracing::debug!(pid = remote.pid, "Sent shutdown request to worker");
        Ok(())
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) -> Result<(), ProcessError> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid)
        .map_err(|_| ProcessError::Signal(format!("pid {pid} out of range")))?;
    kill(Pid::from_raw(raw), Signal::SIGTERM).map_err(|e| ProcessError::Signal(e.to_string()))
}
