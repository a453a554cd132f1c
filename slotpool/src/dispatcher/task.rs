//! Queued tasks and the handles their submitters await.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::oneshot;

use crate::error::DispatchError;

type Outcome<T> = Result<T, DispatchError>;

/// A type-erased queued task, runnable against a remote of type `R`.
pub(crate) trait Job<R>: Send {
    /// The submitter dropped its handle.
    fn is_abandoned(&self) -> bool;

    fn run(self: Box<Self>, remote: Arc<R>) -> BoxFuture<'static, ()>;

    fn reject(self: Box<Self>, error: DispatchError);
}

struct TaskJob<F, T> {
    task: F,
    tx: oneshot::Sender<Outcome<T>>,
}

impl<R, F, Fut, T> Job<R> for TaskJob<F, T>
where
    R: Send + Sync + 'static,
    F: FnOnce(Arc<R>) -> Fut + Send + 'static,
    Fut: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }

    fn run(self: Box<Self>, remote: Arc<R>) -> BoxFuture<'static, ()> {
        let TaskJob { task, tx } = *self;
        Box::pin(async move {
            let outcome = AssertUnwindSafe(async move { task(remote).await })
                .catch_unwind()
                .await
                .map_err(|payload| DispatchError::Panicked(panic_message(payload.as_ref())));
            if let Err(DispatchError::Panicked(msg)) = &outcome {
                tracing::warn!(panic = %msg, "Task panicked");
            }
            // Submitter may have gone away mid-run.
            let _ = tx.send(outcome);
        })
    }

    fn reject(self: Box<Self>, error: DispatchError) {
        let _ = self.tx.send(Err(error));
    }
}

/// Box `task` as a job and return the handle that observes its outcome.
pub(crate) fn job<R, F, Fut, T>(task: F) -> (Box<dyn Job<R>>, TaskHandle<T>)
where
    R: Send + Sync + 'static,
    F: FnOnce(Arc<R>) -> Fut + Send + 'static,
    Fut: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    (Box::new(TaskJob { task, tx }), TaskHandle { rx })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Resolves to the output of a submitted task.
///
/// Dropping the handle before the task starts removes the task from
/// consideration; it never runs. Once started a task runs to completion.
#[must_use = "a task whose handle is dropped before it starts is never run"]
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<Outcome<T>>,
}

impl<T> Future for TaskHandle<T> {
    type Output = Outcome<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(DispatchError::Closed)))
    }
}

impl<T> std::fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle").finish_non_exhaustive()
    }
}
