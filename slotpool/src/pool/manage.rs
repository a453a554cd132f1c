//! Resource lifecycle hooks injected into a [`Pool`](super::Pool).

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use futures::future::BoxFuture;

/// Creates and disposes the resources a pool hands out.
///
/// `create` may run concurrently with itself: the pool bounds how many
/// resources are alive, not how many creations overlap. `dispose` is called at
/// most once per created resource.
#[async_trait]
pub trait Manage: Send + Sync + 'static {
    type Resource: Send + 'static;
    type Error: std::error::Error + Send + Sync + 'static;

    async fn create(&self) -> Result<Self::Resource, Self::Error>;

    async fn dispose(&self, resource: Self::Resource) -> Result<(), Self::Error> {
        drop(resource);
        Ok(())
    }
}

type DisposeFn<R, E> = Box<dyn Fn(R) -> BoxFuture<'static, Result<(), E>> + Send + Sync>;

/// [`Manage`] built from plain closures.
pub struct FnManager<C, R, E> {
    create: C,
    dispose: Option<DisposeFn<R, E>>,
    _marker: PhantomData<fn() -> (R, E)>,
}

/// Manager whose `create` is `create` and whose `dispose` just drops.
///
/// ```ignore
/// let pool = Pool::new(PoolConfig::new(4), from_fn(|| async { Connection::open().await }))?;
/// ```
pub fn from_fn<C, F, R, E>(create: C) -> FnManager<C, R, E>
where
    C: Fn() -> F,
    F: Future<Output = Result<R, E>>,
{
    FnManager {
        create,
        dispose: None,
        _marker: PhantomData,
    }
}

impl<C, R, E> FnManager<C, R, E> {
    pub fn with_dispose<D, DF>(mut self, dispose: D) -> Self
    where
        D: Fn(R) -> DF + Send + Sync + 'static,
        DF: Future<Output = Result<(), E>> + Send + 'static,
    {
        self.dispose = Some(Box::new(move |resource| Box::pin(dispose(resource))));
        self
    }
}

#[async_trait]
impl<C, F, R, E> Manage for FnManager<C, R, E>
where
    C: Fn() -> F + Send + Sync + 'static,
    F: Future<Output = Result<R, E>> + Send + 'static,
    R: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    type Resource = R;
    type Error = E;

    async fn create(&self) -> Result<R, E> {
        (self.create)().await
    }

    async fn dispose(&self, resource: R) -> Result<(), E> {
        match &self.dispose {
            Some(dispose) => dispose(resource).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn from_fn_creates_through_closure() {
        let manager = from_fn(|| async { Ok::<_, io::Error>(42) });
        assert_eq!(manager.create().await.unwrap(), 42);
        assert!(manager.dispose(42).await.is_ok());
    }

    #[tokio::test]
    async fn with_dispose_runs_hook() {
        let disposed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&disposed);
        let manager = from_fn(|| async { Ok::<_, io::Error>(7usize) }).with_dispose(move |value| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(value, Ordering::SeqCst);
                Ok(())
            }
        });

        manager.dispose(7).await.unwrap();
        assert_eq!(disposed.load(Ordering::SeqCst), 7);
    }

    #[tokio::test]
    async fn create_error_is_returned() {
        let manager = from_fn(|| async { Err::<u8, _>(io::Error::other("no capacity")) });
        let err = manager.create().await.unwrap_err();
        assert_eq!(err.to_string(), "no capacity");
    }
}
