use async_trait::async_trait;

/// Produces and tears down the endpoints a [`Dispatcher`](super::Dispatcher)
/// runs tasks against.
///
/// An endpoint is the owned thing (a child process, a socket, a worker
/// thread). Its remote is the handle tasks talk to, shared with every task
/// that runs on the slot.
#[async_trait]
pub trait Adapter: Send + Sync + 'static {
    type Endpoint: Send + Sync + 'static;
    type Remote: Send + Sync + 'static;
    type Error: std::error::Error + Send + Sync + 'static;

    async fn create_endpoint(&self) -> Result<Self::Endpoint, Self::Error>;

    /// Build the remote for a freshly created endpoint.
    ///
    /// On failure the endpoint is terminated and the slot is never created.
    fn wrap(&self, endpoint: &Self::Endpoint) -> Result<Self::Remote, Self::Error>;

    async fn terminate(&self, endpoint: &Self::Endpoint) -> Result<(), Self::Error>;

    /// Cleanup run by [`Dispatcher::terminate`](super::Dispatcher::terminate)
    /// before `terminate`. A failure here does not prevent `terminate`.
    async fn before_dispose(
        &self,
        _remote: &Self::Remote,
        _endpoint: &Self::Endpoint,
    ) -> Result<(), Self::Error> {
        Ok(())
    }
}
