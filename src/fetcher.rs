use async_trait::async_trait;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Per-attempt context handed to a [`Fetcher`].
#[derive(Debug, Clone)]
pub struct FetchContext {
    /// Cancelled when the attempt is superseded or its consumer goes away.
    ///
    /// Honoring it is optional: a result produced after cancellation is
    /// discarded either way.
    pub token: CancellationToken,
}

impl FetchContext {
    pub fn new(token: CancellationToken) -> Self {
        FetchContext { token }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Loads the payload for a key. Supplied by the application.
#[async_trait]
pub trait Fetcher<D, E>: Send + Sync {
    async fn fetch(&self, key: &str, ctx: FetchContext) -> Result<D, E>;
}

/// A [`Fetcher`] backed by an async closure. See [`fetcher_fn`].
pub struct FnFetcher<F, D, E> {
    f: F,
    _marker: PhantomData<fn() -> (D, E)>,
}

#[async_trait]
impl<F, Fut, D, E> Fetcher<D, E> for FnFetcher<F, D, E>
where
    F: Fn(String, FetchContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<D, E>> + Send,
    D: Send + 'static,
    E: Send + 'static,
{
    async fn fetch(&self, key: &str, ctx: FetchContext) -> Result<D, E> {
        (self.f)(key.to_string(), ctx).await
    }
}

/// Wrap an async closure as a shared fetcher.
///
/// # Example
/// ```ignore
/// let fetcher = fetcher_fn(|key: String, _ctx| async move {
///     Ok::<_, String>(format!("value for {key}"))
/// });
/// ```
pub fn fetcher_fn<F, Fut, D, E>(f: F) -> Arc<dyn Fetcher<D, E>>
where
    F: Fn(String, FetchContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<D, E>> + Send + 'static,
    D: Send + 'static,
    E: Send + 'static,
{
    Arc::new(FnFetcher {
        f,
        _marker: PhantomData,
    })
}
