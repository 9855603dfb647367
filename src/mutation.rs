use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::fetcher::Fetcher;
use crate::matcher::Matcher;
use crate::mutate::{MutateOptions, Payload};

/// Sends a mutation to the remote side, e.g. a POST request.
pub type MutationFetcher<A, R, E> =
    Arc<dyn Fn(A) -> BoxFuture<'static, Result<R, E>> + Send + Sync>;

/// Remote mutation trigger that can write its results into matching cache keys.
pub struct SwrMutation<A, R, E, D = R> {
    matcher: Matcher<D, E>,
    filter: Arc<dyn Fn(&str) -> bool + Send + Sync>,
    send: MutationFetcher<A, R, E>,
    in_flight: AtomicUsize,
    error: Mutex<Option<E>>,
}

impl<A, R, E, D> SwrMutation<A, R, E, D>
where
    A: Send + 'static,
    R: Send + 'static,
    D: Clone + PartialEq + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// `filter` selects the cache keys [`SwrMutation::populate_cache`] writes to.
    pub fn new<F>(matcher: Matcher<D, E>, filter: F, send: MutationFetcher<A, R, E>) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        SwrMutation {
            matcher,
            filter: Arc::new(filter),
            send,
            in_flight: AtomicUsize::new(0),
            error: Mutex::new(None),
        }
    }

    /// Whether a [`SwrMutation::trigger`] call is still running.
    pub fn is_triggering(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) > 0
    }

    /// Error of the latest trigger; cleared by a successful one.
    pub fn error(&self) -> Option<E> {
        self.error.lock().clone()
    }

    /// Send the mutation. A failure is recorded and handed back to the caller.
    pub async fn trigger(&self, arg: A) -> Result<R, E> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let result = (self.send)(arg).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match result {
            Ok(response) => {
                *self.error.lock() = None;
                Ok(response)
            }
            Err(err) => {
                tracing::debug!("mutation trigger failed");
                *self.error.lock() = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Write `payload` to every cached key the filter accepts. Returns the keys written.
    pub async fn populate_cache(
        &self,
        payload: Payload<D>,
        opts: MutateOptions,
        fetcher: &dyn Fetcher<D, E>,
    ) -> Vec<String> {
        let filter = Arc::clone(&self.filter);
        self.matcher
            .match_mutate(move |key| filter(key), payload, opts, fetcher)
            .await
    }
}
