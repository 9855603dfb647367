//! Metrics middleware for fetchers.
//!
//! [`MetricsFetcher`] wraps any [`Fetcher`] and reports every fetch that runs
//! to completion to a user-provided [`MetricsSink`].
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use swr_store::{FetchMetric, MetricsFetcher, MetricsSink, fetcher_fn};
//!
//! let sink = Arc::new(MyMetricsSink::new());
//! let fetcher = fetcher_fn(|key: String, _ctx| async move { load(&key).await });
//! let fetcher = Arc::new(MetricsFetcher::new(fetcher, sink.clone()));
//! ```

use async_trait::async_trait;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

use crate::fetcher::{FetchContext, Fetcher};

/// Metrics emitted by [`MetricsFetcher`].
#[derive(Debug, Clone, PartialEq)]
pub enum FetchMetric {
    /// A fetch for `key` started.
    Started {
        key: String,
    },
    /// A fetch for `key` produced a result.
    Completed {
        key: String,
        /// Whether the fetcher returned data.
        success: bool,
        latency_ms: f64,
    },
    /// A fetch for `key` was dropped before producing a result.
    Abandoned {
        key: String,
        latency_ms: f64,
    },
}

/// Receives fetch metrics.
///
/// `emit` is called in the fetch path and should be cheap, e.g. buffer in memory.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    fn emit(&self, metric: FetchMetric);

    /// Flush buffered metrics, typically at shutdown.
    async fn flush(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// A fetcher wrapper that emits [`FetchMetric`]s for every call.
pub struct MetricsFetcher<D, E> {
    inner: Arc<dyn Fetcher<D, E>>,
    sink: Arc<dyn MetricsSink>,
    _marker: PhantomData<fn() -> (D, E)>,
}

impl<D, E> MetricsFetcher<D, E> {
    pub fn new(inner: Arc<dyn Fetcher<D, E>>, sink: Arc<dyn MetricsSink>) -> Self {
        MetricsFetcher {
            inner,
            sink,
            _marker: PhantomData,
        }
    }

    pub fn sink(&self) -> &Arc<dyn MetricsSink> {
        &self.sink
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

/// Reports `Abandoned` when the fetch future is dropped mid-flight.
struct InFlight<'a> {
    key: &'a str,
    sink: &'a dyn MetricsSink,
    start: Instant,
    finished: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.sink.emit(FetchMetric::Abandoned {
                key: self.key.to_string(),
                latency_ms: elapsed_ms(self.start),
            });
        }
    }
}

#[async_trait]
impl<D, E> Fetcher<D, E> for MetricsFetcher<D, E>
where
    D: Send + 'static,
    E: Send + 'static,
{
    async fn fetch(&self, key: &str, ctx: FetchContext) -> Result<D, E> {
        self.sink.emit(FetchMetric::Started { key: key.to_string() });
        let mut guard = InFlight {
            key,
            sink: self.sink.as_ref(),
            start: Instant::now(),
            finished: false,
        };

        let result = self.inner.fetch(key, ctx).await;
        guard.finished = true;

        self.sink.emit(FetchMetric::Completed {
            key: key.to_string(),
            success: result.is_ok(),
            latency_ms: elapsed_ms(guard.start),
        });
        result
    }
}
