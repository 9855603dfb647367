//! swr-store - A stale-while-revalidate (SWR) data-fetching layer for Rust
//!
//! This library provides a keyed cache of remote data with:
//! - Stale-while-revalidate reads: cached data is served while a refetch runs
//! - Deduplication of concurrent fetches for the same key
//! - Cancellation of in-flight fetches when a consumer moves to another key
//! - Pluggable cache policies (LRU, Moka) that may reject or evict entries
//! - Local and bulk mutation with optional revalidation
//!
//! # Example
//!
//! ```ignore
//! use swr_store::{MutateOptions, Payload, SwrClient, SwrOptions, fetcher_fn};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), swr_store::SwrError> {
//!     let client = SwrClient::<String, String>::builder()
//!         .lru(5_000)
//!         .fetcher(fetcher_fn(|key: String, _ctx| async move {
//!             // Load from the network - `key` is "/api/user/1"
//!             Ok(format!("User data for {key}"))
//!         }))
//!         .build()?;
//!
//!     // Observe a key: it is fetched right away and kept fresh on focus
//!     let user = client.use_swr(Some("/api/user/1"), SwrOptions::new())?;
//!     let data = user.suspend().await;
//!
//!     // Local write without a network round trip
//!     client
//!         .mutate(
//!             "/api/user/1",
//!             Payload::replace("renamed".to_string()),
//!             MutateOptions::default(),
//!         )
//!         .await?;
//!     Ok(())
//! }
//! ```

mod builder;
mod config;
mod error;
mod fetcher;
mod infinite;
mod item;
pub mod lru;
mod matcher;
mod metrics;
mod mutate;
mod mutation;
pub mod policies;
mod policy;
mod revalidate;
mod store;
mod swr;
mod triggers;

// Re-export public API
pub use builder::{SwrClient, SwrClientBuilder};
pub use config::{ConfigScope, PartialSettings, ResolvedOptions, RetryPolicy, Settings, SwrOptions};
pub use error::SwrError;
pub use fetcher::{FetchContext, Fetcher, FnFetcher, fetcher_fn};
pub use infinite::{GetKey, InfiniteState, SwrInfinite};
pub use item::{ItemUpdate, StoreItem};
pub use lru::LruCache;
pub use matcher::{MatchRevalidateOptions, Matcher, prefix};
pub use metrics::{FetchMetric, MetricsFetcher, MetricsSink};
pub use mutate::{MutateOptions, Mutator, Payload, Producer};
pub use mutation::{MutationFetcher, SwrMutation};
pub use policies::lru::LruPolicy;
pub use policies::moka::{MokaPolicy, MokaPolicyConfig};
pub use policy::{CachePolicy, Evictions, Verdict};
pub use revalidate::{Attempt, Begin, ErrorHook, Flight, Outcome, Revalidator, SuccessHook};
pub use store::{Store, Subscription};
pub use swr::{Swr, SwrState};
pub use triggers::{LifecycleEvent, LifecycleEvents};
