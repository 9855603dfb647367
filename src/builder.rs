//! Builder API for wiring a store, its policies and the default configuration
//! into one client.
//!
//! The client is the explicit root every consumer hangs off: there is no
//! process-wide store.

use std::sync::Arc;

use crate::config::{ConfigScope, PartialSettings, Settings, SwrOptions};
use crate::error::SwrError;
use crate::fetcher::Fetcher;
use crate::infinite::{GetKey, SwrInfinite};
use crate::matcher::{MatchRevalidateOptions, Matcher};
use crate::mutate::{MutateOptions, Mutator, Payload};
use crate::mutation::{MutationFetcher, SwrMutation};
use crate::policies::{LruPolicy, MokaPolicy, MokaPolicyConfig};
use crate::policy::CachePolicy;
use crate::revalidate::{ErrorHook, Outcome, Revalidator, SuccessHook};
use crate::store::Store;
use crate::swr::Swr;
use crate::triggers::{LifecycleEvent, LifecycleEvents};

/// Builder for [`SwrClient`].
///
/// # Example
///
/// ```ignore
/// use swr_store::{SwrClientBuilder, SwrOptions, fetcher_fn};
///
/// let client = SwrClientBuilder::<String, String>::new()
///     .lru(1_000)
///     .fetcher(fetcher_fn(|key: String, _ctx| async move { load(&key).await }))
///     .build()?;
///
/// let user = client.use_swr(Some("/api/user/1"), SwrOptions::new())?;
/// ```
pub struct SwrClientBuilder<D, E> {
    policies: Vec<Arc<dyn CachePolicy<D, E>>>,
    settings: Settings,
    fetcher: Option<Arc<dyn Fetcher<D, E>>>,
    on_success: Option<SuccessHook<D>>,
    on_error: Option<ErrorHook<E>>,
    events: Option<LifecycleEvents>,
}

impl<D, E> SwrClientBuilder<D, E>
where
    D: Clone + PartialEq + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// A builder with default settings and an unbounded store.
    pub fn new() -> Self {
        SwrClientBuilder {
            policies: Vec::new(),
            settings: Settings::default(),
            fetcher: None,
            on_success: None,
            on_error: None,
            events: None,
        }
    }

    /// Bound the store to `capacity` keys, evicting the least recently used.
    pub fn lru(self, capacity: usize) -> Self {
        self.policy(Arc::new(LruPolicy::new(capacity)))
    }

    /// Bound the store with a Moka-managed size and time policy.
    pub fn moka(self, config: MokaPolicyConfig) -> Self {
        self.policy(Arc::new(MokaPolicy::new(config)))
    }

    /// Add a custom policy. Policies run in the order they were added.
    pub fn policy(mut self, policy: Arc<dyn CachePolicy<D, E>>) -> Self {
        self.policies.push(policy);
        self
    }

    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Override individual default settings.
    pub fn configure(mut self, partial: PartialSettings) -> Self {
        self.settings = self.settings.merged(&partial);
        self
    }

    /// Default fetcher for every consumer that does not bring its own.
    pub fn fetcher(mut self, fetcher: Arc<dyn Fetcher<D, E>>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Called once per successful fetch, however many consumers share it.
    pub fn on_success_deduped<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &D) + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(f));
        self
    }

    /// Called once per failed fetch, however many consumers share it.
    pub fn on_error_deduped<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &E) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Share an existing lifecycle event hub instead of creating one.
    pub fn events(mut self, events: LifecycleEvents) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the client. Fails when the settings are invalid.
    pub fn build(self) -> Result<SwrClient<D, E>, SwrError> {
        let scope = ConfigScope::root(self.settings, self.fetcher)?;
        let store = Arc::new(Store::with_policies(self.policies));

        let mut revalidator = Revalidator::new(Arc::clone(&store));
        if let Some(hook) = self.on_success {
            revalidator = revalidator.on_success_deduped(hook);
        }
        if let Some(hook) = self.on_error {
            revalidator = revalidator.on_error_deduped(hook);
        }

        Ok(SwrClient {
            matcher: Matcher::new(Mutator::new(revalidator.clone())),
            mutator: Mutator::new(revalidator.clone()),
            revalidator,
            scope,
            events: self.events.unwrap_or_default(),
            store,
        })
    }
}

impl<D, E> Default for SwrClientBuilder<D, E>
where
    D: Clone + PartialEq + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// A store plus the configuration its consumers resolve against.
///
/// Cloning is cheap and shares the store. A [`SwrClient::scoped`] client
/// shares the store too but resolves options against a nested scope.
pub struct SwrClient<D, E> {
    store: Arc<Store<D, E>>,
    revalidator: Revalidator<D, E>,
    mutator: Mutator<D, E>,
    matcher: Matcher<D, E>,
    scope: ConfigScope<D, E>,
    events: LifecycleEvents,
}

impl<D: Clone, E> Clone for SwrClient<D, E> {
    fn clone(&self) -> Self {
        SwrClient {
            store: Arc::clone(&self.store),
            revalidator: self.revalidator.clone(),
            mutator: self.mutator.clone(),
            matcher: self.matcher.clone(),
            scope: self.scope.clone(),
            events: self.events.clone(),
        }
    }
}

impl<D, E> SwrClient<D, E>
where
    D: Clone + PartialEq + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn builder() -> SwrClientBuilder<D, E> {
        SwrClientBuilder::new()
    }

    pub fn store(&self) -> &Arc<Store<D, E>> {
        &self.store
    }

    /// Settings of this client's scope.
    pub fn settings(&self) -> &Settings {
        self.scope.settings()
    }

    pub fn events(&self) -> &LifecycleEvents {
        &self.events
    }

    /// A client over the same store whose options default to `overrides`.
    pub fn scoped(&self, overrides: &SwrOptions<D, E>) -> Result<Self, SwrError> {
        Ok(SwrClient {
            scope: self.scope.child(overrides)?,
            ..self.clone()
        })
    }

    /// Start observing `key`. `None` or an empty key creates a disabled consumer.
    ///
    /// Must be called within a Tokio runtime.
    pub fn use_swr(
        &self,
        key: Option<&str>,
        options: SwrOptions<D, E>,
    ) -> Result<Swr<D, E>, SwrError> {
        let resolved = self.scope.resolve(&options)?;
        Swr::new(
            self.revalidator.clone(),
            self.events.clone(),
            resolved,
            key.map(str::to_string),
        )
    }

    /// Paginated consumer; `get_key` derives each page's key from the previous page.
    pub fn infinite<F>(
        &self,
        get_key: F,
        options: SwrOptions<D, E>,
    ) -> Result<SwrInfinite<D, E>, SwrError>
    where
        F: Fn(usize, Option<&D>) -> Option<String> + Send + Sync + 'static,
    {
        let resolved = self.scope.resolve(&options)?;
        let fetcher = resolved.require_fetcher("")?;
        let get_key: GetKey<D> = Arc::new(get_key);
        Ok(SwrInfinite::new(self.revalidator.clone(), fetcher, get_key))
    }

    /// Remote mutation whose results can be written to keys accepted by `filter`.
    pub fn mutation<A, R, F>(
        &self,
        filter: F,
        send: MutationFetcher<A, R, E>,
    ) -> SwrMutation<A, R, E, D>
    where
        A: Send + 'static,
        R: Send + 'static,
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        SwrMutation::new(self.matcher.clone(), filter, send)
    }

    /// Revalidate `key` with the scope's fetcher.
    pub async fn revalidate(&self, key: &str) -> Result<Outcome<D, E>, SwrError> {
        let fetcher = self.require_fetcher(key)?;
        Ok(self.revalidator.revalidate(key, fetcher.as_ref()).await)
    }

    /// Write `payload` to `key`. A fetcher is only needed when the write
    /// asks for revalidation.
    pub async fn mutate(
        &self,
        key: &str,
        payload: Payload<D>,
        opts: MutateOptions,
    ) -> Result<Option<Outcome<D, E>>, SwrError> {
        if !needs_revalidation(&payload, opts) {
            self.mutator.apply(key, &payload, opts);
            return Ok(None);
        }
        let fetcher = self.require_fetcher(key)?;
        Ok(self.mutator.mutate(key, payload, opts, fetcher.as_ref()).await)
    }

    /// Write `payload` to every key `filter` accepts. Returns the matched keys.
    pub async fn match_mutate<F>(
        &self,
        filter: F,
        payload: Payload<D>,
        opts: MutateOptions,
    ) -> Result<Vec<String>, SwrError>
    where
        F: Fn(&str) -> bool,
    {
        if !needs_revalidation(&payload, opts) {
            return Ok(self.matcher.match_write(filter, &payload));
        }
        let fetcher = self.require_fetcher("")?;
        Ok(self
            .matcher
            .match_mutate(filter, payload, opts, fetcher.as_ref())
            .await)
    }

    /// Revalidate every key `filter` accepts.
    pub async fn match_revalidate<F>(
        &self,
        filter: F,
        opts: MatchRevalidateOptions,
    ) -> Result<Vec<(String, Outcome<D, E>)>, SwrError>
    where
        F: Fn(&str) -> bool,
    {
        let fetcher = self.require_fetcher("")?;
        Ok(self
            .matcher
            .match_revalidate(filter, opts, fetcher.as_ref())
            .await)
    }

    /// Broadcast a lifecycle event to every live consumer.
    pub fn emit(&self, event: LifecycleEvent) -> usize {
        self.events.emit(event)
    }

    fn require_fetcher(&self, key: &str) -> Result<Arc<dyn Fetcher<D, E>>, SwrError> {
        self.scope
            .fetcher()
            .cloned()
            .ok_or_else(|| SwrError::missing_fetcher(key))
    }
}

fn needs_revalidation<D>(payload: &Payload<D>, opts: MutateOptions) -> bool {
    opts.revalidate || matches!(payload, Payload::Revalidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::fetcher_fn;
    use crate::matcher::prefix;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{Duration, sleep};

    type Client = SwrClient<String, String>;

    fn counting(calls: Arc<AtomicUsize>) -> Arc<dyn Fetcher<String, String>> {
        fetcher_fn(move |key: String, _ctx| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(format!("{key}:v{}", calls.load(Ordering::SeqCst)))
            }
        })
    }

    fn quiet() -> PartialSettings {
        PartialSettings::new()
            .revalidate_on_online(false)
            .retry(None)
    }

    #[tokio::test]
    async fn test_use_swr_with_default_fetcher() {
        let calls = Arc::new(AtomicUsize::new(0));
        let client = Client::builder()
            .configure(quiet())
            .fetcher(counting(Arc::clone(&calls)))
            .build()
            .unwrap();

        let user = client.use_swr(Some("user:1"), SwrOptions::new()).unwrap();
        assert!(user.state().is_loading);
        sleep(Duration::from_millis(5)).await;

        assert_eq!(user.state().data.as_deref(), Some("user:1:v1"));
        assert_eq!(client.store().peek("user:1").mounted_count, 1);
    }

    #[tokio::test]
    async fn test_missing_fetcher() {
        let client = Client::builder().build().unwrap();

        let err = client.use_swr(Some("user:1"), SwrOptions::new()).err();
        assert!(matches!(err, Some(SwrError::MissingFetcher { .. })));

        let err = client.revalidate("user:1").await.unwrap_err();
        assert!(matches!(err, SwrError::MissingFetcher { key } if key == "user:1"));
    }

    #[tokio::test]
    async fn test_mutate_without_fetcher() {
        let client = Client::builder().build().unwrap();

        let outcome = client
            .mutate("draft", Payload::replace("hello".to_string()), MutateOptions::default())
            .await
            .unwrap();
        assert!(outcome.is_none());
        assert_eq!(client.store().peek("draft").data.as_deref(), Some("hello"));

        let err = client
            .mutate("draft", Payload::Revalidate, MutateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SwrError::MissingFetcher { .. }));
    }

    #[tokio::test]
    async fn test_invalid_settings_rejected() {
        let policy = crate::config::RetryPolicy {
            base_delay_ms: 0,
            max_attempts: 3,
        };
        let result = Client::builder()
            .configure(PartialSettings::new().retry(Some(policy)))
            .build();
        assert!(matches!(result, Err(SwrError::Config(_))));
    }

    #[tokio::test]
    async fn test_lru_client_evicts() {
        let client = Client::builder().lru(2).build().unwrap();
        for key in ["a", "b", "c"] {
            client
                .mutate(key, Payload::replace(key.to_string()), MutateOptions::default())
                .await
                .unwrap();
        }
        assert_eq!(client.store().keys(), vec!["b".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn test_scoped_overrides_fetcher() {
        let root_calls = Arc::new(AtomicUsize::new(0));
        let scoped_calls = Arc::new(AtomicUsize::new(0));
        let client = Client::builder()
            .configure(quiet())
            .fetcher(counting(Arc::clone(&root_calls)))
            .build()
            .unwrap();
        let scoped = client
            .scoped(&SwrOptions::new().fetcher(counting(Arc::clone(&scoped_calls))))
            .unwrap();

        let outcome = scoped.revalidate("k").await.unwrap();
        assert_eq!(outcome, Outcome::Fetched("k:v1".to_string()));
        assert_eq!(root_calls.load(Ordering::SeqCst), 0);
        // same store underneath
        assert_eq!(client.store().peek("k").data.as_deref(), Some("k:v1"));
    }

    #[tokio::test]
    async fn test_focus_revalidates_consumers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let client = Client::builder()
            .configure(quiet())
            .fetcher(counting(Arc::clone(&calls)))
            .build()
            .unwrap();

        let _user = client.use_swr(Some("user:1"), SwrOptions::new()).unwrap();
        sleep(Duration::from_millis(5)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert_eq!(client.emit(LifecycleEvent::Focus), 1);
        sleep(Duration::from_millis(5)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(client.store().peek("user:1").data.as_deref(), Some("user:1:v2"));
    }

    #[tokio::test]
    async fn test_deduped_hooks_fire_once_per_fetch() {
        let successes = Arc::new(AtomicUsize::new(0));
        let slow = fetcher_fn(|key: String, _ctx| async move {
            sleep(Duration::from_millis(20)).await;
            Ok::<_, String>(key)
        });
        let client = Client::builder()
            .fetcher(slow)
            .on_success_deduped({
                let successes = Arc::clone(&successes);
                move |_key: &str, _data: &String| {
                    successes.fetch_add(1, Ordering::SeqCst);
                }
            })
            .build()
            .unwrap();

        let (a, b) = tokio::join!(client.revalidate("k"), client.revalidate("k"));
        assert!(a.unwrap().is_fetched());
        assert!(b.unwrap().is_fetched());
        assert_eq!(successes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_match_mutate_and_revalidate() {
        let calls = Arc::new(AtomicUsize::new(0));
        let client = Client::builder()
            .fetcher(counting(Arc::clone(&calls)))
            .build()
            .unwrap();
        for key in ["todos/1", "todos/2", "users/1"] {
            client
                .mutate(key, Payload::replace("old".to_string()), MutateOptions::default())
                .await
                .unwrap();
        }

        let matched = client
            .match_mutate(
                prefix("todos/"),
                Payload::replace("new".to_string()),
                MutateOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(matched.len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let outcomes = client
            .match_revalidate(prefix("todos/"), MatchRevalidateOptions { mounted_only: false })
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(client.store().peek("users/1").data.as_deref(), Some("old"));
    }

    #[tokio::test]
    async fn test_infinite_and_mutation() {
        let client = Client::builder()
            .fetcher(counting(Arc::new(AtomicUsize::new(0))))
            .build()
            .unwrap();

        let pages = client
            .infinite(
                |index: usize, _previous: Option<&String>| {
                    (index < 2).then(|| format!("page/{index}"))
                },
                SwrOptions::new(),
            )
            .unwrap();
        assert_eq!(pages.load(1).await.pages.len(), 2);

        let send: MutationFetcher<String, String, String> =
            Arc::new(|title: String| async move { Ok(title) }.boxed());
        let mutation = client.mutation(prefix("page/"), send);
        let title = mutation.trigger("renamed".to_string()).await.unwrap();
        let written = mutation
            .populate_cache(
                Payload::replace(title),
                MutateOptions::default(),
                client.scope.fetcher().unwrap().as_ref(),
            )
            .await;
        assert_eq!(written.len(), 2);
        assert_eq!(client.store().peek("page/0").data.as_deref(), Some("renamed"));
    }
}
