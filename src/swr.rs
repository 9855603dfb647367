//! The consumer-facing handle.
//!
//! A [`Swr`] observes one key at a time. Selecting a key mounts it, claims a
//! revalidation right away and starts the automatic triggers the settings ask
//! for. Changing the key or dropping the handle cancels everything owned by the
//! previous key, including its in-flight fetch.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::config::ResolvedOptions;
use crate::error::SwrError;
use crate::fetcher::Fetcher;
use crate::mutate::{MutateOptions, Mutator, Payload};
use crate::revalidate::{Outcome, Revalidator};
use crate::store::{Store, Subscription};
use crate::triggers::{self, LifecycleEvents};

/// What a consumer shows for its current key.
#[derive(Debug, Clone, PartialEq)]
pub struct SwrState<D, E> {
    pub key: Option<String>,
    pub data: Option<D>,
    pub error: Option<E>,
    pub is_loading: bool,
    /// Latched once data or an error has been observed.
    pub has_fetched: bool,
}

struct Selection {
    key: Option<String>,
    token: CancellationToken,
    subscription: Option<Subscription>,
    seen_success: u64,
    seen_error: u64,
    /// Serial and token of the running retry schedule.
    retry: Option<(u64, CancellationToken)>,
}

struct HandleState {
    selection: Selection,
    /// Last key that had data, shown while the current key has none.
    previous_key: Option<String>,
    has_fetched: bool,
}

struct Inner<D, E> {
    revalidator: Revalidator<D, E>,
    mutator: Mutator<D, E>,
    options: ResolvedOptions<D, E>,
    fetcher: Arc<dyn Fetcher<D, E>>,
    events: LifecycleEvents,
    runtime: Handle,
    scope: CancellationToken,
    state: Mutex<HandleState>,
    next_retry: AtomicU64,
}

/// A consumer of one key at a time.
pub struct Swr<D, E>
where
    D: Clone + PartialEq + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    inner: Arc<Inner<D, E>>,
}

impl<D, E> Swr<D, E>
where
    D: Clone + PartialEq + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Create a handle and select `key`. `None` or an empty key means disabled.
    ///
    /// Must be called within a Tokio runtime; background triggers are spawned on it.
    pub fn new(
        revalidator: Revalidator<D, E>,
        events: LifecycleEvents,
        options: ResolvedOptions<D, E>,
        key: Option<String>,
    ) -> Result<Self, SwrError> {
        let runtime = Handle::try_current().map_err(|e| SwrError::NoRuntime(e.to_string()))?;
        let fetcher = options.require_fetcher(key.as_deref().unwrap_or_default())?;
        let scope = CancellationToken::new();

        let inner = Arc::new(Inner {
            mutator: Mutator::new(revalidator.clone()),
            revalidator,
            options,
            fetcher,
            events,
            runtime,
            state: Mutex::new(HandleState {
                selection: Selection {
                    key: None,
                    token: scope.child_token(),
                    subscription: None,
                    seen_success: 0,
                    seen_error: 0,
                    retry: None,
                },
                previous_key: None,
                has_fetched: false,
            }),
            scope,
            next_retry: AtomicU64::new(1),
        });

        inner.select(key);
        Ok(Swr { inner })
    }

    /// The key currently observed, if any.
    pub fn key(&self) -> Option<String> {
        self.inner.state.lock().selection.key.clone()
    }

    /// Switch to another key, abandoning everything the previous key owned.
    pub fn sync_key(&self, key: Option<String>) {
        self.inner.select(key);
    }

    /// Current view of the observed key.
    pub fn state(&self) -> SwrState<D, E> {
        self.inner.view()
    }

    pub fn has_fetched(&self) -> bool {
        self.state().has_fetched
    }

    /// Revalidate the current key now.
    pub async fn revalidate(&self) -> Outcome<D, E> {
        let (key, token) = self.inner.current();
        match key {
            Some(key) => self.inner.revalidate(&key, &token).await,
            None => Outcome::Skipped,
        }
    }

    /// Write `payload` to the current key, revalidating when the payload or
    /// `opts` ask for it.
    pub async fn mutate(&self, payload: Payload<D>, opts: MutateOptions) -> Option<Outcome<D, E>> {
        let (key, token) = self.inner.current();
        let key = key?;
        if !self.inner.mutator.apply(&key, &payload, opts) {
            return None;
        }
        Some(self.inner.revalidate(&key, &token).await)
    }

    /// Suspense-style read: the data if there is some, the error if the
    /// latest attempt failed, otherwise wait for a revalidation.
    pub async fn suspend(&self) -> Result<Option<D>, E> {
        let state = self.state();
        if let Some(err) = state.error {
            return Err(err);
        }
        if state.data.is_some() || state.key.is_none() {
            return Ok(state.data);
        }

        match self.revalidate().await {
            Outcome::Fetched(data) => Ok(Some(data)),
            Outcome::Failed(err) => Err(err),
            Outcome::Cancelled | Outcome::Skipped => Ok(self.state().data),
        }
    }
}

impl<D, E> Drop for Swr<D, E>
where
    D: Clone + PartialEq + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.inner.select(None);
        self.inner.scope.cancel();
    }
}

impl<D, E> Inner<D, E>
where
    D: Clone + PartialEq + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn store(&self) -> &Arc<Store<D, E>> {
        self.revalidator.store()
    }

    fn current(&self) -> (Option<String>, CancellationToken) {
        let state = self.state.lock();
        (state.selection.key.clone(), state.selection.token.clone())
    }

    fn select(self: &Arc<Self>, key: Option<String>) {
        let settings = &self.options.settings;
        let key = key.filter(|key| !key.is_empty() && settings.is_enabled);
        if self.state.lock().selection.key == key {
            return;
        }

        let store = Arc::clone(self.store());
        let token = self.scope.child_token();
        let subscription = key.as_ref().map(|key| {
            let inner = Arc::downgrade(self);
            let observed = key.clone();
            store.subscribe(key, move |_| observe(&inner, &observed))
        });
        if let Some(key) = &key {
            store.mount(key);
        }

        let previous = {
            let mut state = self.state.lock();
            let item = key.as_deref().map(|key| store.peek(key)).unwrap_or_default();
            if item.data.is_some() || item.err.is_some() {
                state.has_fetched = true;
            }
            if settings.keep_previous_data && item.data.is_some() {
                state.previous_key = key.clone();
            }
            std::mem::replace(
                &mut state.selection,
                Selection {
                    key: key.clone(),
                    token: token.clone(),
                    subscription,
                    seen_success: item.on_success,
                    seen_error: item.on_error,
                    retry: None,
                },
            )
        };

        previous.token.cancel();
        drop(previous.subscription);
        if let Some(old) = &previous.key {
            store.unmount(old);
        }

        let Some(key) = key else {
            return;
        };
        tracing::debug!(key = %key, previous = ?previous.key, "consumer selected key");

        // claim now so the key reads as loading before this call returns
        let begin = self.revalidator.begin_in(&key, &token);
        let inner = Arc::clone(self);
        let first_key = key.clone();
        let first_token = token.clone();
        self.runtime.spawn(async move {
            inner
                .revalidator
                .settle_in(&first_key, begin, inner.fetcher.as_ref(), &first_token)
                .await;
        });

        self.spawn_triggers(key, token);
    }

    fn spawn_triggers(self: &Arc<Self>, key: String, token: CancellationToken) {
        let settings = &self.options.settings;

        if let Some(period) = settings.refresh_interval() {
            let inner = Arc::clone(self);
            let key = key.clone();
            let scope = token.clone();
            self.runtime.spawn(triggers::run_interval(period, token.clone(), move || {
                let inner = Arc::clone(&inner);
                let key = key.clone();
                let scope = scope.clone();
                async move {
                    inner.revalidate(&key, &scope).await;
                }
            }));
        }

        if settings.revalidate_on_focus || settings.revalidate_on_online {
            let accepted = settings.clone();
            let inner = Arc::clone(self);
            let scope = token.clone();
            self.runtime.spawn(triggers::run_lifecycle(
                self.events.subscribe(),
                token,
                move |event| event.accepted_by(&accepted),
                move |event| {
                    let inner = Arc::clone(&inner);
                    let key = key.clone();
                    let scope = scope.clone();
                    async move {
                        tracing::debug!(key = %key, ?event, "lifecycle revalidation");
                        inner.revalidate(&key, &scope).await;
                    }
                },
            ));
        }
    }

    async fn revalidate(&self, key: &str, token: &CancellationToken) -> Outcome<D, E> {
        self.revalidator
            .revalidate_in(key, self.fetcher.as_ref(), token)
            .await
    }

    fn view(&self) -> SwrState<D, E> {
        let (key, previous_key, latched) = {
            let state = self.state.lock();
            (
                state.selection.key.clone(),
                state.previous_key.clone(),
                state.has_fetched,
            )
        };

        let Some(key) = key else {
            return SwrState {
                key: None,
                data: None,
                error: None,
                is_loading: false,
                has_fetched: latched,
            };
        };

        let store = self.store();
        let item = store.lookup_or_default(&key);
        let keep_previous = self.options.settings.keep_previous_data;
        let has_fetched = latched || item.data.is_some() || item.err.is_some();

        let mut data = item.data;
        if data.is_none() && keep_previous {
            data = previous_key
                .filter(|previous| *previous != key)
                .and_then(|previous| store.peek(&previous).data);
        }
        if data.is_none() {
            data = self.options.fallback.get(&key).cloned();
        }

        SwrState {
            has_fetched,
            key: Some(key),
            data,
            error: item.err,
            is_loading: item.is_loading,
        }
    }

    fn on_change(self: &Arc<Self>, key: &str) {
        let item = self.store().peek(key);

        let (succeeded, failed, retry_token) = {
            let mut state = self.state.lock();
            if state.selection.key.as_deref() != Some(key) {
                return;
            }
            if item.data.is_some() || item.err.is_some() {
                state.has_fetched = true;
            }
            if self.options.settings.keep_previous_data && item.data.is_some() {
                state.previous_key = Some(key.to_string());
            }

            let selection = &mut state.selection;
            let succeeded = item.on_success > selection.seen_success;
            let failed = item.on_error > selection.seen_error;
            selection.seen_success = item.on_success;
            selection.seen_error = item.on_error;

            let retry = if succeeded {
                selection.retry.take()
            } else if failed && selection.retry.is_none() && self.options.settings.retry.is_some() {
                let serial = self.next_retry.fetch_add(1, Ordering::Relaxed);
                let token = selection.token.child_token();
                selection.retry = Some((serial, token.clone()));
                Some((serial, token))
            } else {
                None
            };
            (succeeded, failed, retry)
        };

        if succeeded {
            if let Some((_, token)) = retry_token {
                token.cancel();
            }
            if let (Some(hook), Some(data)) = (&self.options.on_success, &item.data) {
                hook(key, data);
            }
        } else if failed {
            if let (Some(hook), Some(err)) = (&self.options.on_error, &item.err) {
                hook(key, err);
            }
            if let Some((serial, token)) = retry_token {
                self.spawn_retry(key.to_string(), serial, token);
            }
        }
    }

    fn spawn_retry(self: &Arc<Self>, key: String, serial: u64, token: CancellationToken) {
        let Some(policy) = self.options.settings.retry else {
            return;
        };

        tracing::debug!(key = %key, max_attempts = policy.max_attempts, "scheduling retries");
        let inner = Arc::clone(self);
        self.runtime.spawn(async move {
            let scope = token.clone();
            let recovered = triggers::run_backoff(policy, token, || {
                let inner = Arc::clone(&inner);
                let key = key.clone();
                let scope = scope.clone();
                async move {
                    // someone else already cleared the error
                    if inner.store().peek(&key).err.is_none() {
                        return true;
                    }
                    inner.revalidate(&key, &scope).await.is_fetched()
                }
            })
            .await;

            if !recovered {
                tracing::debug!(key = %key, "retries exhausted");
            }
            let mut state = inner.state.lock();
            if state
                .selection
                .retry
                .as_ref()
                .is_some_and(|(current, _)| *current == serial)
            {
                state.selection.retry = None;
            }
        });
    }
}

fn observe<D, E>(inner: &Weak<Inner<D, E>>, key: &str)
where
    D: Clone + PartialEq + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    if let Some(inner) = inner.upgrade() {
        inner.on_change(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigScope, PartialSettings, Settings, SwrOptions};
    use crate::fetcher::fetcher_fn;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::{Duration, sleep};

    type TestSwr = Swr<String, String>;

    fn quiet() -> PartialSettings {
        PartialSettings::new()
            .revalidate_on_focus(false)
            .revalidate_on_online(false)
            .retry(None)
    }

    fn handle(
        store: &Arc<Store<String, String>>,
        options: SwrOptions<String, String>,
        key: &str,
    ) -> TestSwr {
        let scope = ConfigScope::root(Settings::default(), None).unwrap();
        let resolved = scope.resolve(&options).unwrap();
        Swr::new(
            Revalidator::new(Arc::clone(store)),
            LifecycleEvents::default(),
            resolved,
            Some(key.to_string()),
        )
        .unwrap()
    }

    fn echo(calls: Arc<AtomicUsize>, ms: u64) -> Arc<dyn Fetcher<String, String>> {
        fetcher_fn(move |key: String, _ctx| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                sleep(Duration::from_millis(ms)).await;
                Ok(key)
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_fetches_on_creation() {
        let store = Arc::new(Store::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let options = SwrOptions::new()
            .fetcher(echo(Arc::clone(&calls), 100))
            .settings(quiet());

        let swr = handle(&store, options, "foo");
        let state = swr.state();
        assert!(state.is_loading);
        assert!(state.data.is_none());
        assert!(!state.has_fetched);
        assert_eq!(store.peek("foo").mounted_count, 1);

        sleep(Duration::from_millis(150)).await;
        let state = swr.state();
        assert_eq!(state.data.as_deref(), Some("foo"));
        assert!(!state.is_loading);
        assert!(state.has_fetched);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_key_change_cancels_previous_fetch() {
        let store = Arc::new(Store::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let options = SwrOptions::new()
            .fetcher(echo(Arc::clone(&calls), 100))
            .settings(quiet());

        let swr = handle(&store, options, "a");
        sleep(Duration::from_millis(10)).await;
        swr.sync_key(Some("b".to_string()));
        // the abandoned attempt releases the key once its task observes the cancellation
        sleep(Duration::from_millis(1)).await;

        let a = store.peek("a");
        assert!(!a.is_busy);
        assert_eq!(a.mounted_count, 0);

        sleep(Duration::from_millis(200)).await;
        assert!(store.peek("a").data.is_none());
        assert_eq!(store.peek("b").data.as_deref(), Some("b"));
        assert_eq!(swr.key().as_deref(), Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_handle_never_fetches() {
        let store = Arc::new(Store::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let options = SwrOptions::new()
            .fetcher(echo(Arc::clone(&calls), 0))
            .settings(quiet().is_enabled(false));

        let swr = handle(&store, options, "foo");
        sleep(Duration::from_millis(10)).await;

        assert_eq!(swr.key(), None);
        assert_eq!(swr.revalidate().await, Outcome::Skipped);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_callbacks_fire_once_per_attempt() {
        let store = Arc::new(Store::new());
        let successes = Arc::new(AtomicUsize::new(0));
        let options = SwrOptions::new()
            .fetcher(echo(Arc::new(AtomicUsize::new(0)), 10))
            .settings(quiet())
            .on_success({
                let successes = Arc::clone(&successes);
                move |_key: &str, _data: &String| {
                    successes.fetch_add(1, Ordering::SeqCst);
                }
            });

        let swr = handle(&store, options, "k");
        sleep(Duration::from_millis(20)).await;
        assert_eq!(successes.load(Ordering::SeqCst), 1);

        // an unrelated write is not an attempt
        store.update("k", crate::item::ItemUpdate::new().mounted_count(5));
        assert_eq!(successes.load(Ordering::SeqCst), 1);

        swr.revalidate().await;
        assert_eq!(successes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refetch_keeps_cached_data() {
        let store = Arc::new(Store::new());
        store.update("k", crate::item::ItemUpdate::new().data("cached".to_string()));
        let failing = fetcher_fn(|_key: String, _ctx| async move {
            Err::<String, _>("boom".to_string())
        });

        let options = SwrOptions::new()
            .fetcher(Arc::clone(&failing))
            .settings(quiet());
        let swr = handle(&store, options, "k");
        // stale data is served while the fetch runs
        assert_eq!(swr.state().data.as_deref(), Some("cached"));

        sleep(Duration::from_millis(1)).await;
        let state = swr.state();
        assert_eq!(state.error.as_deref(), Some("boom"));
        assert_eq!(state.data.as_deref(), Some("cached"));

        // a key that never had data shows the error alone
        let fresh = handle(&store, SwrOptions::new().fetcher(failing).settings(quiet()), "new");
        sleep(Duration::from_millis(1)).await;
        let state = fresh.state();
        assert_eq!(state.error.as_deref(), Some("boom"));
        assert!(state.data.is_none());
        assert!(state.has_fetched);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_consumer_takes_over_abandoned_fetch() {
        let store = Arc::new(Store::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let options = || {
            SwrOptions::new()
                .fetcher(echo(Arc::clone(&calls), 100))
                .settings(quiet())
        };

        let first = handle(&store, options(), "k");
        let second = handle(&store, options(), "k");
        assert!(second.state().is_loading);

        sleep(Duration::from_millis(10)).await;
        first.sync_key(Some("other".to_string()));
        sleep(Duration::from_millis(1)).await;
        // the second consumer reclaimed the key right away
        assert!(store.peek("k").is_busy);

        sleep(Duration::from_millis(200)).await;
        let state = second.state();
        assert_eq!(state.data.as_deref(), Some("k"));
        assert!(!state.is_loading);
        assert_eq!(store.peek("k").mounted_count, 1);
        assert!(!store.peek("k").is_busy);
        assert_eq!(first.state().data.as_deref(), Some("other"));
        // abandoned k, other, then k again
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_consumer_stops_waiting() {
        let store = Arc::new(Store::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let options = || {
            SwrOptions::new()
                .fetcher(echo(Arc::clone(&calls), 1_000))
                .settings(quiet())
        };

        let owner = handle(&store, options(), "k");
        let waiter = handle(&store, options(), "k");
        sleep(Duration::from_millis(10)).await;
        drop(waiter);
        sleep(Duration::from_millis(10)).await;

        assert_eq!(store.peek("k").mounted_count, 1);
        assert!(store.peek("k").is_busy);
        sleep(Duration::from_millis(1_000)).await;
        assert_eq!(owner.state().data.as_deref(), Some("k"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_previous_data_across_keys() {
        let store = Arc::new(Store::new());
        let options = SwrOptions::new()
            .fetcher(echo(Arc::new(AtomicUsize::new(0)), 50))
            .settings(quiet().keep_previous_data(true));

        let swr = handle(&store, options, "a");
        sleep(Duration::from_millis(60)).await;

        swr.sync_key(Some("b".to_string()));
        let state = swr.state();
        assert!(state.is_loading);
        assert_eq!(state.data.as_deref(), Some("a"));

        sleep(Duration::from_millis(60)).await;
        assert_eq!(swr.state().data.as_deref(), Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_is_shown_until_data_arrives() {
        let store = Arc::new(Store::new());
        let options = SwrOptions::new()
            .fetcher(echo(Arc::new(AtomicUsize::new(0)), 50))
            .settings(quiet())
            .fallback("k", "placeholder".to_string());

        let swr = handle(&store, options, "k");
        let state = swr.state();
        assert_eq!(state.data.as_deref(), Some("placeholder"));
        assert!(!state.has_fetched);

        sleep(Duration::from_millis(60)).await;
        assert_eq!(swr.state().data.as_deref(), Some("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_unmounts_and_cancels() {
        let store = Arc::new(Store::new());
        let options = SwrOptions::new()
            .fetcher(echo(Arc::new(AtomicUsize::new(0)), 100))
            .settings(quiet());

        let swr = handle(&store, options, "k");
        assert!(store.peek("k").is_busy);
        drop(swr);
        sleep(Duration::from_millis(1)).await;

        let item = store.peek("k");
        assert_eq!(item.mounted_count, 0);
        assert!(!item.is_busy);

        sleep(Duration::from_millis(200)).await;
        assert!(store.peek("k").data.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspend() {
        let store = Arc::new(Store::new());
        let options = SwrOptions::new()
            .fetcher(echo(Arc::new(AtomicUsize::new(0)), 10))
            .settings(quiet());

        let swr = handle(&store, options, "k");
        assert_eq!(swr.suspend().await, Ok(Some("k".to_string())));

        let failing = fetcher_fn(|_key: String, _ctx| async move {
            Err::<String, _>("boom".to_string())
        });
        let swr = handle(&store, SwrOptions::new().fetcher(failing).settings(quiet()), "bad");
        assert_eq!(swr.suspend().await, Err("boom".to_string()));
    }

    #[tokio::test]
    async fn test_missing_fetcher() {
        let store = Arc::new(Store::<String, String>::new());
        let scope = ConfigScope::root(Settings::default(), None).unwrap();
        let resolved = scope.resolve(&SwrOptions::new()).unwrap();

        let err = Swr::new(
            Revalidator::new(store),
            LifecycleEvents::default(),
            resolved,
            Some("k".to_string()),
        )
        .err();
        assert_eq!(err, Some(SwrError::missing_fetcher("k")));
    }

    #[test]
    fn test_requires_runtime() {
        let store = Arc::new(Store::<String, String>::new());
        let fetcher = echo(Arc::new(AtomicUsize::new(0)), 0);
        let scope = ConfigScope::root(Settings::default(), Some(fetcher)).unwrap();
        let resolved = scope.resolve(&SwrOptions::new()).unwrap();

        let result = Swr::new(
            Revalidator::new(store),
            LifecycleEvents::default(),
            resolved,
            Some("k".to_string()),
        );
        assert!(matches!(result, Err(SwrError::NoRuntime(_))));
    }
}
