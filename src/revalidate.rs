//! Fetch-with-cancellation state machine.
//!
//! A revalidation claims its key in the [`Store`] (busy + loading), runs the
//! fetcher, and commits the result together with the matching success or error
//! counter in one update. A second revalidation of a busy key performs no fetch
//! and joins the outstanding attempt instead, following it to completion even
//! when the key's entry is evicted while the fetch runs.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::fetcher::{FetchContext, Fetcher};
use crate::item::ItemUpdate;
use crate::store::{Claim, Store};

/// Called once per successfully completed attempt, with the key and the payload.
pub type SuccessHook<D> = Arc<dyn Fn(&str, &D) + Send + Sync>;
/// Called once per failed attempt, with the key and the error.
pub type ErrorHook<E> = Arc<dyn Fn(&str, &E) + Send + Sync>;

/// What a revalidation observed.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<D, E> {
    /// The key holds fresh data.
    Fetched(D),
    /// The latest attempt failed with this error.
    Failed(E),
    /// The attempt was cancelled or superseded; nothing was committed.
    Cancelled,
    /// No attempt was made: the key is disabled or a cache policy refused it.
    Skipped,
}

impl<D, E> Outcome<D, E> {
    /// The payload, if the revalidation produced one.
    pub fn data(self) -> Option<D> {
        match self {
            Outcome::Fetched(data) => Some(data),
            _ => None,
        }
    }

    pub fn is_fetched(&self) -> bool {
        matches!(self, Outcome::Fetched(_))
    }
}

/// Result of [`Revalidator::begin`].
pub enum Begin<D, E>
where
    D: Clone + PartialEq + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// This caller owns the key and must run the attempt.
    Started(Attempt<D, E>),
    /// Another attempt for the key is in flight; the flight follows it.
    InFlight(Flight<D, E>),
    /// No attempt can be made for the key.
    Skipped,
}

type Signal<D, E> = watch::Receiver<Option<Outcome<D, E>>>;

/// Completion signals of the attempts in flight, by key.
///
/// Kept apart from the store items, so an attempt stays joinable after its
/// entry is evicted.
pub(crate) struct Flights<D, E> {
    by_key: Mutex<HashMap<String, (u64, Signal<D, E>)>>,
}

enum Reservation<D, E> {
    Reserved(watch::Sender<Option<Outcome<D, E>>>),
    Joined(Signal<D, E>),
}

impl<D, E> Default for Flights<D, E> {
    fn default() -> Self {
        Flights {
            by_key: Mutex::new(HashMap::new()),
        }
    }
}

impl<D, E> Flights<D, E> {
    fn reserve(&self, key: &str, attempt: u64) -> Reservation<D, E> {
        let mut by_key = self.by_key.lock();
        if let Some((_, signal)) = by_key.get(key) {
            return Reservation::Joined(signal.clone());
        }
        let (sender, signal) = watch::channel(None);
        by_key.insert(key.to_string(), (attempt, signal));
        Reservation::Reserved(sender)
    }

    fn remove(&self, key: &str, attempt: u64) {
        let mut by_key = self.by_key.lock();
        if by_key.get(key).is_some_and(|(owner, _)| *owner == attempt) {
            by_key.remove(key);
        }
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, key: &str) -> bool {
        self.by_key.lock().contains_key(key)
    }
}

/// Another caller's attempt on a key, joined instead of fetching again.
pub struct Flight<D, E> {
    signal: Option<Signal<D, E>>,
}

impl<D, E> Flight<D, E>
where
    D: Clone + PartialEq + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Wait for the joined attempt. `Cancelled` means it was abandoned.
    async fn wait(self, store: &Store<D, E>, key: &str) -> Outcome<D, E> {
        let Some(mut signal) = self.signal else {
            // busy without a tracked attempt: only the store can tell
            store.wait_idle(key).await;
            let item = store.peek(key);
            return match (item.err, item.data) {
                (Some(err), _) => Outcome::Failed(err),
                (None, Some(data)) => Outcome::Fetched(data),
                (None, None) => Outcome::Cancelled,
            };
        };

        let settled = match signal.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone(),
            Err(_) => None,
        };
        settled.unwrap_or(Outcome::Cancelled)
    }
}

/// Starts revalidations against a shared [`Store`].
pub struct Revalidator<D, E> {
    store: Arc<Store<D, E>>,
    on_success: Option<SuccessHook<D>>,
    on_error: Option<ErrorHook<E>>,
}

impl<D, E> Clone for Revalidator<D, E> {
    fn clone(&self) -> Self {
        Revalidator {
            store: Arc::clone(&self.store),
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
        }
    }
}

impl<D, E> Revalidator<D, E>
where
    D: Clone + PartialEq + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new(store: Arc<Store<D, E>>) -> Self {
        Revalidator {
            store,
            on_success: None,
            on_error: None,
        }
    }

    /// Register a hook fired once per successful attempt, however many
    /// consumers observe the key.
    pub fn on_success_deduped(mut self, hook: SuccessHook<D>) -> Self {
        self.on_success = Some(hook);
        self
    }

    /// Register a hook fired once per failed attempt.
    pub fn on_error_deduped(mut self, hook: ErrorHook<E>) -> Self {
        self.on_error = Some(hook);
        self
    }

    pub fn store(&self) -> &Arc<Store<D, E>> {
        &self.store
    }

    /// Try to claim `key` for a new attempt with its own cancellation token.
    pub fn begin(&self, key: &str) -> Begin<D, E> {
        self.claim(key, CancellationToken::new())
    }

    /// Like [`Revalidator::begin`], with the attempt's token a child of `parent`.
    ///
    /// Cancelling `parent` cancels the attempt.
    pub fn begin_in(&self, key: &str, parent: &CancellationToken) -> Begin<D, E> {
        self.claim(key, parent.child_token())
    }

    /// Revalidate `key`, or wait for the attempt already in flight.
    pub async fn revalidate(&self, key: &str, fetcher: &dyn Fetcher<D, E>) -> Outcome<D, E> {
        self.settle(key, self.begin(key), fetcher).await
    }

    /// Revalidate `key` on behalf of a scope; cancelling `parent` abandons the attempt.
    pub async fn revalidate_in(
        &self,
        key: &str,
        fetcher: &dyn Fetcher<D, E>,
        parent: &CancellationToken,
    ) -> Outcome<D, E> {
        self.settle_in(key, self.begin_in(key, parent), fetcher, parent).await
    }

    pub(crate) async fn settle(
        &self,
        key: &str,
        begin: Begin<D, E>,
        fetcher: &dyn Fetcher<D, E>,
    ) -> Outcome<D, E> {
        self.settle_in(key, begin, fetcher, &CancellationToken::new()).await
    }

    /// Run or join `begin`. A joined attempt that gets abandoned is claimed
    /// again under `parent`, until one settles or `parent` is cancelled.
    pub(crate) async fn settle_in(
        &self,
        key: &str,
        mut begin: Begin<D, E>,
        fetcher: &dyn Fetcher<D, E>,
        parent: &CancellationToken,
    ) -> Outcome<D, E> {
        loop {
            let flight = match begin {
                Begin::Started(attempt) => return attempt.run(fetcher).await,
                Begin::Skipped => return Outcome::Skipped,
                Begin::InFlight(flight) => flight,
            };

            tracing::debug!(key = %key, "revalidation already in flight");
            let outcome = tokio::select! {
                biased;
                _ = parent.cancelled() => return Outcome::Cancelled,
                outcome = flight.wait(&self.store, key) => outcome,
            };
            if !matches!(outcome, Outcome::Cancelled) {
                return outcome;
            }

            tracing::debug!(key = %key, "joined revalidation abandoned, claiming again");
            begin = self.begin_in(key, parent);
        }
    }

    fn claim(&self, key: &str, token: CancellationToken) -> Begin<D, E> {
        if key.is_empty() {
            return Begin::Skipped;
        }

        let id = self.store.next_attempt();
        let signal = match self.store.flights().reserve(key, id) {
            Reservation::Joined(signal) => {
                return Begin::InFlight(Flight {
                    signal: Some(signal),
                });
            }
            Reservation::Reserved(signal) => signal,
        };

        match self.store.try_begin(key, id) {
            Claim::Owned(id) => Begin::Started(Attempt {
                revalidator: self.clone(),
                key: key.to_string(),
                id,
                token,
                signal,
                settled: false,
            }),
            claim => {
                // anyone who joined the reservation sees it close and claims again
                self.store.flights().remove(key, id);
                drop(signal);
                if claim == Claim::InFlight {
                    Begin::InFlight(Flight { signal: None })
                } else {
                    tracing::trace!(key = %key, "revalidation skipped");
                    Begin::Skipped
                }
            }
        }
    }
}

/// One owned fetch attempt for a key.
///
/// Dropping an attempt before it settles cancels its token and releases the
/// key's busy flag, so an abandoned fetch never leaves a key stuck busy.
pub struct Attempt<D, E>
where
    D: Clone + PartialEq + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    revalidator: Revalidator<D, E>,
    key: String,
    id: u64,
    token: CancellationToken,
    signal: watch::Sender<Option<Outcome<D, E>>>,
    settled: bool,
}

impl<D, E> Attempt<D, E>
where
    D: Clone + PartialEq + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The token handed to the fetcher.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Run the fetcher and commit its result unless the attempt was cancelled.
    pub async fn run(mut self, fetcher: &dyn Fetcher<D, E>) -> Outcome<D, E> {
        tracing::debug!(key = %self.key, attempt = self.id, "revalidating");

        let ctx = FetchContext::new(self.token.clone());
        let result = tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            result = fetcher.fetch(&self.key, ctx) => Some(result),
        };

        // a fetch that resolved after cancellation is discarded as well
        let Some(result) = result.filter(|_| !self.token.is_cancelled()) else {
            tracing::debug!(key = %self.key, attempt = self.id, "revalidation cancelled");
            return Outcome::Cancelled;
        };

        self.commit(result)
    }

    fn commit(&mut self, result: Result<D, E>) -> Outcome<D, E> {
        let store = &self.revalidator.store;
        let committed = store.commit(&self.key, self.id, |item| {
            let update = ItemUpdate::new().busy(false).loading(false);
            match &result {
                Ok(data) => update
                    .data(data.clone())
                    .success_count(item.on_success + 1),
                Err(err) => update.err(err.clone()).error_count(item.on_error + 1),
            }
        });

        let outcome = match result {
            _ if !committed => {
                tracing::debug!(key = %self.key, attempt = self.id, "revalidation superseded");
                Outcome::Cancelled
            }
            Ok(data) => {
                tracing::debug!(key = %self.key, attempt = self.id, "revalidation committed");
                if let Some(hook) = &self.revalidator.on_success {
                    hook(&self.key, &data);
                }
                Outcome::Fetched(data)
            }
            Err(err) => {
                tracing::debug!(key = %self.key, attempt = self.id, "revalidation failed");
                if let Some(hook) = &self.revalidator.on_error {
                    hook(&self.key, &err);
                }
                Outcome::Failed(err)
            }
        };
        self.announce(outcome.clone());
        outcome
    }

    /// Retire the flight and hand `outcome` to everyone who joined it.
    fn announce(&mut self, outcome: Outcome<D, E>) {
        self.settled = true;
        self.revalidator.store.flights().remove(&self.key, self.id);
        self.signal.send_replace(Some(outcome));
    }
}

impl<D, E> Drop for Attempt<D, E>
where
    D: Clone + PartialEq + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.token.cancel();
        if self.revalidator.store.release(&self.key, self.id) {
            tracing::debug!(key = %self.key, attempt = self.id, "released abandoned revalidation");
        }
        self.announce(Outcome::Cancelled);
    }
}
