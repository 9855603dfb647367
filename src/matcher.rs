//! Bulk mutation and revalidation of every key matching a predicate.

use futures::future::join_all;

use crate::fetcher::Fetcher;
use crate::mutate::{MutateOptions, Mutator, Payload};
use crate::revalidate::{Begin, Outcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchRevalidateOptions {
    /// Skip keys no consumer currently observes.
    pub mounted_only: bool,
}

impl Default for MatchRevalidateOptions {
    fn default() -> Self {
        MatchRevalidateOptions { mounted_only: true }
    }
}

/// Key filter matching every key that starts with `prefix`.
pub fn prefix(prefix: impl Into<String>) -> impl Fn(&str) -> bool + Send + Sync + 'static {
    let prefix = prefix.into();
    move |key: &str| key.starts_with(&prefix)
}

/// Fans mutations and revalidations out to matching store keys.
pub struct Matcher<D, E> {
    mutator: Mutator<D, E>,
}

impl<D, E> Clone for Matcher<D, E> {
    fn clone(&self) -> Self {
        Matcher {
            mutator: self.mutator.clone(),
        }
    }
}

impl<D, E> Matcher<D, E>
where
    D: Clone + PartialEq + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new(mutator: Mutator<D, E>) -> Self {
        Matcher { mutator }
    }

    /// Apply `payload` to every materialized key accepted by `filter`.
    ///
    /// All writes happen inside one store batch, so observers are notified
    /// once the whole set is written. Keys that need revalidation afterwards
    /// are revalidated concurrently. Returns the matched keys.
    pub async fn match_mutate<F>(
        &self,
        filter: F,
        payload: Payload<D>,
        opts: MutateOptions,
        fetcher: &dyn Fetcher<D, E>,
    ) -> Vec<String>
    where
        F: Fn(&str) -> bool,
    {
        let revalidator = self.mutator.revalidator();
        let store = revalidator.store();

        let (matched, attempts) = store.batch(|| {
            let matched: Vec<String> = store.keys().into_iter().filter(|key| filter(key)).collect();
            let mut attempts = Vec::new();
            for key in &matched {
                if self.mutator.apply(key, &payload, opts) {
                    attempts.push((key.clone(), revalidator.begin(key)));
                }
            }
            (matched, attempts)
        });

        tracing::debug!(matched = matched.len(), revalidating = attempts.len(), "match mutate");
        join_all(
            attempts
                .into_iter()
                .map(|(key, begin)| async move { revalidator.settle(&key, begin, fetcher).await }),
        )
        .await;

        matched
    }

    /// Write `payload` to every materialized key accepted by `filter` in one
    /// batch, without revalidating. Returns the matched keys.
    pub fn match_write<F>(&self, filter: F, payload: &Payload<D>) -> Vec<String>
    where
        F: Fn(&str) -> bool,
    {
        let store = self.mutator.revalidator().store();
        store.batch(|| {
            let matched: Vec<String> = store.keys().into_iter().filter(|key| filter(key)).collect();
            for key in &matched {
                self.mutator.apply(key, payload, MutateOptions::default());
            }
            matched
        })
    }

    /// Revalidate every materialized key accepted by `filter`.
    ///
    /// Every attempt is claimed inside one store batch before any fetch runs.
    pub async fn match_revalidate<F>(
        &self,
        filter: F,
        opts: MatchRevalidateOptions,
        fetcher: &dyn Fetcher<D, E>,
    ) -> Vec<(String, Outcome<D, E>)>
    where
        F: Fn(&str) -> bool,
    {
        let revalidator = self.mutator.revalidator();
        let store = revalidator.store();

        let attempts: Vec<(String, Begin<D, E>)> = store.batch(|| {
            store
                .keys()
                .into_iter()
                .filter(|key| filter(key))
                .filter(|key| !opts.mounted_only || store.peek(key).mounted_count > 0)
                .map(|key| {
                    let begin = revalidator.begin(&key);
                    (key, begin)
                })
                .collect()
        });

        tracing::debug!(matched = attempts.len(), "match revalidate");
        join_all(attempts.into_iter().map(|(key, begin)| async move {
            let outcome = revalidator.settle(&key, begin, fetcher).await;
            (key, outcome)
        }))
        .await
    }
}
