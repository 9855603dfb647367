use std::fmt;
use std::sync::Arc;

use crate::fetcher::Fetcher;
use crate::item::ItemUpdate;
use crate::revalidate::{Outcome, Revalidator};

/// In-place draft mutation of a key's data.
pub type Producer<D> = Arc<dyn Fn(&mut D) + Send + Sync>;

/// What a mutation writes.
pub enum Payload<D> {
    /// Replace the data wholesale.
    Replace(D),
    /// Mutate the current data in place. A key without data is left untouched.
    Produce(Producer<D>),
    /// Write nothing and revalidate the key instead.
    Revalidate,
}

impl<D> Payload<D> {
    pub fn replace(data: D) -> Self {
        Payload::Replace(data)
    }

    pub fn produce<F>(f: F) -> Self
    where
        F: Fn(&mut D) + Send + Sync + 'static,
    {
        Payload::Produce(Arc::new(f))
    }
}

impl<D: Clone> Clone for Payload<D> {
    fn clone(&self) -> Self {
        match self {
            Payload::Replace(data) => Payload::Replace(data.clone()),
            Payload::Produce(f) => Payload::Produce(Arc::clone(f)),
            Payload::Revalidate => Payload::Revalidate,
        }
    }
}

impl<D: fmt::Debug> fmt::Debug for Payload<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Replace(data) => f.debug_tuple("Replace").field(data).finish(),
            Payload::Produce(_) => f.write_str("Produce(..)"),
            Payload::Revalidate => f.write_str("Revalidate"),
        }
    }
}

impl<D> From<Option<D>> for Payload<D> {
    /// `None` means "just revalidate".
    fn from(data: Option<D>) -> Self {
        match data {
            Some(data) => Payload::Replace(data),
            None => Payload::Revalidate,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MutateOptions {
    /// Also revalidate the key after writing the payload.
    pub revalidate: bool,
}

impl MutateOptions {
    pub fn revalidate() -> Self {
        MutateOptions { revalidate: true }
    }
}

/// Writes local data straight into the store, bypassing the network.
pub struct Mutator<D, E> {
    revalidator: Revalidator<D, E>,
}

impl<D, E> Clone for Mutator<D, E> {
    fn clone(&self) -> Self {
        Mutator {
            revalidator: self.revalidator.clone(),
        }
    }
}

impl<D, E> Mutator<D, E>
where
    D: Clone + PartialEq + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new(revalidator: Revalidator<D, E>) -> Self {
        Mutator { revalidator }
    }

    pub fn revalidator(&self) -> &Revalidator<D, E> {
        &self.revalidator
    }

    /// Write `payload` to `key` synchronously.
    ///
    /// Returns whether the key should be revalidated afterwards. Neither
    /// `is_loading` nor `is_busy` is touched.
    pub fn apply(&self, key: &str, payload: &Payload<D>, opts: MutateOptions) -> bool {
        let store = self.revalidator.store();
        match payload {
            Payload::Replace(data) => {
                store.update(key, ItemUpdate::new().data(data.clone()));
                opts.revalidate
            }
            Payload::Produce(producer) => {
                store.update_data_produce(key, |data| producer(data));
                opts.revalidate
            }
            Payload::Revalidate => true,
        }
    }

    /// Write `payload` to `key`, then revalidate it when asked to.
    ///
    /// Returns the revalidation outcome, or `None` when no revalidation ran.
    pub async fn mutate(
        &self,
        key: &str,
        payload: Payload<D>,
        opts: MutateOptions,
        fetcher: &dyn Fetcher<D, E>,
    ) -> Option<Outcome<D, E>> {
        if !self.apply(key, &payload, opts) {
            return None;
        }
        Some(self.revalidator.revalidate(key, fetcher).await)
    }
}
