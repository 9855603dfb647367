//! Paginated loading: page `n`'s key is derived from page `n - 1`'s data.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::fetcher::Fetcher;
use crate::revalidate::{Outcome, Revalidator};

/// Maps a page index and the previous page's data to the page's key.
/// `None` means there are no more pages.
pub type GetKey<D> = Arc<dyn Fn(usize, Option<&D>) -> Option<String> + Send + Sync>;

/// Snapshot of a paginated loader.
#[derive(Debug, Clone, PartialEq)]
pub struct InfiniteState<D, E> {
    /// Data of every loaded page, in order. A page without data is `None`.
    pub pages: Vec<Option<D>>,
    pub error: Option<E>,
    pub is_loading: bool,
    /// Highest page index requested.
    pub index: usize,
}

struct Pages<E> {
    keys: Vec<String>,
    error: Option<E>,
    is_loading: bool,
    index: usize,
}

/// Loads pages one after another through the shared revalidator.
pub struct SwrInfinite<D, E>
where
    D: Clone + PartialEq + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    revalidator: Revalidator<D, E>,
    fetcher: Arc<dyn Fetcher<D, E>>,
    get_key: GetKey<D>,
    scope: CancellationToken,
    pages: Mutex<Pages<E>>,
}

impl<D, E> SwrInfinite<D, E>
where
    D: Clone + PartialEq + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new(
        revalidator: Revalidator<D, E>,
        fetcher: Arc<dyn Fetcher<D, E>>,
        get_key: GetKey<D>,
    ) -> Self {
        SwrInfinite {
            revalidator,
            fetcher,
            get_key,
            scope: CancellationToken::new(),
            pages: Mutex::new(Pages {
                keys: Vec::new(),
                error: None,
                is_loading: false,
                index: 0,
            }),
        }
    }

    pub fn index(&self) -> usize {
        self.pages.lock().index
    }

    /// Keys of the loaded pages, in order.
    pub fn keys(&self) -> Vec<String> {
        self.pages.lock().keys.clone()
    }

    pub fn state(&self) -> InfiniteState<D, E> {
        let (keys, error, is_loading, index) = {
            let pages = self.pages.lock();
            (pages.keys.clone(), pages.error.clone(), pages.is_loading, pages.index)
        };
        let store = self.revalidator.store();

        InfiniteState {
            pages: keys.iter().map(|key| store.peek(key).data).collect(),
            error,
            is_loading,
            index,
        }
    }

    /// Make sure pages `0..=index` are loaded.
    ///
    /// Pages already holding data are not fetched again. Loading stops at the
    /// first page without a key or whose fetch fails.
    pub async fn load(&self, index: usize) -> InfiniteState<D, E> {
        {
            let mut pages = self.pages.lock();
            pages.index = index;
            pages.is_loading = true;
            pages.error = None;
        }

        let store = Arc::clone(self.revalidator.store());
        let mut keys = Vec::new();
        let mut error = None;
        let mut previous: Option<D> = None;

        for n in 0..=index {
            let key = (self.get_key)(n, previous.as_ref()).filter(|key| !key.is_empty());
            let Some(key) = key else {
                break;
            };

            let cached = store.lookup_or_default(&key).data;
            let data = match cached {
                Some(data) => Some(data),
                None => {
                    let outcome = self
                        .revalidator
                        .revalidate_in(&key, self.fetcher.as_ref(), &self.scope)
                        .await;
                    match outcome {
                        Outcome::Fetched(data) => Some(data),
                        Outcome::Failed(err) => {
                            error = Some(err);
                            None
                        }
                        Outcome::Cancelled | Outcome::Skipped => None,
                    }
                }
            };

            keys.push(key);
            match data {
                Some(data) => previous = Some(data),
                None => break,
            }
        }

        tracing::debug!(pages = keys.len(), index, "infinite load");
        let (stale, fresh) = {
            let mut pages = self.pages.lock();
            let stale: Vec<String> = pages
                .keys
                .iter()
                .filter(|key| !keys.contains(key))
                .cloned()
                .collect();
            let fresh: Vec<String> = keys
                .iter()
                .filter(|key| !pages.keys.contains(key))
                .cloned()
                .collect();
            pages.keys = keys;
            pages.error = error;
            pages.is_loading = false;
            (stale, fresh)
        };

        for key in &fresh {
            store.mount(key);
        }
        for key in &stale {
            store.unmount(key);
        }

        self.state()
    }

    /// Load one more page.
    pub async fn load_more(&self) -> InfiniteState<D, E> {
        let next = if self.pages.lock().keys.is_empty() {
            0
        } else {
            self.index() + 1
        };
        self.load(next).await
    }
}

impl<D, E> Drop for SwrInfinite<D, E>
where
    D: Clone + PartialEq + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.scope.cancel();
        let keys = std::mem::take(&mut self.pages.lock().keys);
        for key in keys {
            self.revalidator.store().unmount(&key);
        }
    }
}
