use serde::Serialize;

/// The externally observed state of one key.
///
/// `data` and `err` may coexist: a failed refetch records the error and keeps
/// the last good payload, and each consumer decides what to show (see
/// [`crate::config::Settings::keep_previous_data`]).
#[derive(Debug, Clone, Serialize)]
pub struct StoreItem<D, E> {
    /// Last known successful payload.
    pub data: Option<D>,
    /// Error of the latest completed attempt, cleared when a new attempt starts.
    pub err: Option<E>,
    /// True while a fetch attempt for this key is outstanding.
    pub is_loading: bool,
    /// Deduplication flag: true exactly while one fetch is in flight.
    pub is_busy: bool,
    /// False only for the default value handed out for unknown keys.
    pub exists: bool,
    /// Number of attempts that resolved successfully.
    pub on_success: u64,
    /// Number of attempts that failed.
    pub on_error: u64,
    /// Number of consumers currently observing this key.
    pub mounted_count: u64,
    #[serde(skip)]
    pub(crate) busy_owner: u64,
}

impl<D, E> StoreItem<D, E> {
    /// The value returned for keys that have no entry.
    pub fn empty() -> Self {
        StoreItem {
            data: None,
            err: None,
            is_loading: false,
            is_busy: false,
            exists: false,
            on_success: 0,
            on_error: 0,
            mounted_count: 0,
            busy_owner: 0,
        }
    }

    pub(crate) fn materialized() -> Self {
        StoreItem {
            exists: true,
            ..Self::empty()
        }
    }
}

impl<D, E> Default for StoreItem<D, E> {
    fn default() -> Self {
        Self::empty()
    }
}

/// A partial update to a [`StoreItem`]. Unset fields are left alone.
///
/// `data` and `err` are doubly optional: `Some(None)` clears the field.
#[derive(Debug, Clone)]
pub struct ItemUpdate<D, E> {
    pub data: Option<Option<D>>,
    pub err: Option<Option<E>>,
    pub is_loading: Option<bool>,
    pub is_busy: Option<bool>,
    pub on_success: Option<u64>,
    pub on_error: Option<u64>,
    pub mounted_count: Option<u64>,
    pub(crate) owner: Option<u64>,
}

impl<D, E> Default for ItemUpdate<D, E> {
    fn default() -> Self {
        ItemUpdate {
            data: None,
            err: None,
            is_loading: None,
            is_busy: None,
            on_success: None,
            on_error: None,
            mounted_count: None,
            owner: None,
        }
    }
}

impl<D, E> ItemUpdate<D, E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data(mut self, data: D) -> Self {
        self.data = Some(Some(data));
        self
    }

    pub fn clear_data(mut self) -> Self {
        self.data = Some(None);
        self
    }

    pub fn err(mut self, err: E) -> Self {
        self.err = Some(Some(err));
        self
    }

    pub fn clear_err(mut self) -> Self {
        self.err = Some(None);
        self
    }

    pub fn loading(mut self, is_loading: bool) -> Self {
        self.is_loading = Some(is_loading);
        self
    }

    pub fn busy(mut self, is_busy: bool) -> Self {
        self.is_busy = Some(is_busy);
        self
    }

    pub fn success_count(mut self, count: u64) -> Self {
        self.on_success = Some(count);
        self
    }

    pub fn error_count(mut self, count: u64) -> Self {
        self.on_error = Some(count);
        self
    }

    pub fn mounted_count(mut self, count: u64) -> Self {
        self.mounted_count = Some(count);
        self
    }

    pub(crate) fn owned_by(mut self, attempt: u64) -> Self {
        self.owner = Some(attempt);
        self
    }

    /// Whether this update would touch no field at all.
    pub fn is_empty(&self) -> bool {
        self.data.is_none()
            && self.err.is_none()
            && self.is_loading.is_none()
            && self.is_busy.is_none()
            && self.on_success.is_none()
            && self.on_error.is_none()
            && self.mounted_count.is_none()
    }
}

impl<D: PartialEq, E> ItemUpdate<D, E> {
    /// Write every set field into `item`, returning whether anything changed.
    ///
    /// `data` is only replaced when the new value differs from the current one,
    /// so writing a deeply equal payload produces no change notification.
    pub(crate) fn apply_to(self, item: &mut StoreItem<D, E>) -> bool {
        let mut changed = false;

        if let Some(data) = self.data
            && item.data != data
        {
            item.data = data;
            changed = true;
        }
        if let Some(err) = self.err {
            // errors carry no equality, so clearing an absent error is the only no-op
            if err.is_some() || item.err.is_some() {
                changed = true;
            }
            item.err = err;
        }
        if let Some(is_busy) = self.is_busy {
            changed |= item.is_busy != is_busy;
            item.is_busy = is_busy;
            if !is_busy {
                item.busy_owner = 0;
            }
        }
        if let Some(owner) = self.owner {
            item.busy_owner = owner;
        }
        changed |= set_field(&mut item.is_loading, self.is_loading);
        changed |= set_field(&mut item.on_success, self.on_success);
        changed |= set_field(&mut item.on_error, self.on_error);
        changed |= set_field(&mut item.mounted_count, self.mounted_count);

        changed
    }
}

fn set_field<T: PartialEq>(slot: &mut T, value: Option<T>) -> bool {
    match value {
        Some(value) if *slot != value => {
            *slot = value;
            true
        }
        _ => false,
    }
}
