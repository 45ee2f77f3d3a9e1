//! Last-known-good projections of streamed data.
//!
//! Each cache holds an `Arc` that is swapped wholesale on update, so a reader always sees either
//! the previous projection or the next one, never a half-applied delta.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::types::{DateTime, Utc};
use crate::ws::types::{OrderUpdate, Quote};

/// Symbol to latest quote.
pub type MarketDataSnapshot = HashMap<String, Quote>;
/// Order id to latest status update.
pub type OrderSnapshot = HashMap<String, OrderUpdate>;

/// A cached projection together with how much to trust it.
#[non_exhaustive]
#[derive(Debug)]
pub struct CacheView<T> {
    pub data: Arc<T>,
    /// When the projection was last replaced, `None` if it never was
    pub updated_at: Option<DateTime<Utc>>,
    /// `true` whenever the connection is not CONNECTED; the data is then last known good, not live
    pub stale: bool,
}

impl<T> Clone for CacheView<T> {
    fn clone(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
            updated_at: self.updated_at,
            stale: self.stale,
        }
    }
}

#[derive(Debug)]
struct Entry<T> {
    data: Arc<T>,
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub(crate) struct Cache<T> {
    entry: RwLock<Entry<T>>,
}

impl<T: Default> Default for Cache<T> {
    fn default() -> Self {
        Self {
            entry: RwLock::new(Entry {
                data: Arc::new(T::default()),
                updated_at: None,
            }),
        }
    }
}

impl<T> Cache<T> {
    pub(crate) fn view(&self, stale: bool) -> CacheView<T> {
        // Entries are only ever replaced whole.
        let entry = self.entry.read().unwrap_or_else(PoisonError::into_inner);
        CacheView {
            data: Arc::clone(&entry.data),
            updated_at: entry.updated_at,
            stale,
        }
    }

    /// Builds the next projection from the current one and publishes it in one swap.
    pub(crate) fn replace_with<F>(&self, next: F) -> Arc<T>
    where
        F: FnOnce(&T) -> T,
    {
        let mut entry = self.entry.write().unwrap_or_else(PoisonError::into_inner);
        let data = Arc::new(next(&entry.data));

        *entry = Entry {
            data: Arc::clone(&data),
            updated_at: Some(Utc::now()),
        };
        data
    }
}
