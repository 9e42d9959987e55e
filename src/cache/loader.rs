//! Loader Hooks
//!
//! [`CacheLoader`] fills misses from an external source; a
//! [`BootstrapCacheLoader`] populates a cache once while it initialises.

use std::collections::HashMap;

use super::element::{ElementKey, ElementValue};
use super::engine::Cache;
use crate::error::{LoaderError, Result};

/// Source of values for keys the cache does not hold
pub trait CacheLoader: Send + Sync {
    /// Load the value for `key`; `Ok(None)` if the source has none
    fn load(&self, key: &ElementKey) -> std::result::Result<Option<ElementValue>, LoaderError>;

    /// Load several keys; keys the source has no value for are left out
    fn load_all(
        &self,
        keys: &[ElementKey],
    ) -> std::result::Result<HashMap<ElementKey, ElementValue>, LoaderError> {
        let mut loaded = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.load(key)? {
                loaded.insert(key.clone(), value);
            }
        }
        Ok(loaded)
    }
}

/// Populates a cache once during initialisation
pub trait BootstrapCacheLoader: Send + Sync {
    fn load(&self, cache: &Cache) -> Result<()>;

    /// Run on a background thread instead of blocking `initialise()`
    fn is_asynchronous(&self) -> bool {
        false
    }
}

/// Loader backed by a closure
pub struct FnLoader<F> {
    f: F,
}

impl<F> FnLoader<F>
where
    F: Fn(&ElementKey) -> std::result::Result<Option<ElementValue>, LoaderError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> CacheLoader for FnLoader<F>
where
    F: Fn(&ElementKey) -> std::result::Result<Option<ElementValue>, LoaderError> + Send + Sync,
{
    fn load(&self, key: &ElementKey) -> std::result::Result<Option<ElementValue>, LoaderError> {
        (self.f)(key)
    }
}
