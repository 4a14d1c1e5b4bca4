//! The run-scoped value store shared by every task of a flow run.
//!
//! The store is a flat namespace: a value written under `amphora_id` by one
//! task is visible to every later task of the same run. Names are plain
//! strings so sub-flows can be rebound with [`Flow::isolate`]; reads and
//! writes go through typed [`Key`]s so a value always comes back as the type
//! it was written with.
//!
//! [`Flow::isolate`]: crate::flow::Flow::isolate

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::{Error, Result};

/// A type-erased store value.
pub type Value = Arc<dyn Any + Send + Sync>;

/// A typed name in the store.
pub struct Key<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Key<T> {
    /// Creates a key.
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    /// Returns the key's store name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for Key<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Key<T> {}

impl<T> fmt::Debug for Key<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self.name)
    }
}

/// Downcasts a store value, reporting the name on mismatch.
pub(crate) fn downcast<T: Clone + 'static>(name: &str, value: &Value) -> Result<T> {
    (**value)
        .downcast_ref::<T>()
        .cloned()
        .ok_or_else(|| Error::TypeMismatch {
            name: name.to_string(),
            expected: std::any::type_name::<T>(),
        })
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::internal("flow store lock poisoned")
}

/// Values produced and consumed during one flow run.
#[derive(Default)]
pub struct FlowStore {
    values: RwLock<BTreeMap<String, Value>>,
}

impl fmt::Debug for FlowStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = self.names().unwrap_or_default();
        f.debug_struct("FlowStore").field("names", &names).finish()
    }
}

impl FlowStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a value under the key's own name.
    #[must_use]
    pub fn with<T: Send + Sync + 'static>(self, key: Key<T>, value: T) -> Self {
        self.with_named(key.name(), value)
    }

    /// Seeds a value under an explicit name, for isolated sub-flows.
    #[must_use]
    pub fn with_named<T: Send + Sync + 'static>(self, name: impl Into<String>, value: T) -> Self {
        if let Ok(mut values) = self.values.write() {
            values.insert(name.into(), Arc::new(value));
        }
        self
    }

    /// Writes a value under an explicit name.
    ///
    /// # Errors
    ///
    /// Returns an error if the store lock is poisoned.
    pub fn insert_named<T: Send + Sync + 'static>(
        &self,
        name: impl Into<String>,
        value: T,
    ) -> Result<()> {
        let mut values = self.values.write().map_err(poison_err)?;
        values.insert(name.into(), Arc::new(value));
        Ok(())
    }

    /// Reads a value under the key's own name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingValue`] if absent or [`Error::TypeMismatch`] if
    /// stored with another type.
    pub fn get<T: Clone + 'static>(&self, key: Key<T>) -> Result<T> {
        self.get_named(key.name())
    }

    /// Reads a value under an explicit name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingValue`] if absent or [`Error::TypeMismatch`] if
    /// stored with another type.
    pub fn get_named<T: Clone + 'static>(&self, name: &str) -> Result<T> {
        self.get_opt_named(name)?.ok_or_else(|| Error::MissingValue {
            name: name.to_string(),
        })
    }

    /// Reads a value under the key's own name, if present.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TypeMismatch`] if stored with another type.
    pub fn get_opt<T: Clone + 'static>(&self, key: Key<T>) -> Result<Option<T>> {
        self.get_opt_named(key.name())
    }

    /// Reads a value if present.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TypeMismatch`] if stored with another type.
    pub fn get_opt_named<T: Clone + 'static>(&self, name: &str) -> Result<Option<T>> {
        self.raw(name)?
            .map(|value| downcast(name, &value))
            .transpose()
    }

    pub(crate) fn raw(&self, name: &str) -> Result<Option<Value>> {
        let values = self.values.read().map_err(poison_err)?;
        Ok(values.get(name).cloned())
    }

    /// Returns true if a value is stored under `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.values
            .read()
            .map(|values| values.contains_key(name))
            .unwrap_or(false)
    }

    /// Returns every stored name.
    ///
    /// # Errors
    ///
    /// Returns an error if the store lock is poisoned.
    pub fn names(&self) -> Result<BTreeSet<String>> {
        let values = self.values.read().map_err(poison_err)?;
        Ok(values.keys().cloned().collect())
    }
}
