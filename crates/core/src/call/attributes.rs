//! Per-call storage shared between unrelated interceptors.

use std::any::{Any, type_name};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;

use thiserror::Error;

/// A named, typed handle to a value in [`Attributes`].
///
/// Keys are usually declared once as constants next to the feature owning
/// them:
///
/// ```
/// use micro_host_core::AttributeKey;
///
/// const REQUEST_LOG: AttributeKey<Vec<String>> = AttributeKey::new("request-log");
/// ```
pub struct AttributeKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> AttributeKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self { name, _marker: PhantomData }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for AttributeKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for AttributeKey<T> {}

impl<T> fmt::Debug for AttributeKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AttributeKey<{}>({})", type_name::<T>(), self.name)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AttributeError {
    #[error("attribute `{name}` holds a `{stored}`, not a `{requested}`")]
    TypeMismatch { name: &'static str, stored: &'static str, requested: &'static str },
}

struct Entry {
    value: Box<dyn Any + Send + Sync>,
    type_name: &'static str,
}

#[derive(Default)]
pub struct Attributes {
    entries: HashMap<&'static str, Entry>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value`, returning the previous value under the same key.
    ///
    /// Fails when the name is already taken by a value of another type.
    pub fn put<T: Send + Sync + 'static>(&mut self, key: AttributeKey<T>, value: T) -> Result<Option<T>, AttributeError> {
        let previous = match self.entries.remove(key.name) {
            None => None,
            Some(entry) => match entry.value.downcast::<T>() {
                Ok(previous) => Some(*previous),
                Err(value) => {
                    let stored = entry.type_name;
                    self.entries.insert(key.name, Entry { value, type_name: stored });
                    return Err(mismatch(key, stored));
                }
            },
        };
        self.entries.insert(key.name, Entry { value: Box::new(value), type_name: type_name::<T>() });
        Ok(previous)
    }

    pub fn get<T: 'static>(&self, key: AttributeKey<T>) -> Option<&T> {
        self.entries.get(key.name)?.value.downcast_ref::<T>()
    }

    pub fn get_mut<T: 'static>(&mut self, key: AttributeKey<T>) -> Option<&mut T> {
        self.entries.get_mut(key.name)?.value.downcast_mut::<T>()
    }

    /// Like [`get`](Self::get) but tells a missing value apart from one of
    /// the wrong type.
    pub fn try_get<T: 'static>(&self, key: AttributeKey<T>) -> Result<Option<&T>, AttributeError> {
        match self.entries.get(key.name) {
            None => Ok(None),
            Some(entry) => entry.value.downcast_ref::<T>().map(Some).ok_or_else(|| mismatch(key, entry.type_name)),
        }
    }

    pub fn take<T: 'static>(&mut self, key: AttributeKey<T>) -> Option<T> {
        let entry = self.entries.remove(key.name)?;
        match entry.value.downcast::<T>() {
            Ok(value) => Some(*value),
            Err(value) => {
                self.entries.insert(key.name, Entry { value, type_name: entry.type_name });
                None
            }
        }
    }

    pub fn contains<T: 'static>(&self, key: AttributeKey<T>) -> bool {
        self.entries.get(key.name).is_some_and(|entry| entry.value.is::<T>())
    }

    /// Returns the value under `key`, inserting `init()` first when absent.
    pub fn compute_if_absent<T, F>(&mut self, key: AttributeKey<T>, init: F) -> Result<&mut T, AttributeError>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> T,
    {
        let entry = self
            .entries
            .entry(key.name)
            .or_insert_with(|| Entry { value: Box::new(init()), type_name: type_name::<T>() });
        let stored = entry.type_name;
        entry.value.downcast_mut::<T>().ok_or_else(|| mismatch(key, stored))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn mismatch<T>(key: AttributeKey<T>, stored: &'static str) -> AttributeError {
    AttributeError::TypeMismatch { name: key.name, stored, requested: type_name::<T>() }
}

impl fmt::Debug for Attributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.entries.iter().map(|(name, entry)| (name, entry.type_name))).finish()
    }
}
