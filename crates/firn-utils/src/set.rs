//! A hash set with the few set-algebra helpers the consensus layer leans on.

use std::collections::hash_set;
use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;

use serde::{Deserialize, Serialize};

/// A set of unique elements.
#[derive(Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Set<T: Eq + Hash> {
    inner: HashSet<T>,
}

impl<T: Eq + Hash> Default for Set<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Eq + Hash> Set<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: HashSet::new(),
        }
    }

    pub fn of<I: IntoIterator<Item = T>>(items: I) -> Self {
        Self {
            inner: items.into_iter().collect(),
        }
    }

    /// Inserts `value`, returning true if it was not already present.
    pub fn add(&mut self, value: T) -> bool {
        self.inner.insert(value)
    }

    pub fn add_all<I: IntoIterator<Item = T>>(&mut self, items: I) {
        self.inner.extend(items);
    }

    pub fn contains(&self, value: &T) -> bool {
        self.inner.contains(value)
    }

    /// Removes `value`, returning true if it was present.
    pub fn remove(&mut self, value: &T) -> bool {
        self.inner.remove(value)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }

    pub fn iter(&self) -> hash_set::Iter<'_, T> {
        self.inner.iter()
    }

    /// True when both sets hold exactly the same elements.
    pub fn equals(&self, other: &Self) -> bool {
        self.inner == other.inner
    }

    /// Absorbs every element of `other`.
    pub fn union(&mut self, other: &Self)
    where
        T: Clone,
    {
        for item in &other.inner {
            self.inner.insert(item.clone());
        }
    }

    /// True when every element of `self` is in `other`.
    pub fn is_subset(&self, other: &Self) -> bool {
        self.inner.is_subset(&other.inner)
    }
}

impl<T: Eq + Hash + Clone> Set<T> {
    #[must_use]
    pub fn list(&self) -> Vec<T> {
        self.inner.iter().cloned().collect()
    }
}

impl<T: Eq + Hash> FromIterator<T> for Set<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self::of(iter)
    }
}

impl<T: Eq + Hash> IntoIterator for Set<T> {
    type Item = T;
    type IntoIter = hash_set::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.into_iter()
    }
}

impl<'a, T: Eq + Hash> IntoIterator for &'a Set<T> {
    type Item = &'a T;
    type IntoIter = hash_set::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.iter()
    }
}

impl<T: Eq + Hash + fmt::Debug> fmt::Debug for Set<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.inner.iter()).finish()
    }
}
