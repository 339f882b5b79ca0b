//! Ordered collections keyed by a stable name or URI.

use serde::{Deserialize, Serialize};

use crate::protocol::{Prompt, Resource, ResourceTemplate, Tool};

/// Items that carry their own lookup key.
pub trait Keyed {
    fn key(&self) -> &str;
}

impl Keyed for Tool {
    fn key(&self) -> &str {
        &self.name
    }
}

impl Keyed for Prompt {
    fn key(&self) -> &str {
        &self.name
    }
}

impl Keyed for Resource {
    fn key(&self) -> &str {
        &self.uri
    }
}

impl Keyed for ResourceTemplate {
    fn key(&self) -> &str {
        &self.uri_template
    }
}

/// Insertion-ordered, last-write-wins collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Catalog<T> {
    items: Vec<T>,
}

impl<T> Default for Catalog<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T: Keyed> Catalog<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the entry with the same key in place, or append.
    ///
    /// Returns the replaced entry.
    pub fn upsert(&mut self, item: T) -> Option<T> {
        match self.items.iter().position(|i| i.key() == item.key()) {
            Some(idx) => Some(std::mem::replace(&mut self.items[idx], item)),
            None => {
                self.items.push(item);
                None
            }
        }
    }

    /// Remove by key. Returns whether an entry was removed.
    pub fn remove(&mut self, key: &str) -> bool {
        let before = self.items.len();
        self.items.retain(|i| i.key() != key);
        self.items.len() != before
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&T> {
        self.items.iter().find(|i| i.key() == key)
    }

    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }
}

impl<T: Keyed> FromIterator<T> for Catalog<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut catalog = Self::new();
        for item in iter {
            catalog.upsert(item);
        }
        catalog
    }
}
