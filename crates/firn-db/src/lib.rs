//! Composable key-value store layers.
//!
//! The consensus core talks to storage exclusively through the traits in
//! this crate, and the concrete layers compose:
//!
//! - [`MemDb`]: `BTreeMap`-backed store for tests and ephemeral state
//! - [`PrefixDb`]: carves a namespace out of a shared store by key prefix
//! - [`VersionDb`]: buffers writes in memory until an atomic [`Commitable::commit`]
//!
//! A chain's durable state is a `VersionDb` over a `PrefixDb` over whatever
//! backend the node was configured with.

mod error;
mod memdb;
mod prefixdb;
mod versiondb;

pub use error::{DatabaseError, Result};
pub use memdb::MemDb;
pub use prefixdb::PrefixDb;
pub use versiondb::VersionDb;

use std::sync::Arc;

/// Read access to a key-value store.
pub trait KeyValueReader: Send + Sync {
    /// True when `key` is present.
    fn has(&self, key: &[u8]) -> Result<bool>;

    /// The value stored at `key`, or `None`.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
}

/// Write access to a key-value store.
pub trait KeyValueWriter: Send + Sync {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;
}

/// Delete access to a key-value store.
pub trait KeyValueDeleter: Send + Sync {
    /// Removes `key`. Deleting an absent key is not an error.
    fn delete(&self, key: &[u8]) -> Result<()>;
}

/// Creates batches of writes that apply atomically.
pub trait Batcher: Send + Sync {
    fn new_batch(&self) -> Box<dyn Batch>;
}

/// Creates ordered iterators over the store.
pub trait Iteratee: Send + Sync {
    /// Iterates every key-value pair in ascending key order.
    fn new_iterator(&self) -> Box<dyn DbIterator>;

    /// Iterates pairs whose keys start with `prefix`, in ascending order.
    fn new_iterator_with_prefix(&self, prefix: &[u8]) -> Box<dyn DbIterator>;
}

/// Liveness probe for a store.
pub trait HealthChecker: Send + Sync {
    fn health_check(&self) -> Result<()>;
}

/// The full store interface the engine persists through.
pub trait Database:
    KeyValueReader + KeyValueWriter + KeyValueDeleter + Batcher + Iteratee + HealthChecker
{
    fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;
}

/// A group of writes and deletes applied in one shot.
pub trait Batch: Send {
    /// Stages a write.
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Stages a delete.
    fn delete(&mut self, key: &[u8]) -> Result<()>;

    /// Combined size in bytes of the staged operations.
    fn size(&self) -> usize;

    /// Applies the batch. A batch applies at most once.
    fn write(&mut self) -> Result<()>;

    /// Clears the batch for reuse.
    fn reset(&mut self);
}

/// Cursor over key-value pairs.
///
/// `next` must be called (and return true) before `key`/`value` are valid.
pub trait DbIterator: Send {
    fn next(&mut self) -> bool;

    fn error(&self) -> Option<&DatabaseError>;

    fn key(&self) -> &[u8];

    fn value(&self) -> &[u8];

    /// Drops any resources pinned by the cursor.
    fn release(&mut self);
}

/// A store whose writes are staged until committed.
pub trait Commitable: Database {
    /// Flushes every staged write to the underlying store atomically.
    fn commit(&self) -> Result<()>;

    /// Discards every staged write.
    fn abort(&self);

    /// The store commits land in.
    fn underlying(&self) -> Arc<dyn Database>;
}
