//! Write-buffering layer with atomic commit.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::{
    Batch, Batcher, Commitable, Database, DatabaseError, DbIterator, HealthChecker, Iteratee,
    KeyValueDeleter, KeyValueReader, KeyValueWriter, Result,
};
use crate::memdb::SnapshotIterator;

/// A staged value: `Some` for a pending write, `None` for a pending delete.
type Staged = Option<Vec<u8>>;

/// Buffers every write in memory until [`Commitable::commit`].
///
/// Reads consult the buffer first and fall through to the underlying store,
/// so the staged state is observable before it is durable. `commit` flushes
/// the buffer through one batch, which is the engine's atomicity point: a
/// crash between commits leaves the prior committed state intact.
pub struct VersionDb {
    staged: Arc<RwLock<BTreeMap<Vec<u8>, Staged>>>,
    db: Arc<dyn Database>,
    closed: Arc<AtomicBool>,
}

impl VersionDb {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self {
            staged: Arc::new(RwLock::new(BTreeMap::new())),
            db,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn guard(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(DatabaseError::Closed)
        } else {
            Ok(())
        }
    }

    /// Number of staged, uncommitted operations.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.staged.read().len()
    }
}

impl KeyValueReader for VersionDb {
    fn has(&self, key: &[u8]) -> Result<bool> {
        self.guard()?;
        if let Some(staged) = self.staged.read().get(key) {
            return Ok(staged.is_some());
        }
        self.db.has(key)
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.guard()?;
        if let Some(staged) = self.staged.read().get(key) {
            return Ok(staged.clone());
        }
        self.db.get(key)
    }
}

impl KeyValueWriter for VersionDb {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.guard()?;
        self.staged
            .write()
            .insert(key.to_vec(), Some(value.to_vec()));
        Ok(())
    }
}

impl KeyValueDeleter for VersionDb {
    fn delete(&self, key: &[u8]) -> Result<()> {
        self.guard()?;
        self.staged.write().insert(key.to_vec(), None);
        Ok(())
    }
}

impl Batcher for VersionDb {
    fn new_batch(&self) -> Box<dyn Batch> {
        Box::new(VersionBatch {
            staged: Vec::new(),
            bytes: 0,
            applied: false,
            target: self.staged.clone(),
            closed: self.closed.clone(),
        })
    }
}

impl Iteratee for VersionDb {
    fn new_iterator(&self) -> Box<dyn DbIterator> {
        self.merged_iterator(None)
    }

    fn new_iterator_with_prefix(&self, prefix: &[u8]) -> Box<dyn DbIterator> {
        self.merged_iterator(Some(prefix.to_vec()))
    }
}

impl VersionDb {
    fn merged_iterator(&self, prefix: Option<Vec<u8>>) -> Box<dyn DbIterator> {
        let staged = self.staged.read();
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();

        let mut inner = match &prefix {
            Some(p) => self.db.new_iterator_with_prefix(p),
            None => self.db.new_iterator(),
        };
        while inner.next() {
            if !staged.contains_key(inner.key()) {
                merged.insert(inner.key().to_vec(), inner.value().to_vec());
            }
        }
        inner.release();

        for (key, value) in staged.iter() {
            let in_scope = prefix.as_ref().map_or(true, |p| key.starts_with(p));
            if !in_scope {
                continue;
            }
            if let Some(value) = value {
                merged.insert(key.clone(), value.clone());
            }
        }

        Box::new(SnapshotIterator::new(merged.into_iter().collect()))
    }
}

impl HealthChecker for VersionDb {
    fn health_check(&self) -> Result<()> {
        self.guard()?;
        self.db.health_check()
    }
}

impl Database for VersionDb {
    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.db.is_closed()
    }
}

impl Commitable for VersionDb {
    fn commit(&self) -> Result<()> {
        self.guard()?;
        let mut staged = self.staged.write();
        if staged.is_empty() {
            return Ok(());
        }
        let mut batch = self.db.new_batch();
        for (key, value) in staged.iter() {
            match value {
                Some(value) => batch.put(key, value)?,
                None => batch.delete(key)?,
            }
        }
        batch.write()?;
        staged.clear();
        Ok(())
    }

    fn abort(&self) {
        self.staged.write().clear();
    }

    fn underlying(&self) -> Arc<dyn Database> {
        self.db.clone()
    }
}

// A batch over VersionDb lands in the staging buffer, not the backing store;
// commit remains the only durability point.
struct VersionBatch {
    staged: Vec<(Vec<u8>, Staged)>,
    bytes: usize,
    applied: bool,
    target: Arc<RwLock<BTreeMap<Vec<u8>, Staged>>>,
    closed: Arc<AtomicBool>,
}

impl Batch for VersionBatch {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.bytes += key.len() + value.len();
        self.staged.push((key.to_vec(), Some(value.to_vec())));
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.bytes += key.len();
        self.staged.push((key.to_vec(), None));
        Ok(())
    }

    fn size(&self) -> usize {
        self.bytes
    }

    fn write(&mut self) -> Result<()> {
        if self.applied {
            return Err(DatabaseError::BatchApplied);
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(DatabaseError::Closed);
        }
        let mut target = self.target.write();
        for (key, value) in self.staged.drain(..) {
            target.insert(key, value);
        }
        self.applied = true;
        Ok(())
    }

    fn reset(&mut self) {
        self.staged.clear();
        self.bytes = 0;
        self.applied = false;
    }
}
