//! In-memory store over a `BTreeMap`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::{
    Batch, Batcher, Database, DatabaseError, DbIterator, HealthChecker, Iteratee, KeyValueDeleter,
    KeyValueReader, KeyValueWriter, Result,
};

type Map = BTreeMap<Vec<u8>, Vec<u8>>;

/// An in-memory key-value store. Values are copied on both read and write.
#[derive(Debug, Default)]
pub struct MemDb {
    data: Arc<RwLock<Map>>,
    closed: Arc<AtomicBool>,
}

impl MemDb {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(DatabaseError::Closed)
        } else {
            Ok(())
        }
    }
}

impl KeyValueReader for MemDb {
    fn has(&self, key: &[u8]) -> Result<bool> {
        self.guard()?;
        Ok(self.data.read().contains_key(key))
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.guard()?;
        Ok(self.data.read().get(key).cloned())
    }
}

impl KeyValueWriter for MemDb {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.guard()?;
        self.data.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }
}

impl KeyValueDeleter for MemDb {
    fn delete(&self, key: &[u8]) -> Result<()> {
        self.guard()?;
        self.data.write().remove(key);
        Ok(())
    }
}

impl Batcher for MemDb {
    fn new_batch(&self) -> Box<dyn Batch> {
        Box::new(MemBatch {
            data: self.data.clone(),
            closed: self.closed.clone(),
            ops: Vec::new(),
            bytes: 0,
            applied: false,
        })
    }
}

impl Iteratee for MemDb {
    fn new_iterator(&self) -> Box<dyn DbIterator> {
        let pairs = self
            .data
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Box::new(SnapshotIterator::new(pairs))
    }

    fn new_iterator_with_prefix(&self, prefix: &[u8]) -> Box<dyn DbIterator> {
        let pairs = self
            .data
            .read()
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Box::new(SnapshotIterator::new(pairs))
    }
}

impl HealthChecker for MemDb {
    fn health_check(&self) -> Result<()> {
        self.guard()
    }
}

impl Database for MemDb {
    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

enum Op {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

struct MemBatch {
    data: Arc<RwLock<Map>>,
    closed: Arc<AtomicBool>,
    ops: Vec<Op>,
    bytes: usize,
    applied: bool,
}

impl Batch for MemBatch {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.bytes += key.len() + value.len();
        self.ops.push(Op::Put(key.to_vec(), value.to_vec()));
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.bytes += key.len();
        self.ops.push(Op::Delete(key.to_vec()));
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
        let mut data = self.data.write();
        for op in &self.ops {
            match op {
                Op::Put(k, v) => {
                    data.insert(k.clone(), v.clone());
                }
                Op::Delete(k) => {
                    data.remove(k);
                }
            }
        }
        self.applied = true;
        Ok(())
    }

    fn reset(&mut self) {
        self.ops.clear();
        self.bytes = 0;
        self.applied = false;
    }
}

/// Iterator over a materialized snapshot of pairs.
pub(crate) struct SnapshotIterator {
    pairs: Vec<(Vec<u8>, Vec<u8>)>,
    pos: Option<usize>,
}

impl SnapshotIterator {
    pub(crate) fn new(pairs: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
        Self { pairs, pos: None }
    }

    fn current(&self) -> Option<&(Vec<u8>, Vec<u8>)> {
        self.pairs.get(self.pos?)
    }
}

impl DbIterator for SnapshotIterator {
    fn next(&mut self) -> bool {
        let next = match self.pos {
            None => 0,
            Some(i) => i + 1,
        };
        self.pos = Some(next);
        next < self.pairs.len()
    }

    fn error(&self) -> Option<&DatabaseError> {
        None
    }

    fn key(&self) -> &[u8] {
        self.current().map_or(&[], |(k, _)| k.as_slice())
    }

    fn value(&self) -> &[u8] {
        self.current().map_or(&[], |(_, v)| v.as_slice())
    }

    fn release(&mut self) {
        self.pairs.clear();
        self.pos = Some(usize::MAX);
    }
}
