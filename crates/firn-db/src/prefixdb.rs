//! Key-namespace wrapper.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::{
    Batch, Batcher, Database, DatabaseError, DbIterator, HealthChecker, Iteratee, KeyValueDeleter,
    KeyValueReader, KeyValueWriter, Result,
};

/// Carves a namespace out of a shared store.
///
/// The namespace tag is hashed before use, so two tags can never produce
/// keyspaces where one is a prefix of the other.
pub struct PrefixDb {
    prefix: Vec<u8>,
    db: Arc<dyn Database>,
    closed: AtomicBool,
}

impl PrefixDb {
    /// Wraps `db`, namespacing every key under SHA-256(`tag`).
    pub fn new(db: Arc<dyn Database>, tag: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(tag);
        Self {
            prefix: hasher.finalize().to_vec(),
            db,
            closed: AtomicBool::new(false),
        }
    }

    fn guard(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(DatabaseError::Closed)
        } else {
            Ok(())
        }
    }

    fn wrap(&self, key: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.prefix.len() + key.len());
        out.extend_from_slice(&self.prefix);
        out.extend_from_slice(key);
        out
    }
}

impl KeyValueReader for PrefixDb {
    fn has(&self, key: &[u8]) -> Result<bool> {
        self.guard()?;
        self.db.has(&self.wrap(key))
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.guard()?;
        self.db.get(&self.wrap(key))
    }
}

impl KeyValueWriter for PrefixDb {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.guard()?;
        self.db.put(&self.wrap(key), value)
    }
}

impl KeyValueDeleter for PrefixDb {
    fn delete(&self, key: &[u8]) -> Result<()> {
        self.guard()?;
        self.db.delete(&self.wrap(key))
    }
}

impl Batcher for PrefixDb {
    fn new_batch(&self) -> Box<dyn Batch> {
        Box::new(PrefixBatch {
            prefix: self.prefix.clone(),
            inner: self.db.new_batch(),
        })
    }
}

impl Iteratee for PrefixDb {
    fn new_iterator(&self) -> Box<dyn DbIterator> {
        Box::new(StripIterator {
            inner: self.db.new_iterator_with_prefix(&self.prefix),
            strip: self.prefix.len(),
        })
    }

    fn new_iterator_with_prefix(&self, prefix: &[u8]) -> Box<dyn DbIterator> {
        Box::new(StripIterator {
            inner: self.db.new_iterator_with_prefix(&self.wrap(prefix)),
            strip: self.prefix.len(),
        })
    }
}

impl HealthChecker for PrefixDb {
    fn health_check(&self) -> Result<()> {
        self.guard()?;
        self.db.health_check()
    }
}

impl Database for PrefixDb {
    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.db.is_closed()
    }
}

struct PrefixBatch {
    prefix: Vec<u8>,
    inner: Box<dyn Batch>,
}

impl PrefixBatch {
    fn wrap(&self, key: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.prefix.len() + key.len());
        out.extend_from_slice(&self.prefix);
        out.extend_from_slice(key);
        out
    }
}

impl Batch for PrefixBatch {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let wrapped = self.wrap(key);
        self.inner.put(&wrapped, value)
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        let wrapped = self.wrap(key);
        self.inner.delete(&wrapped)
    }

    fn size(&self) -> usize {
        self.inner.size()
    }

    fn write(&mut self) -> Result<()> {
        self.inner.write()
    }

    fn reset(&mut self) {
        self.inner.reset()
    }
}

struct StripIterator {
    inner: Box<dyn DbIterator>,
    strip: usize,
}

impl DbIterator for StripIterator {
    fn next(&mut self) -> bool {
        self.inner.next()
    }

    fn error(&self) -> Option<&DatabaseError> {
        self.inner.error()
    }

    fn key(&self) -> &[u8] {
        let key = self.inner.key();
        if key.len() >= self.strip {
            &key[self.strip..]
        } else {
            &[]
        }
    }

    fn value(&self) -> &[u8] {
        self.inner.value()
    }

    fn release(&mut self) {
        self.inner.release()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemDb;

    #[test]
    fn namespaces_are_disjoint() {
        let base = Arc::new(MemDb::new());
        let a = PrefixDb::new(base.clone(), b"a");
        let b = PrefixDb::new(base, b"b");

        a.put(b"k", b"from-a").unwrap();
        b.put(b"k", b"from-b").unwrap();

        assert_eq!(a.get(b"k").unwrap(), Some(b"from-a".to_vec()));
        assert_eq!(b.get(b"k").unwrap(), Some(b"from-b".to_vec()));

        a.delete(b"k").unwrap();
        assert!(!a.has(b"k").unwrap());
        assert!(b.has(b"k").unwrap());
    }

    #[test]
    fn iterator_strips_the_namespace() {
        let base = Arc::new(MemDb::new());
        let db = PrefixDb::new(base, b"ns");
        db.put(b"k1", b"1").unwrap();
        db.put(b"k2", b"2").unwrap();

        let mut iter = db.new_iterator();
        let mut keys = Vec::new();
        while iter.next() {
            keys.push(iter.key().to_vec());
        }
        keys.sort();
        assert_eq!(keys, vec![b"k1".to_vec(), b"k2".to_vec()]);
    }

    #[test]
    fn nested_prefix_iteration() {
        let base = Arc::new(MemDb::new());
        let db = PrefixDb::new(base, b"ns");
        db.put(b"S/1", b"").unwrap();
        db.put(b"S/2", b"").unwrap();
        db.put(b"V/1", b"").unwrap();

        let mut iter = db.new_iterator_with_prefix(b"S/");
        let mut count = 0;
        while iter.next() {
            assert!(iter.key().starts_with(b"S/"));
            count += 1;
        }
        assert_eq!(count, 2);
    }

    #[test]
    fn batch_lands_in_namespace() {
        let base = Arc::new(MemDb::new());
        let db = PrefixDb::new(base.clone(), b"ns");
        let mut batch = db.new_batch();
        batch.put(b"k", b"v").unwrap();
        batch.write().unwrap();

        assert_eq!(db.get(b"k").unwrap(), Some(b"v".to_vec()));
        assert!(base.get(b"k").unwrap().is_none());
    }
}
