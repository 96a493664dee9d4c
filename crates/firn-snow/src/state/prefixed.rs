//! Durable layout of consensus state.
//!
//! Everything lives in one versioned store under ASCII prefixes:
//!
//! | key | value |
//! |---|---|
//! | `V/<id>` | canonical vertex bytes |
//! | `S/<id>` | vertex status byte |
//! | `T/<id>` | transaction status byte |
//! | `E` | packed accepted-frontier id list |
//! | `DB/version` | store layout semver |
//!
//! Writes stage in the versioned buffer; `commit` is the only durability
//! point, so a crash rolls back to the previous committed state.

use std::sync::Arc;

use firn_codec::{Packer, Unpacker};
use firn_db::{Commitable, Iteratee, KeyValueReader, KeyValueWriter, VersionDb};
use firn_ids::{Id, ID_LEN};
use tracing::info;

use super::vertex::StatelessVertex;
use crate::version::{Version, CURRENT_STORE};
use crate::{ConsensusError, Result, Status};

const VERTEX_PREFIX: &[u8] = b"V/";
const STATUS_PREFIX: &[u8] = b"S/";
const TX_STATUS_PREFIX: &[u8] = b"T/";
const EDGE_KEY: &[u8] = b"E";
const VERSION_KEY: &[u8] = b"DB/version";

fn keyed(prefix: &[u8], id: &Id) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + ID_LEN);
    key.extend_from_slice(prefix);
    key.extend_from_slice(id.as_bytes());
    key
}

/// Typed access to the store slice owned by one chain's consensus.
pub struct PrefixedState {
    db: Arc<VersionDb>,
}

impl PrefixedState {
    #[must_use]
    pub fn new(db: Arc<VersionDb>) -> Self {
        Self { db }
    }

    /// Refuses stores written by a newer layout; stamps fresh stores.
    pub fn check_version(&self) -> Result<()> {
        match self.db.get(VERSION_KEY)? {
            Some(raw) => {
                let mut u = Unpacker::new(&raw);
                let found =
                    Version::new(u.unpack_u32()?, u.unpack_u32()?, u.unpack_u32()?);
                u.finish()?;
                if found > CURRENT_STORE {
                    return Err(ConsensusError::IncompatibleStore {
                        found: found.to_string(),
                        supported: CURRENT_STORE.to_string(),
                    });
                }
                Ok(())
            }
            None => {
                let mut p = Packer::new();
                p.pack_u32(CURRENT_STORE.major);
                p.pack_u32(CURRENT_STORE.minor);
                p.pack_u32(CURRENT_STORE.patch);
                self.db.put(VERSION_KEY, &p.finish()?)?;
                self.db.commit()?;
                Ok(())
            }
        }
    }

    pub fn vertex(&self, id: &Id) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(&keyed(VERTEX_PREFIX, id))?)
    }

    pub fn set_vertex(&self, id: &Id, bytes: &[u8]) -> Result<()> {
        self.db.put(&keyed(VERTEX_PREFIX, id), bytes)?;
        Ok(())
    }

    pub fn status(&self, id: &Id) -> Result<Status> {
        Ok(self
            .db
            .get(&keyed(STATUS_PREFIX, id))?
            .map_or(Status::Unknown, |raw| {
                Status::from_byte(raw.first().copied().unwrap_or(0))
            }))
    }

    pub fn set_status(&self, id: &Id, status: Status) -> Result<()> {
        self.db
            .put(&keyed(STATUS_PREFIX, id), &[status.as_byte()])?;
        Ok(())
    }

    pub fn tx_status(&self, id: &Id) -> Result<Status> {
        Ok(self
            .db
            .get(&keyed(TX_STATUS_PREFIX, id))?
            .map_or(Status::Unknown, |raw| {
                Status::from_byte(raw.first().copied().unwrap_or(0))
            }))
    }

    pub fn set_tx_status(&self, id: &Id, status: Status) -> Result<()> {
        self.db
            .put(&keyed(TX_STATUS_PREFIX, id), &[status.as_byte()])?;
        Ok(())
    }

    pub fn edge(&self) -> Result<Vec<Id>> {
        let Some(raw) = self.db.get(EDGE_KEY)? else {
            return Ok(Vec::new());
        };
        let mut u = Unpacker::new(&raw);
        let ids = u.unpack_seq(|u| {
            let raw = u.unpack_fixed(ID_LEN)?;
            let mut arr = [0u8; ID_LEN];
            arr.copy_from_slice(raw);
            Ok(Id::from_bytes(arr))
        })?;
        u.finish()?;
        Ok(ids)
    }

    pub fn set_edge(&self, edge: &[Id]) -> Result<()> {
        let mut p = Packer::new();
        p.pack_seq(edge, |p, id| p.pack_fixed(id.as_bytes()));
        self.db.put(EDGE_KEY, &p.finish()?)?;
        Ok(())
    }

    /// Re-derives the accepted frontier from status records and parent
    /// edges: the frontier is every accepted vertex that no other accepted
    /// vertex names as a parent. Persists and commits the result, so the
    /// state observed after recovery equals the last committed state.
    pub fn rebuild_edge(&self) -> Result<Vec<Id>> {
        let mut accepted = Vec::new();
        let mut iter = self.db.new_iterator_with_prefix(STATUS_PREFIX);
        while iter.next() {
            let key = iter.key();
            let status = Status::from_byte(iter.value().first().copied().unwrap_or(0));
            if status != Status::Accepted {
                continue;
            }
            if key.len() != STATUS_PREFIX.len() + ID_LEN {
                continue;
            }
            let mut arr = [0u8; ID_LEN];
            arr.copy_from_slice(&key[STATUS_PREFIX.len()..]);
            accepted.push(Id::from_bytes(arr));
        }
        iter.release();

        let mut frontier: Vec<Id> = accepted.clone();
        for id in &accepted {
            let Some(bytes) = self.vertex(id)? else {
                continue;
            };
            let vertex = StatelessVertex::parse(&bytes)?;
            frontier.retain(|candidate| !vertex.parent_ids().contains(candidate));
        }

        self.set_edge(&frontier)?;
        self.commit()?;
        info!(size = frontier.len(), "accepted frontier rebuilt");
        Ok(frontier)
    }

    pub fn commit(&self) -> Result<()> {
        self.db.commit()?;
        Ok(())
    }

    /// Discards staged, uncommitted writes.
    pub fn abort(&self) {
        self.db.abort();
    }
}
