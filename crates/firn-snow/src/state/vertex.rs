//! The canonical vertex wire form.

use firn_codec::{Packer, Unpacker};
use firn_ids::{Id, ID_LEN};

use crate::{ConsensusError, Result};

/// Wire-format revision stamped on every vertex.
pub const CODEC_VERSION: u16 = 0;

/// Upper bound on parents and on transactions per vertex.
pub const MAX_PARENTS: usize = 128;
pub const MAX_TXS: usize = 128;

/// A parsed vertex, decoupled from any consensus state.
///
/// The byte form is canonical: parents are stored sorted and unique, so
/// hashing the bytes yields a stable content address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatelessVertex {
    chain_id: Id,
    height: u64,
    epoch: u32,
    stop_vertex: bool,
    parent_ids: Vec<Id>,
    txs: Vec<Vec<u8>>,
    bytes: Vec<u8>,
    id: Id,
}

impl StatelessVertex {
    /// Assembles and encodes a new vertex. Parents are sorted and deduped
    /// into canonical order.
    pub fn build(
        chain_id: Id,
        height: u64,
        epoch: u32,
        mut parent_ids: Vec<Id>,
        txs: Vec<Vec<u8>>,
        stop_vertex: bool,
    ) -> Result<Self> {
        parent_ids.sort_unstable();
        parent_ids.dedup();

        let mut p = Packer::new();
        p.pack_u16(CODEC_VERSION);
        p.pack_fixed(chain_id.as_bytes());
        p.pack_u64(height);
        p.pack_u32(epoch);
        p.pack_bool(stop_vertex);
        p.pack_seq(&parent_ids, |p, id| p.pack_fixed(id.as_bytes()));
        p.pack_seq(&txs, |p, tx| p.pack_bytes(tx));
        let bytes = p.finish()?;

        let vertex = Self {
            chain_id,
            height,
            epoch,
            stop_vertex,
            parent_ids,
            txs,
            id: Id::of(&bytes),
            bytes,
        };
        vertex.verify()?;
        Ok(vertex)
    }

    /// Decodes a vertex received off the wire or read from the store.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut u = Unpacker::new(bytes);
        let codec = u.unpack_u16()?;
        if codec != CODEC_VERSION {
            return Err(ConsensusError::InvalidVertex(format!(
                "unsupported codec version {codec}"
            )));
        }
        let chain_id = unpack_id(&mut u)?;
        let height = u.unpack_u64()?;
        let epoch = u.unpack_u32()?;
        let stop_vertex = u.unpack_bool()?;
        let parent_ids = u.unpack_seq(unpack_id)?;
        let txs = u.unpack_seq(|u| u.unpack_bytes())?;
        u.finish()?;

        let vertex = Self {
            chain_id,
            height,
            epoch,
            stop_vertex,
            parent_ids,
            txs,
            id: Id::of(bytes),
            bytes: bytes.to_vec(),
        };
        vertex.verify()?;
        Ok(vertex)
    }

    /// Structural validity, independent of any DAG state.
    pub fn verify(&self) -> Result<()> {
        if self.parent_ids.len() > MAX_PARENTS {
            return Err(ConsensusError::InvalidVertex(format!(
                "{} parents exceeds the limit of {MAX_PARENTS}",
                self.parent_ids.len()
            )));
        }
        if self.txs.len() > MAX_TXS {
            return Err(ConsensusError::InvalidVertex(format!(
                "{} txs exceeds the limit of {MAX_TXS}",
                self.txs.len()
            )));
        }
        if !self.parent_ids.windows(2).all(|w| w[0] < w[1]) {
            return Err(ConsensusError::InvalidVertex(
                "parents not sorted and unique".into(),
            ));
        }
        match (self.stop_vertex, self.txs.is_empty()) {
            (true, false) => Err(ConsensusError::InvalidVertex(
                "stop vertex carries transactions".into(),
            )),
            (false, true) => Err(ConsensusError::InvalidVertex(
                "vertex carries no transactions".into(),
            )),
            _ => Ok(()),
        }
    }

    #[must_use]
    pub fn id(&self) -> Id {
        self.id
    }

    #[must_use]
    pub fn chain_id(&self) -> Id {
        self.chain_id
    }

    #[must_use]
    pub fn height(&self) -> u64 {
        self.height
    }

    #[must_use]
    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    #[must_use]
    pub fn stop_vertex(&self) -> bool {
        self.stop_vertex
    }

    #[must_use]
    pub fn parent_ids(&self) -> &[Id] {
        &self.parent_ids
    }

    #[must_use]
    pub fn txs(&self) -> &[Vec<u8>] {
        &self.txs
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

fn unpack_id(u: &mut Unpacker<'_>) -> std::result::Result<Id, firn_codec::UnpackError> {
    let raw = u.unpack_fixed(ID_LEN)?;
    let mut arr = [0u8; ID_LEN];
    arr.copy_from_slice(raw);
    Ok(Id::from_bytes(arr))
}
