//! Durable vertex state: parsing, caching and the accepted frontier.

mod prefixed;
mod unique_vertex;
mod vertex;

pub use prefixed::PrefixedState;
pub use unique_vertex::UniqueVertex;
pub use vertex::{StatelessVertex, CODEC_VERSION, MAX_PARENTS, MAX_TXS};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use firn_db::VersionDb;
use firn_ids::Id;
use firn_utils::cache::LruCache;
use firn_utils::Set;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use self::unique_vertex::{VertexCell, VertexState};
use crate::consensus::avalanche::Vertex;
use crate::vm::DagVm;
use crate::{ConsensusError, Decidable, Result, Status};

/// How many vertex cells stay canonical in memory.
pub const DEFAULT_CACHE_SIZE: usize = 2048;

type Clock = Box<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// State shared by the manager and every vertex handle it hands out.
pub(crate) struct ManagerShared {
    pub(crate) chain_id: Id,
    pub(crate) state: PrefixedState,
    pub(crate) vm: Arc<dyn DagVm>,
    pub(crate) cache: Mutex<LruCache<Id, VertexCell>>,
    pub(crate) edge: RwLock<Set<Id>>,
    pub(crate) stop_vertex_activation: DateTime<Utc>,
    clock: RwLock<Option<Clock>>,
}

impl ManagerShared {
    /// Resolves the canonical cell for `id`, creating one from the durable
    /// status on a miss.
    pub(crate) fn cell(&self, id: Id) -> Result<VertexCell> {
        let mut cache = self.cache.lock();
        if let Some(cell) = cache.get(&id) {
            return Ok(cell.clone());
        }
        let status = self.state.status(&id)?;
        let cell = VertexCell::new(VertexState::unfetched(status));
        cache.put(id, cell.clone());
        Ok(cell)
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        match &*self.clock.read() {
            Some(clock) => clock(),
            None => Utc::now(),
        }
    }
}

/// Owns the durable vertex state of one chain and canonicalizes every
/// in-memory vertex handle through its cache.
pub struct VertexManager {
    shared: Arc<ManagerShared>,
}

impl VertexManager {
    /// Opens (or initializes) the chain's state slice. Refuses a store
    /// written by a newer layout.
    pub fn new(
        db: Arc<VersionDb>,
        vm: Arc<dyn DagVm>,
        chain_id: Id,
        stop_vertex_activation: DateTime<Utc>,
        cache_size: usize,
    ) -> Result<Self> {
        let state = PrefixedState::new(db);
        state.check_version()?;
        let edge = Set::of(state.edge()?);
        Ok(Self {
            shared: Arc::new(ManagerShared {
                chain_id,
                state,
                vm,
                cache: Mutex::new(LruCache::new(cache_size)),
                edge: RwLock::new(edge),
                stop_vertex_activation,
                clock: RwLock::new(None),
            }),
        })
    }

    /// Overrides the wall clock used for the stop-vertex activation gate.
    pub fn override_clock(&self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) {
        *self.shared.clock.write() = Some(Box::new(clock));
    }

    /// A handle for `id`, whatever its status.
    pub fn handle(&self, id: Id) -> Result<UniqueVertex> {
        let cell = self.shared.cell(id)?;
        Ok(UniqueVertex::new(self.shared.clone(), id, cell))
    }

    /// A handle for a vertex this node has seen; errors on a stranger.
    pub fn get_vertex(&self, id: Id) -> Result<UniqueVertex> {
        let handle = self.handle(id)?;
        if handle.status() == Status::Unknown {
            return Err(ConsensusError::UnknownItem(id));
        }
        Ok(handle)
    }

    /// Parses vertex bytes into the canonical handle, persisting newly
    /// seen vertices as `Processing`.
    pub fn parse_vertex(&self, bytes: &[u8]) -> Result<UniqueVertex> {
        let id = Id::of(bytes);
        let handle = self.handle(id)?;
        let cell = handle.shallow_refresh()?;
        if cell.read().vtx.is_some() {
            return Ok(handle);
        }

        let vtx = StatelessVertex::parse(bytes)?;
        if vtx.chain_id() != self.shared.chain_id {
            return Err(ConsensusError::InvalidVertex(format!(
                "vertex for chain {}, expected {}",
                vtx.chain_id(),
                self.shared.chain_id
            )));
        }
        let mut txs = Vec::with_capacity(vtx.txs().len());
        for tx_bytes in vtx.txs() {
            txs.push(self.shared.vm.parse_tx(tx_bytes)?);
        }

        let newly_seen = {
            let mut state = cell.write();
            state.vtx = Some(vtx);
            state.txs = txs;
            if state.status.fetched() {
                false
            } else {
                state.status = Status::Processing;
                true
            }
        };
        if newly_seen {
            self.shared.state.set_vertex(&id, bytes)?;
            self.shared.state.set_status(&id, Status::Processing)?;
            self.shared.state.commit()?;
            debug!(vertex = %id, "vertex persisted as processing");
        }
        Ok(handle)
    }

    /// Assembles a vertex over the given parents and persists it.
    pub fn build_vertex(
        &self,
        parent_ids: Vec<Id>,
        txs: Vec<Vec<u8>>,
        stop_vertex: bool,
    ) -> Result<UniqueVertex> {
        let mut height = 0;
        for parent_id in &parent_ids {
            let parent = self.get_vertex(*parent_id)?;
            height = height.max(parent.height()? + 1);
        }
        let vtx = StatelessVertex::build(
            self.shared.chain_id,
            height,
            0,
            parent_ids,
            txs,
            stop_vertex,
        )?;
        self.parse_vertex(vtx.bytes())
    }

    /// Seeds an empty chain with an accepted genesis vertex.
    pub fn initialize_genesis(&self, txs: Vec<Vec<u8>>) -> Result<UniqueVertex> {
        let vtx = StatelessVertex::build(self.shared.chain_id, 0, 0, Vec::new(), txs, false)?;
        let id = vtx.id();
        self.shared.state.set_vertex(&id, vtx.bytes())?;
        self.shared.state.set_status(&id, Status::Accepted)?;
        self.shared.state.set_edge(&[id])?;
        self.shared.state.commit()?;
        self.shared.edge.write().add(id);
        self.handle(id)
    }

    /// The accepted frontier.
    #[must_use]
    pub fn edge(&self) -> Vec<Id> {
        self.shared.edge.read().list()
    }

    /// The frontier with heights, rebuilding it from status records when
    /// the stored edge is missing (e.g. after a crash between a status
    /// write and the frontier commit).
    pub fn frontier_with_heights(&self) -> Result<Vec<(Id, u64)>> {
        let ids = {
            let edge = self.shared.edge.read();
            if edge.is_empty() {
                drop(edge);
                let rebuilt = self.shared.state.rebuild_edge()?;
                *self.shared.edge.write() = Set::of(rebuilt.iter().copied());
                rebuilt
            } else {
                edge.list()
            }
        };
        let mut frontier = Vec::with_capacity(ids.len());
        for id in ids {
            let vertex = self.get_vertex(id)?;
            frontier.push((id, vertex.height()?));
        }
        Ok(frontier)
    }

    /// Forces the frontier to be re-derived from durable statuses.
    pub fn recover_frontier(&self) -> Result<Vec<(Id, u64)>> {
        let rebuilt = self.shared.state.rebuild_edge()?;
        *self.shared.edge.write() = Set::of(rebuilt.iter().copied());
        self.frontier_with_heights()
    }

    /// Persists transaction decisions in one atomic batch.
    pub fn record_tx_decisions(&self, accepted: &[Id], rejected: &[Id]) -> Result<()> {
        if accepted.is_empty() && rejected.is_empty() {
            return Ok(());
        }
        for id in accepted {
            self.shared.state.set_tx_status(id, Status::Accepted)?;
        }
        for id in rejected {
            self.shared.state.set_tx_status(id, Status::Rejected)?;
        }
        self.shared.state.commit()
    }

    /// The durable status of a vertex.
    pub fn status(&self, id: &Id) -> Result<Status> {
        self.shared.state.status(id)
    }

    /// The durable status of a transaction.
    pub fn tx_status(&self, id: &Id) -> Result<Status> {
        self.shared.state.tx_status(id)
    }

    /// Drops every cached cell, as if the whole cache aged out.
    pub fn flush_cache(&self) {
        self.shared.cache.lock().flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::snowstorm::Tx;
    use crate::parameters::Parameters;
    use firn_db::MemDb;
    use parking_lot::RwLock as PlRwLock;

    fn id(n: u64) -> Id {
        Id::EMPTY.prefixed(n)
    }

    /// Parses any byte string into a virtuous tx whose id is its hash.
    struct HashVm;

    struct HashTx {
        id: Id,
        bytes: Vec<u8>,
        status: PlRwLock<Status>,
    }

    impl Decidable for HashTx {
        fn id(&self) -> Id {
            self.id
        }

        fn status(&self) -> Status {
            *self.status.read()
        }

        fn accept(&self) -> Result<()> {
            *self.status.write() = Status::Accepted;
            Ok(())
        }

        fn reject(&self) -> Result<()> {
            *self.status.write() = Status::Rejected;
            Ok(())
        }
    }

    impl Tx for HashTx {
        fn bytes(&self) -> Vec<u8> {
            self.bytes.clone()
        }

        fn verify(&self) -> Result<()> {
            Ok(())
        }

        fn dependencies(&self) -> Vec<Id> {
            Vec::new()
        }

        fn input_ids(&self) -> Vec<Id> {
            vec![self.id.prefixed(1)]
        }
    }

    impl DagVm for HashVm {
        fn parse_tx(&self, bytes: &[u8]) -> Result<Arc<dyn Tx>> {
            Ok(Arc::new(HashTx {
                id: Id::of(bytes),
                bytes: bytes.to_vec(),
                status: PlRwLock::new(Status::Processing),
            }))
        }

        fn get_tx(&self, _id: Id) -> Result<Option<Arc<dyn Tx>>> {
            Ok(None)
        }

        fn pending_txs(&self) -> Vec<Arc<dyn Tx>> {
            Vec::new()
        }

        fn connected(&self, _node: firn_ids::NodeId, _version: &crate::version::Version) -> Result<()> {
            Ok(())
        }

        fn disconnected(&self, _node: firn_ids::NodeId) -> Result<()> {
            Ok(())
        }
    }

    fn manager_over(db: Arc<VersionDb>) -> VertexManager {
        VertexManager::new(
            db,
            Arc::new(HashVm),
            id(999),
            Parameters::default().stop_vertex_activation,
            8,
        )
        .unwrap()
    }

    fn manager() -> (Arc<MemDb>, VertexManager) {
        let base = Arc::new(MemDb::new());
        let db = Arc::new(VersionDb::new(base.clone()));
        (base, manager_over(db))
    }

    #[test]
    fn parse_persists_processing() {
        let (_, manager) = manager();
        let genesis = manager.initialize_genesis(vec![b"g".to_vec()]).unwrap();

        let vtx = manager
            .build_vertex(vec![genesis.id()], vec![b"t".to_vec()], false)
            .unwrap();
        assert_eq!(vtx.status(), Status::Processing);
        assert_eq!(manager.status(&vtx.id()).unwrap(), Status::Processing);
        assert_eq!(vtx.height().unwrap(), 1);
    }

    #[test]
    fn handles_share_one_canonical_cell() {
        let (_, manager) = manager();
        let genesis = manager.initialize_genesis(vec![b"g".to_vec()]).unwrap();
        let vtx = manager
            .build_vertex(vec![genesis.id()], vec![b"t".to_vec()], false)
            .unwrap();

        let other = manager.get_vertex(vtx.id()).unwrap();
        vtx.accept().unwrap();
        // the second handle observes the decision without any refetch
        assert_eq!(other.status(), Status::Accepted);
        assert_eq!(other, vtx);
    }

    #[test]
    fn stale_handles_self_heal_after_eviction() {
        let (_, manager) = manager();
        let genesis = manager.initialize_genesis(vec![b"g".to_vec()]).unwrap();
        let vtx = manager
            .build_vertex(vec![genesis.id()], vec![b"t".to_vec()], false)
            .unwrap();
        let stale = manager.get_vertex(vtx.id()).unwrap();

        vtx.accept().unwrap();
        manager.flush_cache();

        // the evicted handle re-reads the durable status on next use
        assert_eq!(stale.status(), Status::Accepted);
        assert_eq!(stale.height().unwrap(), 1);
    }

    #[test]
    fn accept_advances_the_edge() {
        let (_, manager) = manager();
        let genesis = manager.initialize_genesis(vec![b"g".to_vec()]).unwrap();
        assert_eq!(manager.edge(), vec![genesis.id()]);

        let vtx = manager
            .build_vertex(vec![genesis.id()], vec![b"t".to_vec()], false)
            .unwrap();
        vtx.accept().unwrap();
        assert_eq!(manager.edge(), vec![vtx.id()]);
    }

    #[test]
    fn unknown_vertex_is_refused() {
        let (_, manager) = manager();
        assert!(matches!(
            manager.get_vertex(id(5)),
            Err(ConsensusError::UnknownItem(_))
        ));
    }

    #[test]
    fn crash_recovery_rederives_the_frontier() {
        let base = Arc::new(MemDb::new());
        let db = Arc::new(VersionDb::new(base.clone()));
        let manager = manager_over(db.clone());
        let genesis = manager.initialize_genesis(vec![b"g".to_vec()]).unwrap();
        let vtx = manager
            .build_vertex(vec![genesis.id()], vec![b"t".to_vec()], false)
            .unwrap();
        let vtx_id = vtx.id();

        // the status write lands durably, the frontier write does not:
        // accept commits both, then we tear the edge record back out to
        // model the torn write
        vtx.accept().unwrap();
        let state = PrefixedState::new(db.clone());
        state.set_edge(&[genesis.id()]).unwrap();
        state.commit().unwrap();

        // a fresh process over the same backing store
        let reopened = manager_over(Arc::new(VersionDb::new(base)));
        let frontier = reopened.recover_frontier().unwrap();
        assert_eq!(frontier, vec![(vtx_id, 1)]);
    }

    #[test]
    fn rejected_chain_vertex_chain_id_enforced() {
        let (_, manager) = manager();
        let foreign = StatelessVertex::build(
            id(123),
            0,
            0,
            Vec::new(),
            vec![b"t".to_vec()],
            false,
        )
        .unwrap();
        assert!(matches!(
            manager.parse_vertex(foreign.bytes()),
            Err(ConsensusError::InvalidVertex(_))
        ));
    }
}
