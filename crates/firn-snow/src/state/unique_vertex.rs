//! Canonical shared vertex handles.
//!
//! For any vertex id there is one canonical state cell, resolved through
//! the manager's LRU cache. A [`UniqueVertex`] is a thin handle around
//! that cell. Eviction clears the cell's `latest` bit and drops its
//! materialized parent handles; the next status-observing operation on any
//! handle re-resolves the canonical cell (re-reading the durable status on
//! a true miss) and adopts it, so stale handles self-heal and decided
//! ancestors can be garbage-collected.

use std::sync::Arc;

use firn_ids::Id;
use firn_utils::cache::Evictable;
use firn_utils::Set;
use parking_lot::RwLock;

use super::vertex::StatelessVertex;
use super::ManagerShared;
use crate::consensus::avalanche::Vertex;
use crate::consensus::snowstorm::Tx;
use crate::{ConsensusError, Decidable, Result, Status};

/// The canonical mutable state for one vertex id.
pub(crate) struct VertexState {
    /// False once the cell has been evicted from the cache.
    pub(crate) latest: bool,
    pub(crate) status: Status,
    pub(crate) vtx: Option<StatelessVertex>,
    pub(crate) txs: Vec<Arc<dyn Tx>>,
    /// Materialized lazily; cleared on eviction and on decision.
    pub(crate) parents: Option<Vec<UniqueVertex>>,
}

impl VertexState {
    pub(crate) fn unfetched(status: Status) -> Self {
        Self {
            latest: true,
            status,
            vtx: None,
            txs: Vec::new(),
            parents: None,
        }
    }
}

/// Shared ownership of one vertex's canonical state.
#[derive(Clone)]
pub(crate) struct VertexCell(Arc<RwLock<VertexState>>);

impl VertexCell {
    pub(crate) fn new(state: VertexState) -> Self {
        Self(Arc::new(RwLock::new(state)))
    }

    fn is(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl std::ops::Deref for VertexCell {
    type Target = RwLock<VertexState>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Evictable for VertexCell {
    fn evict(&self) {
        let mut state = self.write();
        state.latest = false;
        state.parents = None;
    }
}

/// A handle to the canonical state of one vertex. Cheap to clone; equality
/// is by id.
pub struct UniqueVertex {
    id: Id,
    shared: Arc<ManagerShared>,
    cell: RwLock<VertexCell>,
}

impl Clone for UniqueVertex {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            shared: self.shared.clone(),
            cell: RwLock::new(self.cell.read().clone()),
        }
    }
}

impl PartialEq for UniqueVertex {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for UniqueVertex {}

impl std::fmt::Debug for UniqueVertex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "UniqueVertex({}, {})", self.id, self.status())
    }
}

impl UniqueVertex {
    pub(crate) fn new(shared: Arc<ManagerShared>, id: Id, cell: VertexCell) -> Self {
        Self {
            id,
            shared,
            cell: RwLock::new(cell),
        }
    }

    fn current_cell(&self) -> VertexCell {
        self.cell.read().clone()
    }

    /// Ensures the handle points at the canonical cell and that the cell's
    /// status is current. The inner vertex may still be unloaded after
    /// this returns.
    pub(crate) fn shallow_refresh(&self) -> Result<VertexCell> {
        let current = self.current_cell();
        if current.read().latest {
            return Ok(current);
        }
        let canonical = self.shared.cell(self.id)?;
        if !canonical.is(&current) {
            // carry parsed innards over so a re-fetch is not needed
            let current_state = current.read();
            let mut canon = canonical.write();
            if canon.vtx.is_none() && current_state.vtx.is_some() {
                canon.vtx = current_state.vtx.clone();
                canon.txs = current_state.txs.clone();
            }
        }
        *self.cell.write() = canonical.clone();
        Ok(canonical)
    }

    /// Shallow refresh plus loading the inner vertex from the store when
    /// it is known but not in memory.
    pub(crate) fn refresh(&self) -> Result<VertexCell> {
        let cell = self.shallow_refresh()?;
        let needs_load = {
            let state = cell.read();
            state.vtx.is_none() && state.status.fetched()
        };
        if needs_load {
            if let Some(bytes) = self.shared.state.vertex(&self.id)? {
                let vtx = StatelessVertex::parse(&bytes)?;
                let mut state = cell.write();
                if state.vtx.is_none() {
                    state.vtx = Some(vtx);
                    state.txs.clear();
                }
            }
        }
        Ok(cell)
    }

    fn inner(&self) -> Result<(VertexCell, StatelessVertex)> {
        let cell = self.refresh()?;
        let vtx = cell
            .read()
            .vtx
            .clone()
            .ok_or(ConsensusError::UnknownItem(self.id))?;
        Ok((cell, vtx))
    }

    /// Walks the non-accepted closure of this vertex, collecting the
    /// processing vertex/tx ids (`transitive`), the accepted vertices hit
    /// at the boundary, and every non-accepted tx dependency.
    fn closure(&self) -> Result<(Set<Id>, Set<Id>, Set<Id>)> {
        let mut visited = Set::new();
        let mut transitive = Set::new();
        let mut boundary = Set::new();
        let mut deps = Set::new();

        let mut queue = vec![self.clone()];
        while let Some(current) = queue.pop() {
            if current.status() == Status::Accepted {
                boundary.add(current.id());
                continue;
            }
            if !visited.add(current.id()) {
                continue;
            }
            transitive.add(current.id());
            for tx in current.txs()? {
                transitive.add(tx.id());
                for dep in tx.dependencies() {
                    if self.shared.state.tx_status(&dep)? != Status::Accepted {
                        deps.add(dep);
                    }
                }
            }
            queue.extend(current.parents()?);
        }
        Ok((transitive, boundary, deps))
    }

    /// Parent handles, materialized through the cache and memoized until
    /// eviction or decision.
    pub fn parents(&self) -> Result<Vec<UniqueVertex>> {
        let (cell, vtx) = self.inner()?;
        {
            let state = cell.read();
            if let Some(parents) = &state.parents {
                if parents.len() == vtx.parent_ids().len() {
                    return Ok(parents.clone());
                }
            }
        }
        let mut parents = Vec::with_capacity(vtx.parent_ids().len());
        for parent_id in vtx.parent_ids() {
            let parent_cell = self.shared.cell(*parent_id)?;
            parents.push(UniqueVertex::new(
                self.shared.clone(),
                *parent_id,
                parent_cell,
            ));
        }
        cell.write().parents = Some(parents.clone());
        Ok(parents)
    }

    /// The whitelist of a stop vertex: every processing vertex and tx id
    /// transitively referenced. Empty for ordinary vertices.
    pub fn whitelist(&self) -> Result<Set<Id>> {
        if !self.stop_vertex() {
            return Ok(Set::new());
        }
        let (transitive, _, _) = self.closure()?;
        Ok(transitive)
    }
}

impl Decidable for UniqueVertex {
    fn id(&self) -> Id {
        self.id
    }

    fn status(&self) -> Status {
        self.shallow_refresh()
            .map(|cell| cell.read().status)
            .unwrap_or(Status::Unknown)
    }

    fn accept(&self) -> Result<()> {
        let (cell, vtx) = self.inner()?;
        cell.write().status = Status::Accepted;
        self.shared.state.set_status(&self.id, Status::Accepted)?;

        {
            let mut edge = self.shared.edge.write();
            edge.add(self.id);
            for parent in vtx.parent_ids() {
                edge.remove(parent);
            }
            self.shared.state.set_edge(&edge.list())?;
        }

        // decided vertices never traverse into their parents again
        cell.write().parents = None;
        self.shared.state.commit()
    }

    fn reject(&self) -> Result<()> {
        let cell = self.shallow_refresh()?;
        {
            let mut state = cell.write();
            state.status = Status::Rejected;
            state.parents = None;
        }
        self.shared.state.set_status(&self.id, Status::Rejected)?;
        self.shared.state.commit()
    }
}

impl Vertex for UniqueVertex {
    fn parent_ids(&self) -> Result<Vec<Id>> {
        let (_, vtx) = self.inner()?;
        Ok(vtx.parent_ids().to_vec())
    }

    fn height(&self) -> Result<u64> {
        let (_, vtx) = self.inner()?;
        Ok(vtx.height())
    }

    fn epoch(&self) -> Result<u32> {
        let (_, vtx) = self.inner()?;
        Ok(vtx.epoch())
    }

    fn txs(&self) -> Result<Vec<Arc<dyn Tx>>> {
        let (cell, vtx) = self.inner()?;
        {
            let state = cell.read();
            if state.txs.len() == vtx.txs().len() {
                return Ok(state.txs.clone());
            }
        }
        let mut txs = Vec::with_capacity(vtx.txs().len());
        for tx_bytes in vtx.txs() {
            txs.push(self.shared.vm.parse_tx(tx_bytes)?);
        }
        cell.write().txs = txs.clone();
        Ok(txs)
    }

    fn bytes(&self) -> Vec<u8> {
        self.inner()
            .map(|(_, vtx)| vtx.bytes().to_vec())
            .unwrap_or_default()
    }

    fn stop_vertex(&self) -> bool {
        self.inner().map(|(_, vtx)| vtx.stop_vertex()).unwrap_or(false)
    }

    /// Verifies the vertex before issuance.
    ///
    /// Ordinary vertices only need their structural checks plus the
    /// one-shot rule that nothing may build on top of an accepted stop
    /// vertex. A stop vertex is additionally gated on the activation time,
    /// and its non-accepted closure must terminate exactly on the current
    /// accepted frontier with every tx dependency inside the closure.
    fn verify(&self) -> Result<()> {
        let (_, vtx) = self.inner()?;
        vtx.verify()?;

        let is_stop = vtx.stop_vertex();
        if is_stop && self.shared.now() < self.shared.stop_vertex_activation {
            return Err(ConsensusError::StopVertexNotAllowedTimestamp);
        }

        let edge_ids = self.shared.edge.read().list();
        for edge_id in &edge_ids {
            let edge_cell = self.shared.cell(*edge_id)?;
            let edge_vertex = UniqueVertex::new(self.shared.clone(), *edge_id, edge_cell);
            if edge_vertex.stop_vertex() {
                return Err(ConsensusError::StopVertexAlreadyAccepted);
            }
        }
        if !is_stop {
            return Ok(());
        }

        let (transitive, boundary, deps) = self.closure()?;
        let edge: Set<Id> = Set::of(edge_ids);
        if !boundary.equals(&edge) {
            return Err(ConsensusError::UnexpectedEdges);
        }
        if !deps.is_subset(&transitive) {
            return Err(ConsensusError::UnexpectedDependencyStopVtx);
        }
        Ok(())
    }
}
