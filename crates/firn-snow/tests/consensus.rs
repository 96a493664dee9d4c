//! End-to-end consensus scenarios over a real store.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use firn_db::{MemDb, VersionDb};
use firn_ids::{Id, NodeId};
use firn_snow::events::{EventDispatcher, EventHandler};
use firn_snow::message::{Message, Op};
use firn_snow::sender::{ExternalSender, NoThrottler, OutboundMessage};
use firn_snow::state::DEFAULT_CACHE_SIZE;
use firn_snow::vm::DagVm;
use firn_snow::{
    ConsensusError, Decidable, Engine, EngineConfig, Parameters, Result, Status, Tx,
    UniqueVertex, ValidatorSet, Vertex, VertexManager,
};
use firn_utils::Set;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn id(n: u64) -> Id {
    Id::EMPTY.prefixed(n)
}

fn node(n: u8) -> NodeId {
    NodeId::from_bytes([n; 20])
}

// ---- collaborators ----

struct SimpleTx {
    id: Id,
    bytes: Vec<u8>,
    inputs: Vec<Id>,
    deps: Vec<Id>,
    status: RwLock<Status>,
}

impl Decidable for SimpleTx {
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

impl Tx for SimpleTx {
    fn bytes(&self) -> Vec<u8> {
        self.bytes.clone()
    }

    fn verify(&self) -> Result<()> {
        Ok(())
    }

    fn dependencies(&self) -> Vec<Id> {
        self.deps.clone()
    }

    fn input_ids(&self) -> Vec<Id> {
        self.inputs.clone()
    }
}

/// Parses tx bytes into canonical instances; conflict keys and
/// dependencies are scripted per byte string.
#[derive(Default)]
struct ScriptedVm {
    inputs: Mutex<HashMap<Vec<u8>, Vec<Id>>>,
    deps: Mutex<HashMap<Vec<u8>, Vec<Id>>>,
    cache: Mutex<HashMap<Id, Arc<dyn Tx>>>,
}

impl ScriptedVm {
    fn script_input(&self, bytes: &[u8], input: Id) {
        self.inputs.lock().insert(bytes.to_vec(), vec![input]);
    }

    fn script_dep(&self, bytes: &[u8], dep: Id) {
        self.deps.lock().insert(bytes.to_vec(), vec![dep]);
    }
}

impl DagVm for ScriptedVm {
    fn parse_tx(&self, bytes: &[u8]) -> Result<Arc<dyn Tx>> {
        let tx_id = Id::of(bytes);
        let mut cache = self.cache.lock();
        if let Some(tx) = cache.get(&tx_id) {
            return Ok(tx.clone());
        }
        let inputs = self
            .inputs
            .lock()
            .get(bytes)
            .cloned()
            .unwrap_or_else(|| vec![tx_id.prefixed(1)]);
        let deps = self.deps.lock().get(bytes).cloned().unwrap_or_default();
        let tx: Arc<dyn Tx> = Arc::new(SimpleTx {
            id: tx_id,
            bytes: bytes.to_vec(),
            inputs,
            deps,
            status: RwLock::new(Status::Processing),
        });
        cache.insert(tx_id, tx.clone());
        Ok(tx)
    }

    fn get_tx(&self, id: Id) -> Result<Option<Arc<dyn Tx>>> {
        Ok(self.cache.lock().get(&id).cloned())
    }

    fn pending_txs(&self) -> Vec<Arc<dyn Tx>> {
        Vec::new()
    }

    fn connected(&self, _node: NodeId, _version: &firn_snow::version::Version) -> Result<()> {
        Ok(())
    }

    fn disconnected(&self, _node: NodeId) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct RecordingSender {
    sent: Mutex<Vec<Message>>,
}

impl RecordingSender {
    fn request_ids(&self, op: Op) -> Vec<u32> {
        self.sent
            .lock()
            .iter()
            .filter(|m| m.op() == op)
            .map(|m| match m {
                Message::PushQuery { request_id, .. } | Message::PullQuery { request_id, .. } => {
                    *request_id
                }
                _ => u32::MAX,
            })
            .collect()
    }
}

impl ExternalSender for RecordingSender {
    fn send(
        &self,
        message: OutboundMessage,
        node_ids: &Set<NodeId>,
        _validators_only: bool,
    ) -> Set<NodeId> {
        self.sent.lock().push(message.message);
        Set::of(node_ids.list())
    }

    fn gossip(
        &self,
        _message: OutboundMessage,
        _validators_only: bool,
        _num_validators: usize,
        _num_non_validators: usize,
    ) -> Set<NodeId> {
        Set::new()
    }
}

#[derive(Default)]
struct EventLog {
    accepted: Mutex<Vec<Id>>,
    rejected: Mutex<Vec<Id>>,
}

impl EventHandler for EventLog {
    fn accept(&self, _chain: Id, container: Id, _bytes: &[u8]) -> Result<()> {
        self.accepted.lock().push(container);
        Ok(())
    }

    fn reject(&self, _chain: Id, container: Id, _bytes: &[u8]) -> Result<()> {
        self.rejected.lock().push(container);
        Ok(())
    }
}

struct Network {
    engine: Engine,
    sender: Arc<RecordingSender>,
    vm: Arc<ScriptedVm>,
    events: Arc<EventLog>,
    genesis: Id,
    validators: Vec<NodeId>,
    k: usize,
}

impl Network {
    /// All validators answer the most recent open query with `votes`.
    ///
    /// Sampling is with replacement, so a voter may own several slots of
    /// the poll; every voter answers up to k times and the registry drops
    /// whatever exceeds its sampled multiplicity.
    fn answer_latest(&mut self, votes: &[Id]) {
        let request_id = *self
            .sender
            .request_ids(Op::PushQuery)
            .last()
            .expect("no query outstanding");
        for validator in self.validators.clone() {
            for _ in 0..self.k {
                self.engine
                    .chits(validator, request_id, votes.to_vec())
                    .unwrap();
            }
        }
    }

    fn build(&self, parents: Vec<Id>, txs: Vec<Vec<u8>>) -> UniqueVertex {
        self.engine.manager().build_vertex(parents, txs, false).unwrap()
    }
}

fn network(params: Parameters, validator_count: u8) -> Network {
    network_over(params, validator_count, Arc::new(VersionDb::new(Arc::new(MemDb::new()))))
}

fn network_over(params: Parameters, validator_count: u8, db: Arc<VersionDb>) -> Network {
    let _ = firn_utils::logging::try_init(&firn_utils::logging::LogConfig::default());
    let chain_id = id(1000);
    let vm = Arc::new(ScriptedVm::default());
    let sender = Arc::new(RecordingSender::default());
    let events = Arc::new(EventLog::default());

    let manager = VertexManager::new(
        db,
        vm.clone(),
        chain_id,
        params.stop_vertex_activation,
        DEFAULT_CACHE_SIZE,
    )
    .unwrap();
    let genesis = match manager.frontier_with_heights().unwrap().first() {
        Some((id, _)) => *id,
        None => manager
            .initialize_genesis(vec![b"genesis".to_vec()])
            .unwrap()
            .id(),
    };

    let validator_set = Arc::new(ValidatorSet::new());
    let mut validators = Vec::new();
    for n in 1..=validator_count {
        validator_set.add_weight(node(n), 100).unwrap();
        validators.push(node(n));
    }

    let dispatcher = Arc::new(EventDispatcher::new());
    dispatcher
        .register(chain_id, "log", events.clone(), false)
        .unwrap();

    let k = params.k;
    let mut engine = Engine::new(EngineConfig {
        chain_id,
        params,
        validators: validator_set,
        manager,
        sender: sender.clone(),
        throttler: Arc::new(NoThrottler),
        dispatcher,
        vm: vm.clone(),
        rng: Box::new(StdRng::seed_from_u64(99)),
    })
    .unwrap();
    engine.start().unwrap();

    Network {
        engine,
        sender,
        vm,
        events,
        genesis,
        validators,
        k,
    }
}

fn params(k: usize, alpha: usize, beta_virtuous: usize, beta_rogue: usize) -> Parameters {
    let mut p = Parameters::new(k, alpha, beta_virtuous, beta_rogue);
    p.concurrent_repolls = 1;
    p
}

// ---- scenarios ----

#[test]
fn single_virtuous_vertex_with_one_voter() {
    let mut net = network(params(1, 1, 1, 1), 1);

    let vtx = net.build(vec![net.genesis], vec![b"transfer".to_vec()]);
    let vtx_id = vtx.id();
    assert!(net.engine.issue(vtx).unwrap());

    net.answer_latest(&[vtx_id]);

    assert_eq!(net.engine.frontier(), vec![vtx_id]);
    assert_eq!(
        net.engine.manager().status(&vtx_id).unwrap(),
        Status::Accepted
    );
    assert_eq!(*net.events.accepted.lock(), vec![vtx_id]);
}

#[test]
fn conflicting_txs_resolve_exclusively() {
    let mut net = network(params(2, 2, 1, 2), 2);
    let shared_input = id(7);
    net.vm.script_input(b"t1", shared_input);
    net.vm.script_input(b"t2", shared_input);

    let v1 = net.build(vec![net.genesis], vec![b"t1".to_vec()]);
    let v2 = net.build(vec![net.genesis], vec![b"t2".to_vec()]);
    let (v1_id, v2_id) = (v1.id(), v2.id());
    net.engine.issue(v1).unwrap();
    net.engine.issue(v2).unwrap();

    // two successive unanimous polls for the first spender
    net.answer_latest(&[v1_id]);
    assert_eq!(net.engine.num_processing(), 2);
    net.answer_latest(&[v1_id]);

    assert_eq!(
        net.engine.manager().status(&v1_id).unwrap(),
        Status::Accepted
    );
    assert_eq!(
        net.engine.manager().status(&v2_id).unwrap(),
        Status::Rejected
    );
    assert_eq!(
        net.engine.manager().tx_status(&Id::of(b"t1")).unwrap(),
        Status::Accepted
    );
    assert_eq!(
        net.engine.manager().tx_status(&Id::of(b"t2")).unwrap(),
        Status::Rejected
    );
    assert_eq!(net.engine.frontier(), vec![v1_id]);
}

#[test]
fn votes_for_a_child_carry_its_ancestors() {
    let mut net = network(params(2, 2, 2, 2), 2);

    let a = net.build(vec![net.genesis], vec![b"ta".to_vec()]);
    let b = net.build(vec![net.genesis], vec![b"tb".to_vec()]);
    let c = net.build(vec![a.id(), b.id()], vec![b"tc".to_vec()]);
    let (a_id, b_id, c_id) = (a.id(), b.id(), c.id());
    net.engine.issue(a).unwrap();
    net.engine.issue(b).unwrap();
    net.engine.issue(c).unwrap();

    // every sampled validator names only the child
    net.answer_latest(&[c_id]);
    assert_eq!(net.engine.num_processing(), 3);
    net.answer_latest(&[c_id]);

    assert_eq!(net.engine.num_processing(), 0);
    let order = net.events.accepted.lock().clone();
    let pos = |needle: Id| order.iter().position(|v| *v == needle).unwrap();
    assert!(pos(a_id) < pos(c_id));
    assert!(pos(b_id) < pos(c_id));
    assert_eq!(net.engine.frontier(), vec![c_id]);
}

#[test]
fn stop_vertex_before_activation_is_refused() {
    let activation = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
    let mut p = params(1, 1, 1, 1);
    p.stop_vertex_activation = activation;
    let mut net = network(p, 1);

    net.engine
        .manager()
        .override_clock(move || activation - ChronoDuration::hours(1));

    let stop = net
        .engine
        .manager()
        .build_vertex(vec![net.genesis], vec![], true)
        .unwrap();
    let err = net.engine.issue(stop).unwrap_err();
    assert!(matches!(err, ConsensusError::StopVertexNotAllowedTimestamp));
    assert_eq!(net.engine.num_processing(), 0);
    assert!(net.events.accepted.lock().is_empty());
}

#[test]
fn stop_vertex_must_cover_the_whole_frontier() {
    let mut net = network(params(1, 1, 1, 1), 1);

    // two accepted frontier vertices
    let f1 = net.build(vec![net.genesis], vec![b"t1".to_vec()]);
    let f2 = net.build(vec![net.genesis], vec![b"t2".to_vec()]);
    let (f1_id, f2_id) = (f1.id(), f2.id());
    net.engine.issue(f1).unwrap();
    net.answer_latest(&[f1_id]);
    net.engine.issue(f2).unwrap();
    net.answer_latest(&[f2_id]);
    let mut frontier = net.engine.frontier();
    frontier.sort_unstable();
    let mut expected = vec![f1_id, f2_id];
    expected.sort_unstable();
    assert_eq!(frontier, expected);

    // a stop vertex reaching only half the frontier is refused
    let partial = net
        .engine
        .manager()
        .build_vertex(vec![f1_id], vec![], true)
        .unwrap();
    assert!(matches!(
        partial.verify(),
        Err(ConsensusError::UnexpectedEdges)
    ));

    // one covering the whole frontier passes
    let full = net
        .engine
        .manager()
        .build_vertex(vec![f1_id, f2_id], vec![], true)
        .unwrap();
    full.verify().unwrap();
}

#[test]
fn stop_vertex_with_external_dependency_is_refused() {
    let mut net = network(params(1, 1, 1, 1), 1);

    // "spend" depends on a tx that is neither accepted nor inside the
    // closure of the stop vertex
    let outside_dep = Id::of(b"unseen-dep");
    net.vm.script_dep(b"spend", outside_dep);

    let a = net.build(vec![net.genesis], vec![b"spend".to_vec()]);
    let a_id = a.id();
    net.engine.issue(a).unwrap();

    let stop = net
        .engine
        .manager()
        .build_vertex(vec![a_id], vec![], true)
        .unwrap();

    // the whitelist covers the processing closure, but not the stray dep
    let whitelist = stop.whitelist().unwrap();
    assert!(whitelist.contains(&stop.id()));
    assert!(whitelist.contains(&a_id));
    assert!(whitelist.contains(&Id::of(b"spend")));
    assert!(!whitelist.contains(&outside_dep));

    assert!(matches!(
        stop.verify(),
        Err(ConsensusError::UnexpectedDependencyStopVtx)
    ));
}

#[test]
fn nothing_may_build_on_an_accepted_stop_vertex() {
    let mut net = network(params(1, 1, 1, 1), 1);

    let stop = net
        .engine
        .manager()
        .build_vertex(vec![net.genesis], vec![], true)
        .unwrap();
    let stop_id = stop.id();
    net.engine.issue(stop).unwrap();
    net.answer_latest(&[stop_id]);
    assert_eq!(net.engine.frontier(), vec![stop_id]);

    let after = net.build(vec![stop_id], vec![b"late".to_vec()]);
    assert!(matches!(
        after.verify(),
        Err(ConsensusError::StopVertexAlreadyAccepted)
    ));
}

#[test]
fn recovery_rederives_the_frontier_from_statuses() {
    let base = Arc::new(MemDb::new());
    let vtx_id;
    let genesis_id;
    {
        let db = Arc::new(VersionDb::new(base.clone()));
        let mut net = network_over(params(1, 1, 1, 1), 1, db);
        genesis_id = net.genesis;

        let vtx = net.build(vec![net.genesis], vec![b"t".to_vec()]);
        vtx_id = vtx.id();
        net.engine.issue(vtx).unwrap();
        net.answer_latest(&[vtx_id]);
        assert_eq!(net.engine.frontier(), vec![vtx_id]);

        // model a torn write: the status record survived, the frontier
        // record did not
        let state = firn_snow::state::PrefixedState::new(Arc::new(VersionDb::new(base.clone())));
        state.set_edge(&[genesis_id]).unwrap();
        state.commit().unwrap();
    }

    // a fresh process over the same backing store re-derives the frontier
    let reopened = VertexManager::new(
        Arc::new(VersionDb::new(base)),
        Arc::new(ScriptedVm::default()),
        id(1000),
        Parameters::default().stop_vertex_activation,
        DEFAULT_CACHE_SIZE,
    )
    .unwrap();
    let recovered = reopened.recover_frontier().unwrap();
    assert_eq!(recovered, vec![(vtx_id, 1)]);
    assert_eq!(reopened.edge(), vec![vtx_id]);
}

#[test]
fn repolls_continue_while_undecided() {
    let mut net = network(params(1, 1, 2, 2), 1);

    let vtx = net.build(vec![net.genesis], vec![b"t".to_vec()]);
    let vtx_id = vtx.id();
    net.engine.issue(vtx).unwrap();

    // beta = 2: the first poll must trigger a follow-up query
    net.answer_latest(&[vtx_id]);
    assert_eq!(net.sender.request_ids(Op::PushQuery).len(), 2);
    assert_eq!(net.engine.num_processing(), 1);

    net.answer_latest(&[vtx_id]);
    assert_eq!(net.engine.num_processing(), 0);
    assert_eq!(net.engine.frontier(), vec![vtx_id]);
}
