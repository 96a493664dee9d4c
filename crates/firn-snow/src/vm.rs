//! The virtual machine, as the consensus core consumes it.
//!
//! Application semantics stay entirely behind this boundary: consensus
//! observes only transaction ids, conflict keys, dependencies and
//! verification verdicts.

use std::sync::Arc;

use firn_ids::{Id, NodeId};

use crate::consensus::snowstorm::Tx;
use crate::version::Version;
use crate::Result;

/// Health probe result.
#[derive(Debug, Clone)]
pub struct Health {
    pub healthy: bool,
    pub detail: Option<String>,
}

impl Health {
    #[must_use]
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            detail: None,
        }
    }

    #[must_use]
    pub fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            healthy: false,
            detail: Some(detail.into()),
        }
    }
}

/// A DAG-hosted virtual machine.
pub trait DagVm: Send + Sync {
    /// Decodes transaction bytes. The returned tx may still fail `verify`.
    fn parse_tx(&self, bytes: &[u8]) -> Result<Arc<dyn Tx>>;

    /// Looks up a transaction the VM has seen before.
    fn get_tx(&self, id: Id) -> Result<Option<Arc<dyn Tx>>>;

    /// Transactions waiting to be packaged into a vertex.
    fn pending_txs(&self) -> Vec<Arc<dyn Tx>>;

    /// A peer at `version` connected.
    fn connected(&self, node_id: NodeId, version: &Version) -> Result<()>;

    /// A peer disconnected.
    fn disconnected(&self, node_id: NodeId) -> Result<()>;

    /// Application-level request from a peer. Ignored by default.
    fn app_request(&self, node_id: NodeId, request_id: u32, payload: &[u8]) -> Result<()> {
        let _ = (node_id, request_id, payload);
        Ok(())
    }

    /// Application-level response from a peer. Ignored by default.
    fn app_response(&self, node_id: NodeId, request_id: u32, payload: &[u8]) -> Result<()> {
        let _ = (node_id, request_id, payload);
        Ok(())
    }

    /// A peer gave up on an application-level request. Ignored by default.
    fn app_request_failed(&self, node_id: NodeId, request_id: u32) -> Result<()> {
        let _ = (node_id, request_id);
        Ok(())
    }

    /// Application-level gossip from a peer. Ignored by default.
    fn app_gossip(&self, node_id: NodeId, payload: &[u8]) -> Result<()> {
        let _ = (node_id, payload);
        Ok(())
    }

    fn health_check(&self) -> Health {
        Health::healthy()
    }
}
