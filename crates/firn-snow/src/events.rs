//! Per-chain event fan-out.

use std::collections::HashMap;
use std::sync::Arc;

use firn_ids::Id;
use parking_lot::Mutex;
use tracing::error;

use crate::{ConsensusError, Result};

/// A consensus observer. Implement whichever hooks matter; the defaults
/// ignore the event.
pub trait EventHandler: Send + Sync {
    /// A container was committed. An error from a die-on-error handler
    /// halts the chain.
    fn accept(&self, chain_id: Id, container_id: Id, container: &[u8]) -> Result<()> {
        let _ = (chain_id, container_id, container);
        Ok(())
    }

    /// A container was discarded.
    fn reject(&self, chain_id: Id, container_id: Id, container: &[u8]) -> Result<()> {
        let _ = (chain_id, container_id, container);
        Ok(())
    }

    /// A container entered consensus.
    fn issue(&self, chain_id: Id, container_id: Id, container: &[u8]) -> Result<()> {
        let _ = (chain_id, container_id, container);
        Ok(())
    }
}

struct Registration {
    name: String,
    handler: Arc<dyn EventHandler>,
    die_on_error: bool,
}

/// Routes issue/accept/reject notifications to the handlers registered
/// for each chain, in registration order.
#[derive(Default)]
pub struct EventDispatcher {
    chains: Mutex<HashMap<Id, Vec<Registration>>>,
}

impl EventDispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `name` for `chain_id`. With
    /// `die_on_error`, a failing accept halts the chain.
    pub fn register(
        &self,
        chain_id: Id,
        name: &str,
        handler: Arc<dyn EventHandler>,
        die_on_error: bool,
    ) -> Result<()> {
        let mut chains = self.chains.lock();
        let handlers = chains.entry(chain_id).or_default();
        if handlers.iter().any(|r| r.name == name) {
            return Err(ConsensusError::Internal(format!(
                "handler {name} already registered on chain {chain_id}"
            )));
        }
        handlers.push(Registration {
            name: name.to_string(),
            handler,
            die_on_error,
        });
        Ok(())
    }

    /// Removes the handler registered under `name`.
    pub fn deregister(&self, chain_id: Id, name: &str) -> Result<()> {
        let mut chains = self.chains.lock();
        let handlers = chains
            .get_mut(&chain_id)
            .ok_or_else(|| ConsensusError::Internal(format!("chain {chain_id} has no handlers")))?;
        let before = handlers.len();
        handlers.retain(|r| r.name != name);
        if handlers.len() == before {
            return Err(ConsensusError::Internal(format!(
                "handler {name} is not registered on chain {chain_id}"
            )));
        }
        if handlers.is_empty() {
            chains.remove(&chain_id);
        }
        Ok(())
    }

    /// Notifies every handler of a commit. A die-on-error handler failure
    /// is returned to the caller so the chain can halt before further
    /// commits; other failures are logged and swallowed.
    pub fn accept(&self, chain_id: Id, container_id: Id, container: &[u8]) -> Result<()> {
        let chains = self.chains.lock();
        let Some(handlers) = chains.get(&chain_id) else {
            return Ok(());
        };
        for registration in handlers {
            if let Err(err) = registration
                .handler
                .accept(chain_id, container_id, container)
            {
                error!(
                    handler = registration.name,
                    chain = %chain_id,
                    container = %container_id,
                    %err,
                    "accept handler failed"
                );
                if registration.die_on_error {
                    return Err(ConsensusError::HandlerFailure {
                        name: registration.name.clone(),
                        container: container_id,
                        source: Box::new(err),
                    });
                }
            }
        }
        Ok(())
    }

    /// Notifies every handler of a rejection. Failures are logged only.
    pub fn reject(&self, chain_id: Id, container_id: Id, container: &[u8]) {
        let chains = self.chains.lock();
        let Some(handlers) = chains.get(&chain_id) else {
            return;
        };
        for registration in handlers {
            if let Err(err) = registration
                .handler
                .reject(chain_id, container_id, container)
            {
                error!(
                    handler = registration.name,
                    chain = %chain_id,
                    container = %container_id,
                    %err,
                    "reject handler failed"
                );
            }
        }
    }

    /// Notifies every handler of an issuance. Failures are logged only.
    pub fn issue(&self, chain_id: Id, container_id: Id, container: &[u8]) {
        let chains = self.chains.lock();
        let Some(handlers) = chains.get(&chain_id) else {
            return;
        };
        for registration in handlers {
            if let Err(err) = registration
                .handler
                .issue(chain_id, container_id, container)
            {
                error!(
                    handler = registration.name,
                    chain = %chain_id,
                    container = %container_id,
                    %err,
                    "issue handler failed"
                );
            }
        }
    }
}
