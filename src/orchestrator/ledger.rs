//! In-process ownership ledger for handoff resources.
//!
//! Maps resource keys (`reservation:<id>`, `checkpoint:<id>`,
//! `message:<id>`, `subscription:<id>`) to the agent holding them. It is
//! the default [`ResourceTransfer`] used by the handoff coordinator.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tracing::debug;

use super::handoff::{ResourceTransfer, TransferError};
use crate::models::handoff::Resource;

/// Resource key to owning agent.
#[derive(Debug, Default)]
pub struct ResourceLedger {
    owners: Mutex<HashMap<String, String>>,
}

impl ResourceLedger {
    /// Empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Give `key` to `agent_id` if unowned or already theirs.
    ///
    /// Returns `false` when another agent holds it.
    pub fn claim(&self, key: &str, agent_id: &str) -> bool {
        let mut owners = self.lock();
        match owners.get(key) {
            Some(owner) if owner != agent_id => false,
            _ => {
                owners.insert(key.to_owned(), agent_id.to_owned());
                true
            }
        }
    }

    /// Current owner of `key`.
    #[must_use]
    pub fn owner(&self, key: &str) -> Option<String> {
        self.lock().get(key).cloned()
    }

    /// Drop `key` if held by `agent_id`. Returns whether it was released.
    pub fn release(&self, key: &str, agent_id: &str) -> bool {
        let mut owners = self.lock();
        if owners.get(key).is_some_and(|owner| owner == agent_id) {
            owners.remove(key);
            true
        } else {
            false
        }
    }

    /// Keys held by `agent_id`, sorted.
    #[must_use]
    pub fn held_by(&self, agent_id: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .lock()
            .iter()
            .filter(|(_, owner)| owner.as_str() == agent_id)
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Move `resource` from `from` to `to`.
    ///
    /// # Errors
    ///
    /// Fails recoverably for an expired reservation and non-recoverably
    /// when a third agent holds the resource.
    pub fn move_resource(
        &self,
        resource: &Resource,
        from: &str,
        to: &str,
    ) -> Result<(), TransferError> {
        let key = resource.key();
        if let Resource::FileReservation(reservation) = resource {
            if reservation.expires_at.is_some_and(|at| at <= Utc::now()) {
                return Err(TransferError::recoverable(format!("{key} has expired")));
            }
        }

        let mut owners = self.lock();
        match owners.get(&key) {
            Some(owner) if owner != from && owner != to => {
                return Err(TransferError::fatal(format!("{key} is held by {owner}")));
            }
            _ => {
                owners.insert(key.clone(), to.to_owned());
            }
        }
        debug!(key, from, to, "resource moved");
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.owners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ResourceTransfer for ResourceLedger {
    fn transfer(
        &self,
        resource: &Resource,
        from: &str,
        to: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransferError>> + Send + '_>> {
        let result = self.move_resource(resource, from, to);
        Box::pin(async move { result })
    }
}
