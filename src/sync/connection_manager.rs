use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use derive_more::Display;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::model::normalise_address;

/// Identity of one supervising task, used for compare-and-remove.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Display)]
#[display("supervisor-{_0}")]
pub struct SupervisorId(u64);

/// A device's supervising task together with its cancellation token.
#[derive(Debug)]
pub struct Supervisor {
    id: SupervisorId,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Supervisor {
    #[must_use]
    pub fn new(id: SupervisorId, cancel: CancellationToken, task: JoinHandle<()>) -> Self {
        Self { id, cancel, task }
    }

    #[must_use]
    pub fn id(&self) -> SupervisorId {
        self.id
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancels the task and waits until its cleanup has run.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(error) = self.task.await
            && error.is_panic()
        {
            warn!(supervisor = %self.id, "device supervisor panicked during shutdown");
        }
    }
}

/// Live sessions keyed by uppercase MAC address.
///
/// Inserting always replaces; removal by a supervisor only succeeds while that
/// supervisor still owns the entry, so a slow cleanup from an old task cannot
/// evict a newer connection for the same camera.
#[derive(Debug)]
pub struct DeviceConnectionManager<S> {
    next_id: AtomicU64,
    connections: Mutex<HashMap<String, (S, Supervisor)>>,
}

impl<S> Default for DeviceConnectionManager<S> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            connections: Mutex::new(HashMap::new()),
        }
    }
}

impl<S> DeviceConnectionManager<S> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn connections(&self) -> MutexGuard<'_, HashMap<String, (S, Supervisor)>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocates an id for a supervisor that is about to be spawned.
    pub fn next_supervisor_id(&self) -> SupervisorId {
        SupervisorId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Stores a connection, returning whatever it displaced.
    ///
    /// The displaced supervisor is not cancelled here; its owner does that.
    pub fn add_connection(
        &self,
        address: &str,
        session: S,
        supervisor: Supervisor,
    ) -> Option<(S, Supervisor)> {
        let address = normalise_address(address);
        debug!(%address, supervisor = %supervisor.id(), "tracking connection");
        let replaced = self
            .connections()
            .insert(address.clone(), (session, supervisor));
        if let Some((_, old)) = &replaced {
            debug!(%address, replaced = %old.id(), "newer connection replaced an existing one");
        }
        replaced
    }

    /// Removes the entry for `address` only if `expected` still owns it.
    pub fn remove_connection_if_matches(
        &self,
        address: &str,
        expected: SupervisorId,
    ) -> Option<(S, Supervisor)> {
        let address = normalise_address(address);
        let mut connections = self.connections();
        match connections.get(&address) {
            Some((_, supervisor)) if supervisor.id() == expected => connections.remove(&address),
            Some((_, supervisor)) => {
                debug!(
                    %address,
                    %expected,
                    current = %supervisor.id(),
                    "stale cleanup left newer connection in place"
                );
                None
            }
            None => None,
        }
    }

    /// Removes the entry for `address` regardless of owner.
    pub fn remove_connection(&self, address: &str) -> Option<(S, Supervisor)> {
        self.connections().remove(&normalise_address(address))
    }

    #[must_use]
    pub fn contains(&self, address: &str) -> bool {
        self.connections()
            .contains_key(&normalise_address(address))
    }

    #[must_use]
    pub fn addresses(&self) -> Vec<String> {
        let mut addresses: Vec<_> = self.connections().keys().cloned().collect();
        addresses.sort();
        addresses
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.connections().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections().is_empty()
    }
}

impl<S: Clone> DeviceConnectionManager<S> {
    #[must_use]
    pub fn get(&self, address: &str) -> Option<S> {
        self.connections()
            .get(&normalise_address(address))
            .map(|(session, _)| session.clone())
    }

    /// Snapshot of every tracked session.
    #[must_use]
    pub fn sessions(&self) -> Vec<(String, S)> {
        self.connections()
            .iter()
            .map(|(address, (session, _))| (address.clone(), session.clone()))
            .collect()
    }
}
