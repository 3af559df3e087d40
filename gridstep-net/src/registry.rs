//! Registry of registered client sessions.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use gridstep_core::{ClientId, ClientKind};

use crate::session::Session;

/// One registry entry, cloned out for callers.
#[derive(Clone)]
pub struct Entry {
    pub name: String,
    pub kind: ClientKind,
    pub session: Arc<Session>,
}

/// Concurrent map from client id to session, with atomic id allocation and
/// per-kind population counters.
///
/// One lock guards the id counter, the map and both counters, so the
/// counters can never drift from the membership they describe and two
/// interleaved registrations can never observe the same id. Iteration
/// order is ascending id.
#[derive(Default)]
pub struct Registry {
    state: Mutex<RegistryState>,
}

#[derive(Default)]
struct RegistryState {
    last_id: ClientId,
    entries: BTreeMap<ClientId, Entry>,
    sync_count: u16,
    async_count: u16,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues the next client id. Ids start at 1, strictly increase and are
    /// never reused within a run.
    pub fn allocate_id(&self) -> ClientId {
        let mut state = self.state.lock().unwrap();
        state.last_id += 1;
        state.last_id
    }

    /// Adds a registered session under a previously allocated id and bumps
    /// the counter of its kind.
    pub fn register(&self, id: ClientId, name: &str, kind: ClientKind, session: Arc<Session>) {
        let mut state = self.state.lock().unwrap();
        match kind {
            ClientKind::Synchronous => state.sync_count += 1,
            ClientKind::Asynchronous => state.async_count += 1,
        }
        state.entries.insert(
            id,
            Entry {
                name: name.to_string(),
                kind,
                session,
            },
        );
        info!("registered {} client {} as id {}", kind, name, id);
    }

    /// Removes a session and decrements its kind counter. A no-op for an
    /// absent id, so duplicate unregisters are harmless.
    pub fn unregister(&self, id: ClientId) -> Option<Entry> {
        let mut state = self.state.lock().unwrap();
        let entry = state.entries.remove(&id)?;
        match entry.kind {
            ClientKind::Synchronous => state.sync_count -= 1,
            ClientKind::Asynchronous => state.async_count -= 1,
        }
        info!("unregistered client {} (id {})", entry.name, id);
        Some(entry)
    }

    pub fn get(&self, id: ClientId) -> Option<Entry> {
        self.state.lock().unwrap().entries.get(&id).cloned()
    }

    /// All synchronous sessions in ascending-id order, taken under a single
    /// lock acquisition.
    pub fn snapshot_synchronous(&self) -> Vec<(ClientId, Entry)> {
        let state = self.state.lock().unwrap();
        state
            .entries
            .iter()
            .filter(|(_, entry)| entry.kind == ClientKind::Synchronous)
            .map(|(id, entry)| (*id, entry.clone()))
            .collect()
    }

    /// (synchronous, asynchronous) population.
    pub fn counts(&self) -> (u16, u16) {
        let state = self.state.lock().unwrap();
        (state.sync_count, state.async_count)
    }

    /// Total registered population, for registration responses.
    pub fn len(&self) -> u16 {
        let state = self.state.lock().unwrap();
        state.sync_count + state.async_count
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().unwrap().entries.is_empty()
    }
}
