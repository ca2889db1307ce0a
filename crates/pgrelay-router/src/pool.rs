//! Per-route multisets of clients and servers indexed by state.
//!
//! Membership is the state: an entity absent from its pool is in the
//! `undef` state of the source model. Transitions rewrite a state tag
//! and never allocate.

use std::collections::HashMap;
use std::sync::Arc;

use pgrelay_core::{ClientId, ServerId};

use crate::client::Client;
use crate::server::Server;

/// Client pool membership states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Routed but not attached to a server.
    Pending,
    /// Attached to a server.
    Active,
    /// Suspended waiting for a free pool slot.
    Queued,
}

impl ClientState {
    fn index(self) -> usize {
        match self {
            ClientState::Pending => 0,
            ClientState::Active => 1,
            ClientState::Queued => 2,
        }
    }
}

/// Multiset of clients indexed by state.
#[derive(Debug, Default)]
pub struct ClientPool {
    clients: HashMap<ClientId, (ClientState, Arc<Client>)>,
    counts: [usize; 3],
}

impl ClientPool {
    /// Insert the client, or move it to `state` if already present.
    pub fn set(&mut self, client: &Arc<Client>, state: ClientState) {
        match self.clients.get_mut(&client.id()) {
            Some(slot) => {
                self.counts[slot.0.index()] -= 1;
                slot.0 = state;
            }
            None => {
                self.clients
                    .insert(client.id(), (state, Arc::clone(client)));
            }
        }
        self.counts[state.index()] += 1;
    }

    /// Remove the client from the pool (the `undef` transition).
    pub fn remove(&mut self, id: ClientId) -> Option<Arc<Client>> {
        let (state, client) = self.clients.remove(&id)?;
        self.counts[state.index()] -= 1;
        Some(client)
    }

    pub fn get(&self, id: ClientId) -> Option<&Arc<Client>> {
        self.clients.get(&id).map(|(_, client)| client)
    }

    pub fn state(&self, id: ClientId) -> Option<ClientState> {
        self.clients.get(&id).map(|(state, _)| *state)
    }

    pub fn total(&self) -> usize {
        self.clients.len()
    }

    pub fn count(&self, state: ClientState) -> usize {
        self.counts[state.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Client>> {
        self.clients.values().map(|(_, client)| client)
    }

    pub fn iter_state(&self, state: ClientState) -> impl Iterator<Item = &Arc<Client>> {
        self.clients
            .values()
            .filter(move |(s, _)| *s == state)
            .map(|(_, client)| client)
    }
}

/// Server pool membership states. `Connect`, `Reset`, and `Expire` are
/// driven by the backend driver and opaque to the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Idle,
    Active,
    Connect,
    Reset,
    Expire,
}

impl ServerState {
    fn index(self) -> usize {
        match self {
            ServerState::Idle => 0,
            ServerState::Active => 1,
            ServerState::Connect => 2,
            ServerState::Reset => 3,
            ServerState::Expire => 4,
        }
    }
}

/// Multiset of servers indexed by state. Owns the server objects.
#[derive(Debug, Default)]
pub struct ServerPool {
    servers: HashMap<ServerId, (ServerState, Server)>,
    counts: [usize; 5],
}

impl ServerPool {
    pub fn insert(&mut self, server: Server, state: ServerState) {
        self.counts[state.index()] += 1;
        self.servers.insert(server.id, (state, server));
    }

    /// Move a pooled server to `state`. Returns false if absent.
    pub fn set_state(&mut self, id: ServerId, state: ServerState) -> bool {
        match self.servers.get_mut(&id) {
            Some(slot) => {
                self.counts[slot.0.index()] -= 1;
                self.counts[state.index()] += 1;
                slot.0 = state;
                true
            }
            None => false,
        }
    }

    /// Remove the server from the pool (the `undef` transition),
    /// returning ownership to the caller.
    pub fn remove(&mut self, id: ServerId) -> Option<Server> {
        let (state, server) = self.servers.remove(&id)?;
        self.counts[state.index()] -= 1;
        Some(server)
    }

    /// Take any one server currently in `state` out of the pool.
    pub fn take_next(&mut self, state: ServerState) -> Option<Server> {
        let id = self
            .servers
            .iter()
            .find(|(_, (s, _))| *s == state)
            .map(|(id, _)| *id)?;
        self.remove(id)
    }

    pub fn get(&self, id: ServerId) -> Option<&Server> {
        self.servers.get(&id).map(|(_, server)| server)
    }

    pub fn get_mut(&mut self, id: ServerId) -> Option<&mut Server> {
        self.servers.get_mut(&id).map(|(_, server)| server)
    }

    pub fn state(&self, id: ServerId) -> Option<ServerState> {
        self.servers.get(&id).map(|(state, _)| *state)
    }

    /// First server in `state` matching the predicate.
    pub fn find(
        &self,
        state: ServerState,
        mut predicate: impl FnMut(&Server) -> bool,
    ) -> Option<&Server> {
        self.servers
            .values()
            .filter(|(s, _)| *s == state)
            .map(|(_, server)| server)
            .find(|server| predicate(server))
    }

    pub fn iter_state_mut(
        &mut self,
        state: ServerState,
    ) -> impl Iterator<Item = &mut Server> {
        self.servers
            .values_mut()
            .filter(move |(s, _)| *s == state)
            .map(|(_, server)| server)
    }

    /// Remove and return every server in `state`.
    pub fn drain_state(&mut self, state: ServerState) -> Vec<Server> {
        let ids: Vec<ServerId> = self
            .servers
            .iter()
            .filter(|(_, (s, _))| *s == state)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.remove(id))
            .collect()
    }

    pub fn total(&self) -> usize {
        self.servers.len()
    }

    pub fn count(&self, state: ServerState) -> usize {
        self.counts[state.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{CancelKey, Startup};
    use crate::route::RouteId;
    use pgrelay_core::IdAllocator;

    fn test_client(ids: &IdAllocator) -> Arc<Client> {
        Client::new(
            ids.client_id(),
            Startup::new("orders", "app"),
            CancelKey::default(),
        )
    }

    fn test_server(ids: &IdAllocator) -> Server {
        Server::new(ids.server_id(), RouteId::new("orders", "app"), 4096)
    }

    // ── ClientPool ──────────────────────────────────────────────────

    #[test]
    fn client_set_moves_between_states() {
        let ids = IdAllocator::new();
        let mut pool = ClientPool::default();
        let client = test_client(&ids);

        pool.set(&client, ClientState::Pending);
        assert_eq!(pool.count(ClientState::Pending), 1);
        assert_eq!(pool.total(), 1);

        pool.set(&client, ClientState::Active);
        assert_eq!(pool.count(ClientState::Pending), 0);
        assert_eq!(pool.count(ClientState::Active), 1);
        assert_eq!(pool.total(), 1);
        assert_eq!(pool.state(client.id()), Some(ClientState::Active));
    }

    #[test]
    fn client_remove_clears_counts() {
        let ids = IdAllocator::new();
        let mut pool = ClientPool::default();
        let client = test_client(&ids);

        pool.set(&client, ClientState::Queued);
        let removed = pool.remove(client.id()).unwrap();
        assert_eq!(removed.id(), client.id());
        assert_eq!(pool.total(), 0);
        assert_eq!(pool.count(ClientState::Queued), 0);
        assert!(pool.remove(client.id()).is_none());
    }

    #[test]
    fn client_iter_sees_all_states() {
        let ids = IdAllocator::new();
        let mut pool = ClientPool::default();
        let a = test_client(&ids);
        let b = test_client(&ids);

        pool.set(&a, ClientState::Pending);
        pool.set(&b, ClientState::Active);
        assert_eq!(pool.iter().count(), 2);
        assert_eq!(pool.iter_state(ClientState::Pending).count(), 1);
        assert_eq!(pool.iter_state(ClientState::Queued).count(), 0);
    }

    // ── ServerPool ──────────────────────────────────────────────────

    #[test]
    fn server_state_transitions_update_counts() {
        let ids = IdAllocator::new();
        let mut pool = ServerPool::default();
        let server = test_server(&ids);
        let id = server.id;

        pool.insert(server, ServerState::Idle);
        assert_eq!(pool.count(ServerState::Idle), 1);

        assert!(pool.set_state(id, ServerState::Active));
        assert_eq!(pool.count(ServerState::Idle), 0);
        assert_eq!(pool.count(ServerState::Active), 1);
        assert_eq!(pool.state(id), Some(ServerState::Active));
    }

    #[test]
    fn server_take_next_only_matches_state() {
        let ids = IdAllocator::new();
        let mut pool = ServerPool::default();
        let idle = test_server(&ids);
        let active = test_server(&ids);
        let idle_id = idle.id;

        pool.insert(idle, ServerState::Idle);
        pool.insert(active, ServerState::Active);

        let taken = pool.take_next(ServerState::Idle).unwrap();
        assert_eq!(taken.id, idle_id);
        assert_eq!(pool.total(), 1);
        assert!(pool.take_next(ServerState::Idle).is_none());
    }

    #[test]
    fn server_find_applies_predicate() {
        let ids = IdAllocator::new();
        let mut pool = ServerPool::default();
        let mut a = test_server(&ids);
        a.key_client = CancelKey::new(1, 10);
        let mut b = test_server(&ids);
        b.key_client = CancelKey::new(2, 20);
        let b_id = b.id;

        pool.insert(a, ServerState::Active);
        pool.insert(b, ServerState::Active);

        let found = pool
            .find(ServerState::Active, |s| s.key_client == CancelKey::new(2, 20))
            .unwrap();
        assert_eq!(found.id, b_id);
        assert!(pool
            .find(ServerState::Idle, |s| s.key_client == CancelKey::new(2, 20))
            .is_none());
    }

    #[test]
    fn server_drain_state_empties_one_state() {
        let ids = IdAllocator::new();
        let mut pool = ServerPool::default();
        pool.insert(test_server(&ids), ServerState::Idle);
        pool.insert(test_server(&ids), ServerState::Idle);
        pool.insert(test_server(&ids), ServerState::Active);

        let drained = pool.drain_state(ServerState::Idle);
        assert_eq!(drained.len(), 2);
        assert_eq!(pool.total(), 1);
        assert_eq!(pool.count(ServerState::Idle), 0);
        assert_eq!(pool.count(ServerState::Active), 1);
    }

    #[test]
    fn server_remove_is_undef_transition() {
        let ids = IdAllocator::new();
        let mut pool = ServerPool::default();
        let server = test_server(&ids);
        let id = server.id;

        pool.insert(server, ServerState::Active);
        let out = pool.remove(id).unwrap();
        assert_eq!(out.id, id);
        assert_eq!(pool.total(), 0);
        assert!(!pool.set_state(id, ServerState::Idle));
    }
}
