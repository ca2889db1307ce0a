//! Routes: a live binding of a `(database, user)` classification to a
//! rule, owning one client pool and one server pool behind a per-route
//! lock.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{Mutex, Semaphore};

use pgrelay_core::ClientId;

use crate::pool::{ClientPool, ClientState, ServerPool, ServerState};
use crate::rules::Rule;

/// Identity of a route. Two ids compare equal iff both byte strings
/// match exactly. When the matched rule carries storage overrides, the
/// id holds the overridden values, so several client tuples share one
/// backend pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteId {
    pub database: Bytes,
    pub user: Bytes,
}

impl RouteId {
    pub fn new(database: impl Into<Bytes>, user: impl Into<Bytes>) -> Self {
        Self {
            database: database.into(),
            user: user.into(),
        }
    }
}

impl fmt::Display for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}",
            String::from_utf8_lossy(&self.database),
            String::from_utf8_lossy(&self.user)
        )
    }
}

/// Cumulative per-route counters folded into [`RouteStats`].
#[derive(Debug, Default)]
pub(crate) struct RouteCounters {
    pub attach_total: u64,
    pub wait_total: u64,
}

/// Snapshot of a route's pools and counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteStats {
    pub clients_pending: usize,
    pub clients_active: usize,
    pub clients_queued: usize,
    pub servers_idle: usize,
    pub servers_active: usize,
    /// Attaches performed since the route was created.
    pub attach_total: u64,
    /// Attaches that had to queue for a pool slot.
    pub wait_total: u64,
}

/// State behind the route lock.
#[derive(Debug, Default)]
pub(crate) struct RouteInner {
    pub clients: ClientPool,
    pub servers: ServerPool,
    pub counters: RouteCounters,
}

/// A route binds an id to a rule and owns the pools multiplexing its
/// clients over its servers.
#[derive(Debug)]
pub struct Route {
    id: RouteId,
    rule: Arc<Rule>,
    dynamic: bool,
    /// Pool slots when `pool_size > 0`; a permit is held per active
    /// server and waiting acquirers form the per-route FIFO.
    slots: Option<Arc<Semaphore>>,
    pub(crate) inner: Mutex<RouteInner>,
}

impl Route {
    pub(crate) fn new(id: RouteId, rule: Arc<Rule>, dynamic: bool) -> Arc<Self> {
        let slots = (rule.pool_size > 0)
            .then(|| Arc::new(Semaphore::new(rule.pool_size as usize)));
        Arc::new(Self {
            id,
            rule,
            dynamic,
            slots,
            inner: Mutex::new(RouteInner::default()),
        })
    }

    pub fn id(&self) -> &RouteId {
        &self.id
    }

    pub fn rule(&self) -> &Arc<Rule> {
        &self.rule
    }

    /// Created on demand by `route`; eligible for gc when empty.
    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    pub(crate) fn slots(&self) -> Option<&Arc<Semaphore>> {
        self.slots.as_ref()
    }

    /// Signal the named client to close, if it is held here.
    pub async fn kill_client(&self, id: ClientId) -> bool {
        let inner = self.inner.lock().await;
        match inner.clients.get(id) {
            Some(client) => {
                client.kill();
                true
            }
            None => false,
        }
    }

    /// Signal every client held here to close.
    pub async fn kill_client_pool(&self) {
        let inner = self.inner.lock().await;
        for client in inner.clients.iter() {
            client.kill();
        }
    }

    pub async fn stats(&self) -> RouteStats {
        let inner = self.inner.lock().await;
        RouteStats {
            clients_pending: inner.clients.count(ClientState::Pending),
            clients_active: inner.clients.count(ClientState::Active),
            clients_queued: inner.clients.count(ClientState::Queued),
            servers_idle: inner.servers.count(ServerState::Idle),
            servers_active: inner.servers.count(ServerState::Active),
            attach_total: inner.counters.attach_total,
            wait_total: inner.counters.wait_total,
        }
    }
}

/// The set of live routes. Lookup is linear; route counts are small and
/// every access already holds the router lock.
#[derive(Debug, Default)]
pub struct RoutePool {
    routes: Vec<Arc<Route>>,
}

impl RoutePool {
    /// The route whose id and rule identity both match, if any.
    pub fn matched(&self, id: &RouteId, rule: &Arc<Rule>) -> Option<Arc<Route>> {
        self.routes
            .iter()
            .find(|route| route.id() == id && Arc::ptr_eq(route.rule(), rule))
            .cloned()
    }

    /// Insert a new dynamic route.
    pub fn create(&mut self, id: RouteId, rule: Arc<Rule>) -> Arc<Route> {
        let route = Route::new(id, rule, true);
        self.routes.push(Arc::clone(&route));
        route
    }

    /// Unlink the route. Returns false if it was not present.
    pub fn unlink(&mut self, route: &Arc<Route>) -> bool {
        let before = self.routes.len();
        self.routes.retain(|r| !Arc::ptr_eq(r, route));
        self.routes.len() < before
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Route>> {
        self.routes.iter()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
