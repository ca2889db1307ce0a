//! The router: classifies incoming clients onto routes and multiplexes
//! them over bounded pools of reusable backend servers.
//!
//! # Locking
//!
//! Two lock levels, acquired strictly top-down:
//!
//! ```text
//! router lock   — rule table, route pool membership, global client count
//!   route lock  — that route's client pool, server pool, cross-links
//! ```
//!
//! A task holds at most one route lock and never acquires the router
//! lock while holding one. `route` publishes a new route atomically by
//! taking the route lock before the router lock drops. Suspension (the
//! pool-slot wait) and backend I/O happen outside both locks.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::{debug, info};

use pgrelay_core::{ClientId, IdAllocator, PoolerConfig, RuleConfig, ServerId};

use crate::client::{CancelKey, Client};
use crate::error::{RouterError, RouterResult};
use crate::io::IoScheduler;
use crate::pool::{ClientState, ServerState};
use crate::route::{Route, RouteId, RoutePool, RouteStats};
use crate::rules::{RuleTable, Storage};
use crate::server::Server;

/// Routing metadata for an out-of-band cancel, copied out so the
/// backend driver can open an independent cancel connection even after
/// the rule has been reconfigured away.
#[derive(Debug, Clone)]
pub struct CancelRequest {
    pub server_id: ServerId,
    /// Backend-assigned key of the target session.
    pub key: CancelKey,
    pub storage: Storage,
}

#[derive(Debug)]
struct RouterInner {
    rules: RuleTable,
    routes: RoutePool,
    /// Clients currently held between `route` and `unroute`.
    clients: usize,
}

/// Top-level façade over the rule table, the route pool, and the global
/// client counter.
pub struct Router {
    inner: Mutex<RouterInner>,
    config: PoolerConfig,
    ids: IdAllocator,
    io: Arc<dyn IoScheduler>,
}

impl Router {
    /// Build a router from configuration; the config's rule list becomes
    /// the installed rule table.
    pub fn new(config: PoolerConfig, io: Arc<dyn IoScheduler>) -> Self {
        let rules = RuleTable::from_config(&config.rules);
        Self {
            inner: Mutex::new(RouterInner {
                rules,
                routes: RoutePool::default(),
                clients: 0,
            }),
            config,
            ids: IdAllocator::new(),
            io,
        }
    }

    pub fn config(&self) -> &PoolerConfig {
        &self.config
    }

    /// Classify and admit a client.
    ///
    /// Matches the startup `(database, user)` against the rule table,
    /// enforces the global and per-route admission caps, and places the
    /// client pending on a matched or freshly created dynamic route.
    pub async fn route(&self, client: &Arc<Client>) -> RouterResult<()> {
        let startup = client.startup();
        let mut inner = self.inner.lock().await;

        let rule = inner
            .rules
            .forward(&startup.database, &startup.user)
            .ok_or_else(|| RouterError::RuleNotFound {
                database: String::from_utf8_lossy(&startup.database).into_owned(),
                user: String::from_utf8_lossy(&startup.user).into_owned(),
            })?;

        // Settings forced by the rule: overridden tuples share one route.
        let mut id = RouteId::new(startup.database.clone(), startup.user.clone());
        if let Some(db) = &rule.storage_db {
            id.database = Bytes::from(db.clone());
        }
        if let Some(user) = &rule.storage_user {
            id.user = Bytes::from(user.clone());
        }

        if let Some(limit) = self.config.client_max {
            if inner.clients >= limit as usize {
                return Err(RouterError::ClientLimit { limit });
            }
        }

        let route = match inner.routes.matched(&id, &rule) {
            Some(route) => route,
            None => {
                debug!(route = %id, "created dynamic route");
                inner.routes.create(id, Arc::clone(&rule))
            }
        };
        inner.clients += 1;

        // Ordered hand-off: the route lock is taken before the router
        // lock drops, publishing a new route atomically.
        let mut guard = route.inner.lock().await;
        drop(inner);

        if let Some(limit) = rule.client_max {
            if guard.clients.total() >= limit as usize {
                drop(guard);
                let mut inner = self.inner.lock().await;
                inner.clients -= 1;
                return Err(RouterError::RouteLimit { limit });
            }
        }

        guard.clients.set(client, ClientState::Pending);
        let mut placement = client.placement();
        placement.rule = Some(rule);
        placement.route = Some(Arc::clone(&route));
        drop(placement);
        drop(guard);

        debug!(client = %client.id(), route = %route.id(), "routed");
        Ok(())
    }

    /// Detach a client from its route. The client must not be attached
    /// to a server.
    pub async fn unroute(&self, client: &Arc<Client>) {
        let route = client.route().expect("unroute of an unrouted client");
        assert!(
            client.server().is_none(),
            "unroute of a client still attached to a server"
        );

        {
            let mut inner = self.inner.lock().await;
            assert!(inner.clients > 0, "routed client counter underflow");
            inner.clients -= 1;
        }

        let mut guard = route.inner.lock().await;
        guard.clients.remove(client.id());
        let mut placement = client.placement();
        placement.route = None;
        placement.rule = None;
        drop(placement);
        drop(guard);

        debug!(client = %client.id(), route = %route.id(), "unrouted");
    }

    /// Bind the client to a server: reuse an idle one, or allocate.
    ///
    /// With `pool_size > 0` a pool slot is acquired first; acquisition
    /// is FIFO, so waiters resume in arrival order, and the wait happens
    /// with no lock held while the client sits in the `Queued` state.
    /// With `pool_size == 0` the policy is never queue, always allocate.
    pub async fn attach(&self, client: &Arc<Client>) -> ServerId {
        let route = client.route().expect("attach of an unrouted client");

        let permit = match route.slots() {
            Some(slots) => match Arc::clone(slots).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    {
                        let mut guard = route.inner.lock().await;
                        guard.clients.set(client, ClientState::Queued);
                        guard.counters.wait_total += 1;
                    }
                    debug!(client = %client.id(), route = %route.id(), "waiting for a pool slot");
                    let permit = Arc::clone(slots)
                        .acquire_owned()
                        .await
                        .expect("route slot semaphore is never closed");
                    Some(permit)
                }
            },
            None => None,
        };

        let idle = {
            let mut guard = route.inner.lock().await;
            guard.servers.take_next(ServerState::Idle)
        };

        let mut server = match idle {
            Some(server) => {
                debug!(client = %client.id(), server = %server.id, "reusing idle server");
                server
            }
            None => {
                let server = Server::new(
                    self.ids.server_id(),
                    route.id().clone(),
                    self.config.packet_read_size,
                );
                debug!(
                    client = %client.id(),
                    server = %server.id,
                    route = %route.id(),
                    "allocated server"
                );
                server
            }
        };

        // Move the socket onto this worker's loop outside the route lock.
        if self.config.is_multi_workers() {
            if let Some(io) = server.io.as_mut() {
                self.io.attach(io.as_mut());
            }
        }

        server.client = Some(client.id());
        server.idle_time = 0;
        server.key_client = client.key();
        server.permit = permit;
        let server_id = server.id;

        let mut guard = route.inner.lock().await;
        guard.servers.insert(server, ServerState::Active);
        guard.clients.set(client, ClientState::Active);
        guard.counters.attach_total += 1;
        client.placement().server = Some(server_id);
        drop(guard);

        server_id
    }

    /// Return the client's server to the idle set and the client to
    /// `Pending`. Frees the pool slot, waking one queued client.
    pub async fn detach(&self, client: &Arc<Client>) {
        let route = client.route().expect("detach of an unrouted client");
        let server_id = client
            .placement()
            .server
            .take()
            .expect("detach without an attached server");

        let mut guard = route.inner.lock().await;
        let mut server = guard
            .servers
            .remove(server_id)
            .expect("attached server missing from its pool");
        assert_eq!(server.client, Some(client.id()), "server cross-link mismatch");
        server.client = None;
        server.last_client_id = Some(client.id());
        let permit = server.permit.take();
        guard.clients.set(client, ClientState::Pending);
        drop(guard);

        // Take the socket off this worker's loop outside the route lock.
        if self.config.is_multi_workers() {
            if let Some(io) = server.io.as_mut() {
                self.io.detach(io.as_mut());
            }
        }

        let mut guard = route.inner.lock().await;
        guard.servers.insert(server, ServerState::Idle);
        drop(guard);

        // The slot frees only once the server is back in the idle set.
        drop(permit);
        debug!(client = %client.id(), server = %server_id, "detached");
    }

    /// Terminate the client's server definitively: remove it from the
    /// pool, close its backend connection, and free it. The client goes
    /// back to `Pending`.
    pub async fn close(&self, client: &Arc<Client>) {
        let route = client.route().expect("close of an unrouted client");
        let server_id = client
            .placement()
            .server
            .take()
            .expect("close without an attached server");

        let mut guard = route.inner.lock().await;
        let mut server = guard
            .servers
            .remove(server_id)
            .expect("attached server missing from its pool");
        guard.clients.set(client, ClientState::Pending);
        server.client = None;
        server.last_client_id = Some(client.id());
        server.route_id = None;
        drop(guard);

        if let Some(mut io) = server.io.take() {
            io.close();
        }
        debug!(client = %client.id(), server = %server_id, "closed server");
        // Dropping the server frees its pool slot, waking a queued client.
    }

    /// Look up routing metadata for a wire cancel key.
    ///
    /// Non-blocking on the target connection: the caller sends the
    /// actual cancel packet on a fresh connection built from the copied
    /// storage descriptor.
    pub async fn cancel(&self, key: CancelKey) -> RouterResult<CancelRequest> {
        let inner = self.inner.lock().await;
        for route in inner.routes.iter() {
            let guard = route.inner.lock().await;
            if let Some(server) =
                guard.servers.find(ServerState::Active, |s| s.key_client == key)
            {
                debug!(server = %server.id, "matched cancel key");
                return Ok(CancelRequest {
                    server_id: server.id,
                    key: server.key,
                    storage: route.rule().storage_copy(),
                });
            }
        }
        Err(RouterError::ServerNotFound)
    }

    /// Signal the named client to close, wherever it is held.
    pub async fn kill(&self, id: ClientId) {
        let inner = self.inner.lock().await;
        for route in inner.routes.iter() {
            if route.kill_client(id).await {
                debug!(client = %id, route = %route.id(), "killed client");
            }
        }
    }

    /// Hot-swap the rule set. Routes left holding an obsolete rule have
    /// their whole client pool signalled to close. Returns the number of
    /// rules whose obsolescence state changed.
    pub async fn reconfigure(&self, rules: &[RuleConfig]) -> usize {
        let mut inner = self.inner.lock().await;
        let updates = inner.rules.merge(RuleTable::from_config(rules));
        if updates > 0 {
            for route in inner.routes.iter() {
                if route.rule().is_obsolete() {
                    route.kill_client_pool().await;
                }
            }
            info!(updates, "reconfigured rules, draining obsolete routes");
        }
        updates
    }

    /// TTL and obsoletion sweep over every route's idle servers.
    ///
    /// Returns the expelled servers; the caller closes and frees them
    /// outside the locks. Runs once per tick: each pass advances every
    /// surviving idle server's `idle_time` by one second.
    pub async fn expire(&self) -> Vec<Server> {
        let inner = self.inner.lock().await;
        let mut expired = Vec::new();

        for route in inner.routes.iter() {
            let mut guard = route.inner.lock().await;

            // A drained obsolete route gives up every idle server at once.
            if route.rule().is_obsolete() && guard.clients.total() == 0 {
                let mut drained = guard.servers.drain_state(ServerState::Idle);
                for server in &mut drained {
                    server.route_id = None;
                }
                expired.extend(drained);
                continue;
            }

            let ttl = route.rule().pool_ttl;
            if ttl == 0 {
                continue;
            }

            let mut due = Vec::new();
            for server in guard.servers.iter_state_mut(ServerState::Idle) {
                if server.idle_time < ttl {
                    server.idle_time += 1;
                } else {
                    due.push(server.id);
                }
            }
            for id in due {
                let mut server = guard
                    .servers
                    .remove(id)
                    .expect("idle server vanished mid-sweep");
                server.route_id = None;
                expired.push(server);
            }
        }

        if !expired.is_empty() {
            info!(count = expired.len(), "expired idle servers");
        }
        expired
    }

    /// Reclaim empty routes: zero clients, zero servers, and either
    /// dynamic or bound to an obsolete rule. Returns how many were
    /// collected.
    pub async fn gc(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let mut victims = Vec::new();

        for route in inner.routes.iter() {
            let guard = route.inner.lock().await;
            let empty = guard.clients.total() == 0 && guard.servers.total() == 0;
            drop(guard);
            if empty && (route.is_dynamic() || route.rule().is_obsolete()) {
                victims.push(Arc::clone(route));
            }
        }

        for route in &victims {
            inner.routes.unlink(route);
            debug!(route = %route.id(), "collected empty route");
        }
        victims.len()
    }

    /// Per-route usage snapshot, taken under the router lock.
    pub async fn stat(&self) -> Vec<(RouteId, RouteStats)> {
        let inner = self.inner.lock().await;
        let mut stats = Vec::with_capacity(inner.routes.len());
        for route in inner.routes.iter() {
            stats.push((route.id().clone(), route.stats().await));
        }
        stats
    }

    /// Number of clients currently held between `route` and `unroute`.
    pub async fn clients(&self) -> usize {
        self.inner.lock().await.clients
    }

    /// Snapshot of the live routes.
    pub async fn routes(&self) -> Vec<Arc<Route>> {
        self.inner.lock().await.routes.iter().cloned().collect()
    }

    pub async fn route_count(&self) -> usize {
        self.inner.lock().await.routes.len()
    }

    /// Run `f` against the server currently attached to `client`. The
    /// backend driver uses this to install the connection handle and
    /// session key after connecting.
    pub async fn with_attached_server<R>(
        &self,
        client: &Arc<Client>,
        f: impl FnOnce(&mut Server) -> R,
    ) -> Option<R> {
        let route = client.route()?;
        let server_id = client.server()?;
        let mut guard = route.inner.lock().await;
        guard.servers.get_mut(server_id).map(f)
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
