//! Client connections as seen by the router.
//!
//! The protocol layer owns the client; the router borrows it for the
//! span `route` → `unroute` and maintains its placement (route, rule,
//! attached server).

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tokio::sync::watch;

use pgrelay_core::{ClientId, ServerId};

use crate::route::Route;
use crate::rules::Rule;

/// Startup parameters produced by the protocol handshake.
#[derive(Debug, Clone)]
pub struct Startup {
    pub database: Bytes,
    pub user: Bytes,
}

impl Startup {
    pub fn new(database: impl Into<Bytes>, user: impl Into<Bytes>) -> Self {
        Self {
            database: database.into(),
            user: user.into(),
        }
    }
}

/// Forged wire key handed to the client at session start, used to route
/// out-of-band cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CancelKey {
    pub pid: u32,
    pub secret: u32,
}

impl CancelKey {
    pub fn new(pid: u32, secret: u32) -> Self {
        Self { pid, secret }
    }
}

/// Placement the router maintains for a routed client.
#[derive(Debug, Default)]
pub(crate) struct Placement {
    pub route: Option<Arc<Route>>,
    pub rule: Option<Arc<Rule>>,
    pub server: Option<ServerId>,
}

/// A client connection.
pub struct Client {
    id: ClientId,
    startup: Startup,
    key: CancelKey,
    pub(crate) placement: Mutex<Placement>,
    kill_tx: watch::Sender<bool>,
}

impl Client {
    pub fn new(id: ClientId, startup: Startup, key: CancelKey) -> Arc<Self> {
        let (kill_tx, _) = watch::channel(false);
        Arc::new(Self {
            id,
            startup,
            key,
            placement: Mutex::new(Placement::default()),
            kill_tx,
        })
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn startup(&self) -> &Startup {
        &self.startup
    }

    pub fn key(&self) -> CancelKey {
        self.key
    }

    pub(crate) fn placement(&self) -> MutexGuard<'_, Placement> {
        self.placement.lock().expect("client placement lock poisoned")
    }

    /// Route this client is currently bound to, if any.
    pub fn route(&self) -> Option<Arc<Route>> {
        self.placement().route.clone()
    }

    /// Rule matched for this client at routing time, if any.
    pub fn rule(&self) -> Option<Arc<Rule>> {
        self.placement().rule.clone()
    }

    /// Server this client is currently attached to, if any.
    pub fn server(&self) -> Option<ServerId> {
        self.placement().server
    }

    /// Ask the owning task to close this client.
    pub fn kill(&self) {
        let _ = self.kill_tx.send(true);
    }

    pub fn is_killed(&self) -> bool {
        *self.kill_tx.borrow()
    }

    /// Subscribe to the kill signal; resolves when `kill` is called.
    pub fn kill_signal(&self) -> watch::Receiver<bool> {
        self.kill_tx.subscribe()
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("startup", &self.startup)
            .finish_non_exhaustive()
    }
}
