//! Routing and pooling core of the pgrelay connection pooler.
//!
//! Accepts clients classified by the protocol handshake, places each on
//! a route resolved from the rule table, and multiplexes routed clients
//! over a bounded set of reusable backend server connections.
//!
//! # Architecture
//!
//! ```text
//! Protocol layer hands over a Client (startup, wire key)
//!   → Router::route    classifies against the rule table, admits
//!     → Route           owns one client pool and one server pool
//!   → Router::attach   reuses an idle server, or allocates, or queues
//!   → Router::detach   returns the server to the idle set, wakes a waiter
//!   → Router::unroute  releases the client
//!
//! Maintenance task: expire (idle TTL), gc (empty routes),
//! reconfigure (rule hot-swap), stat. Out-of-band: cancel, kill.
//! ```
//!
//! Backend connections and worker event loops stay behind the
//! [`server::BackendConnection`] and [`io::IoScheduler`] seams; the
//! router performs no I/O of its own.

pub mod client;
pub mod error;
pub mod io;
pub mod pool;
pub mod route;
pub mod router;
pub mod rules;
pub mod server;

pub use client::{CancelKey, Client, Startup};
pub use error::{RouterError, RouterResult};
pub use io::{IoScheduler, SingleWorker};
pub use pool::{ClientState, ServerState};
pub use route::{Route, RouteId, RouteStats};
pub use router::{CancelRequest, Router};
pub use rules::{Rule, RuleTable, Storage};
pub use server::{BackendConnection, Server};
