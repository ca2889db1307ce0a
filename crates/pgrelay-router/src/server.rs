//! Backend server objects owned by route server pools.

use std::fmt;

use tokio::sync::OwnedSemaphorePermit;

use pgrelay_core::{ClientId, ServerId};

use crate::client::CancelKey;
use crate::route::RouteId;

/// Driver-owned backend connection handle.
///
/// The router never performs I/O on it; it only carries the handle
/// between pool states and hands it to the worker-loop scheduler.
pub trait BackendConnection: Send + fmt::Debug {
    /// Close the underlying transport.
    fn close(&mut self);
}

/// A pooled backend server connection.
pub struct Server {
    pub id: ServerId,
    /// Route this server belongs to; cleared when the server leaves the
    /// pool for good.
    pub route_id: Option<RouteId>,
    /// Client currently attached, if any.
    pub client: Option<ClientId>,
    /// Backend socket handle, present once the driver connected.
    pub io: Option<Box<dyn BackendConnection>>,
    /// Key assigned by the backend on session start.
    pub key: CancelKey,
    /// Forged key of the last attached client, for cancel matching.
    pub key_client: CancelKey,
    pub last_client_id: Option<ClientId>,
    /// Seconds spent idle, advanced by the expire sweep.
    pub idle_time: u64,
    /// Backend signalled ReadyForQuery.
    pub is_ready: bool,
    /// Session is inside an explicit transaction block.
    pub is_transaction: bool,
    /// Packet reader chunk size, from configuration.
    pub packet_chunk: usize,
    /// Pool slot held for the span the server is active. Dropping it
    /// wakes the next queued client.
    pub(crate) permit: Option<OwnedSemaphorePermit>,
}

impl Server {
    pub(crate) fn new(id: ServerId, route_id: RouteId, packet_chunk: usize) -> Self {
        Self {
            id,
            route_id: Some(route_id),
            client: None,
            io: None,
            key: CancelKey::default(),
            key_client: CancelKey::default(),
            last_client_id: None,
            idle_time: 0,
            is_ready: false,
            is_transaction: false,
            packet_chunk,
            permit: None,
        }
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("id", &self.id)
            .field("client", &self.client)
            .field("idle_time", &self.idle_time)
            .field("has_io", &self.io.is_some())
            .finish_non_exhaustive()
    }
}
