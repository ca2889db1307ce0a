//! Monotonic identifier allocation for clients and servers.
//!
//! Ids are opaque `u64` handles with a one-letter display prefix so log
//! lines stay readable (`c17` routed to `s4`).

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier of a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Identifier of a backend server connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerId(u64);

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Lock-free allocator handing out monotonically increasing ids.
#[derive(Debug)]
pub struct IdAllocator {
    next: AtomicU64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    fn allocate(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    pub fn client_id(&self) -> ClientId {
        ClientId(self.allocate())
    }

    pub fn server_id(&self) -> ServerId {
        ServerId(self.allocate())
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic() {
        let ids = IdAllocator::new();
        let a = ids.server_id();
        let b = ids.server_id();
        assert!(a < b);
    }

    #[test]
    fn display_prefixes() {
        let ids = IdAllocator::new();
        assert_eq!(ids.client_id().to_string(), "c1");
        assert_eq!(ids.server_id().to_string(), "s2");
    }

    #[test]
    fn concurrent_allocation_is_unique() {
        use std::collections::HashSet;
        use std::sync::Arc;
        use std::thread;

        let ids = Arc::new(IdAllocator::new());
        let mut handles = vec![];

        for _ in 0..4 {
            let ids = ids.clone();
            handles.push(thread::spawn(move || {
                (0..250).map(|_| ids.client_id()).collect::<Vec<_>>()
            }));
        }

        let mut seen = HashSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                assert!(seen.insert(id));
            }
        }
        assert_eq!(seen.len(), 1000);
    }
}
