//! Atomically swappable route table
//!
//! Connection tasks take a snapshot with [`SharedRouteTable::load`] and keep
//! using it for the rest of their lifetime; a reload never affects a
//! connection that already picked its backend.

use std::sync::{Arc, RwLock};
use tracing::debug;

use crate::table::RouteTable;

/// Copy-on-write holder for the active [`RouteTable`]
///
/// The lock only guards the pointer: readers clone the `Arc` and release it
/// immediately, writers swap in a fully built table.
pub struct SharedRouteTable {
    current: RwLock<Arc<RouteTable>>,
}

impl SharedRouteTable {
    pub fn new(table: RouteTable) -> Self {
        Self {
            current: RwLock::new(Arc::new(table)),
        }
    }

    /// Current snapshot
    pub fn load(&self) -> Arc<RouteTable> {
        // A panic while holding the lock cannot leave a half-written table
        let current = self.current.read().unwrap_or_else(|e| e.into_inner());
        current.clone()
    }

    /// Replace the table, returning the previous snapshot
    pub fn store(&self, table: RouteTable) -> Arc<RouteTable> {
        debug!("Swapping route table ({} routes)", table.len());
        let table = Arc::new(table);
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *current, table)
    }
}

impl Default for SharedRouteTable {
    fn default() -> Self {
        Self::new(RouteTable::default())
    }
}
