//! # Connection Registry
//!
//! Maps device UIDs to their live [`DeviceConnection`]. One instance is
//! created per broker and handed to every component that needs it.
//!
//! Backed by [`DashMap`]: each operation is a single per-key critical
//! section, so a lookup never observes a half-applied register or
//! unregister, and no I/O ever happens while an entry is locked.

use crate::connection::DeviceConnection;
use dashmap::DashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<String, Arc<DeviceConnection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `connection` under its device UID and returns the entry it
    /// superseded, if any. Retiring the old connection is the caller's job.
    pub fn register(&self, connection: Arc<DeviceConnection>) -> Option<Arc<DeviceConnection>> {
        self.connections
            .insert(connection.device_uid().to_owned(), connection)
    }

    pub fn lookup(&self, device_uid: &str) -> Option<Arc<DeviceConnection>> {
        self.connections
            .get(device_uid)
            .map(|entry| entry.value().clone())
    }

    /// Removes the entry only if it is still `connection`, so a late
    /// unregister never evicts a newer connection for the same device.
    pub fn unregister(&self, connection: &Arc<DeviceConnection>) -> bool {
        self.connections
            .remove_if(connection.device_uid(), |_, current| {
                Arc::ptr_eq(current, connection)
            })
            .is_some()
    }

    /// Snapshot of all registered connections.
    pub fn list(&self) -> Vec<Arc<DeviceConnection>> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
