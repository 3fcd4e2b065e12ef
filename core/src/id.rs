//! Connector identifiers and the per-session connector registry.

use crate::error::SyncError;
use core::fmt;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::HashMap;

/// Identifies a connector within one session.
///
/// Ids are opaque strings on the wire. The server hands them out sequentially.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectorId(String);

impl ConnectorId {
    pub fn new(id: impl Into<String>) -> ConnectorId {
        ConnectorId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectorId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ConnectorId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ConnectorId {
    fn from(id: &str) -> ConnectorId {
        ConnectorId::new(id)
    }
}

/// Hands out fresh connector ids for one session.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next: u64,
}

impl IdAllocator {
    pub fn new() -> IdAllocator {
        IdAllocator::default()
    }

    pub fn allocate(&mut self) -> ConnectorId {
        let id = ConnectorId(self.next.to_string());
        self.next += 1;
        id
    }
}

/// Maps connector ids to live connector instances.
///
/// One registry exists per session (and one per client), never per process.
#[derive(Debug)]
pub struct ConnectorRegistry<T> {
    connectors: HashMap<ConnectorId, T>,
}

impl<T> Default for ConnectorRegistry<T> {
    fn default() -> Self {
        ConnectorRegistry {
            connectors: HashMap::new(),
        }
    }
}

impl<T> ConnectorRegistry<T> {
    pub fn new() -> ConnectorRegistry<T> {
        ConnectorRegistry::default()
    }

    /// Registers an instance under a fresh id.
    ///
    /// Fails if the id is already taken; the existing instance is left in place.
    pub fn register(&mut self, id: ConnectorId, instance: T) -> Result<(), SyncError> {
        if self.connectors.contains_key(&id) {
            return Err(SyncError::DuplicateConnector(id));
        }
        self.connectors.insert(id, instance);
        Ok(())
    }

    pub fn resolve(&self, id: &str) -> Result<&T, SyncError> {
        self.connectors
            .get(id)
            .ok_or_else(|| SyncError::BrokenConnectorReference(ConnectorId::new(id)))
    }

    pub fn resolve_mut(&mut self, id: &str) -> Result<&mut T, SyncError> {
        self.connectors
            .get_mut(id)
            .ok_or_else(|| SyncError::BrokenConnectorReference(ConnectorId::new(id)))
    }

    /// Removes an instance. Returns `None` if it was never registered.
    pub fn unregister(&mut self, id: &str) -> Option<T> {
        self.connectors.remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.connectors.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &ConnectorId> {
        self.connectors.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ConnectorId, &T)> {
        self.connectors.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&ConnectorId, &mut T)> {
        self.connectors.iter_mut()
    }

    pub fn clear(&mut self) {
        self.connectors.clear();
    }
}
