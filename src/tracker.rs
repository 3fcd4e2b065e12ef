//! Tracks the connectors of one session and what the client has seen of them.

use crate::component::ServerConnector;
use std::collections::{HashMap, HashSet};
use tracing::debug;
use vireo_core::codec::encode_patch;
use vireo_core::diff::{diff, diff_from_defaults};
use vireo_core::message::{HierarchyEntry, StateEntry};
use vireo_core::state::{Schema, State};
use vireo_core::{ConnectorId, ConnectorRegistry, IdAllocator, Invocation, SyncError};

/// Everything that changed since the last transaction.
#[derive(Debug, Default)]
pub struct Changes {
    /// Set when the client does not know the root yet.
    pub root: Option<ConnectorId>,
    pub state: Vec<StateEntry>,
    pub hierarchy: Vec<HierarchyEntry>,
    pub rpc: Vec<Invocation>,
}

/// The connector tree of one session.
#[derive(Debug, Default)]
pub struct ConnectorTracker {
    connectors: ConnectorRegistry<ServerConnector>,
    ids: IdAllocator,
    root: Option<ConnectorId>,
    root_sent: bool,
    /// State as last sent to the client. Absent means the client has never seen the connector.
    sent_states: HashMap<ConnectorId, State>,
    sent_hierarchy: HashMap<ConnectorId, Vec<ConnectorId>>,
    hierarchy_dirty: bool,
    /// Connectors that have been part of the tree at some point.
    was_attached: HashSet<ConnectorId>,
    /// Connectors the client has been told about, whether or not it has been repainted since.
    known_to_client: HashSet<ConnectorId>,
    /// Removed connectors the client may still refer to, with the sync id that removed them.
    unregistered: HashMap<ConnectorId, u64>,
}

impl ConnectorTracker {
    pub fn new() -> ConnectorTracker {
        ConnectorTracker::default()
    }

    /// Creates and registers a connector. It is not attached until it is added to the tree.
    pub fn create(&mut self, type_name: &'static str, schema: &'static Schema) -> Result<ConnectorId, SyncError> {
        let id = self.ids.allocate();
        self.connectors
            .register(id.clone(), ServerConnector::new(id.clone(), type_name, schema))?;
        debug!(connector = %id, type_name, "connector created");
        Ok(id)
    }

    pub fn root(&self) -> Option<&ConnectorId> {
        self.root.as_ref()
    }

    pub fn set_root(&mut self, id: &ConnectorId) -> Result<(), SyncError> {
        self.connectors.resolve(id.as_str())?;
        self.root = Some(id.clone());
        self.root_sent = false;
        self.hierarchy_dirty = true;
        self.mark_attached(id);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<&ServerConnector, SyncError> {
        self.connectors.resolve(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Result<&mut ServerConnector, SyncError> {
        self.connectors.resolve_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.connectors.contains(id)
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }

    /// Appends `child` to the children of `parent`, moving it if it already has a parent.
    pub fn add_child(&mut self, parent: &ConnectorId, child: &ConnectorId) -> Result<(), SyncError> {
        let index = self.get(parent.as_str())?.children.len();
        self.insert_child(parent, index, child)
    }

    /// Inserts `child` at `index` (clamped) among the children of `parent`.
    pub fn insert_child(&mut self, parent: &ConnectorId, index: usize, child: &ConnectorId) -> Result<(), SyncError> {
        self.connectors.resolve(child.as_str())?;
        self.connectors.resolve(parent.as_str())?;
        if self.is_ancestor_or_self(child, parent) || self.root.as_ref() == Some(child) {
            return Err(SyncError::HierarchyCycle {
                parent: parent.clone(),
                child: child.clone(),
            });
        }

        if let Some(old_parent) = self.get(child.as_str())?.parent.clone() {
            self.get_mut(old_parent.as_str())?.children.retain(|c| c != child);
        }

        let parent_node = self.get_mut(parent.as_str())?;
        let index = index.min(parent_node.children.len());
        parent_node.children.insert(index, child.clone());
        self.get_mut(child.as_str())?.parent = Some(parent.clone());
        self.hierarchy_dirty = true;
        if self.is_attached(parent) {
            self.mark_attached(child);
        }
        Ok(())
    }

    /// Remembers `id` and its descendants as having been in the tree.
    fn mark_attached(&mut self, id: &ConnectorId) {
        let mut stack = vec![id.clone()];
        while let Some(id) = stack.pop() {
            if let Ok(connector) = self.connectors.resolve(id.as_str()) {
                stack.extend(connector.children.iter().cloned());
                self.was_attached.insert(id);
            }
        }
    }

    /// Removes `child` from `parent`. The child is unregistered at the end of the transaction
    /// unless it is added somewhere else first.
    pub fn remove_child(&mut self, parent: &ConnectorId, child: &ConnectorId) -> Result<(), SyncError> {
        let parent_node = self.get_mut(parent.as_str())?;
        let before = parent_node.children.len();
        parent_node.children.retain(|c| c != child);
        if parent_node.children.len() == before {
            return Err(SyncError::BrokenConnectorReference(child.clone()));
        }
        if let Ok(child) = self.get_mut(child.as_str()) {
            child.parent = None;
        }
        self.hierarchy_dirty = true;
        Ok(())
    }

    fn is_ancestor_or_self(&self, ancestor: &ConnectorId, id: &ConnectorId) -> bool {
        let mut current = Some(id);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.connectors.resolve(id.as_str()).ok().and_then(|c| c.parent.as_ref());
        }
        false
    }

    /// True if the connector is connected to the root.
    pub fn is_attached(&self, id: &ConnectorId) -> bool {
        match &self.root {
            Some(root) => self.is_ancestor_or_self(root, id),
            None => false,
        }
    }

    /// True if neither the connector nor any of its ancestors is disabled.
    pub fn is_enabled(&self, id: &ConnectorId) -> bool {
        let mut current = self.connectors.resolve(id.as_str()).ok();
        while let Some(connector) = current {
            if !connector.is_enabled_self() {
                return false;
            }
            current = connector
                .parent
                .as_ref()
                .and_then(|p| self.connectors.resolve(p.as_str()).ok());
        }
        true
    }

    /// True if the connector was removed but the client may not have noticed yet.
    pub fn is_stale(&self, id: &ConnectorId) -> bool {
        self.unregistered.contains_key(id)
    }

    /// The client has seen every response up to `sync_id`; forgets connectors it knows are gone.
    pub fn acknowledge(&mut self, sync_id: u64) {
        self.unregistered.retain(|_, removed_in| *removed_in > sync_id);
    }

    /// Requeues ClientRpc invocations that never reached the client.
    ///
    /// Invocations for connectors that have been unregistered since are dropped.
    pub fn restore_client_rpc(&mut self, rpc: Vec<Invocation>) {
        let mut by_connector: Vec<(ConnectorId, Vec<Invocation>)> = Vec::new();
        for invocation in rpc {
            match by_connector.iter_mut().find(|(id, _)| *id == invocation.connector) {
                Some((_, list)) => list.push(invocation),
                None => by_connector.push((invocation.connector.clone(), vec![invocation])),
            }
        }
        for (id, invocations) in by_connector {
            match self.connectors.resolve_mut(id.as_str()) {
                Ok(connector) => connector.restore_client_rpc(invocations),
                Err(_) => debug!(connector = %id, count = invocations.len(), "dropping undelivered client rpc"),
            }
        }
    }

    /// Forgets what the client has seen, so the next collection sends everything.
    pub fn mark_all_uninitialized(&mut self) {
        self.sent_states.clear();
        self.sent_hierarchy.clear();
        self.root_sent = false;
        self.hierarchy_dirty = true;
    }

    /// True if collecting now would produce anything.
    pub fn has_pending_changes(&self) -> bool {
        if self.root.is_none() {
            return false;
        }
        if self.hierarchy_dirty || !self.root_sent {
            return true;
        }
        self.attached().iter().any(|id| {
            self.connectors.resolve(id.as_str()).map_or(false, |c| {
                c.dirty || c.has_pending_rpc() || !self.sent_states.contains_key(id)
            })
        })
    }

    /// Connectors reachable from the root, parents before children.
    fn attached(&self) -> Vec<ConnectorId> {
        let mut attached = Vec::new();
        let mut stack: Vec<ConnectorId> = self.root.iter().cloned().collect();
        while let Some(id) = stack.pop() {
            if let Ok(connector) = self.connectors.resolve(id.as_str()) {
                stack.extend(connector.children.iter().rev().cloned());
                attached.push(id);
            }
        }
        attached
    }

    /// Collects the changes for the response tagged `sync_id`.
    ///
    /// Connectors the client knew about that are no longer attached are unregistered here.
    pub fn collect_changes(&mut self, sync_id: u64) -> Changes {
        let attached = self.attached();
        let mut changes = Changes::default();

        if !self.root_sent {
            changes.root = self.root.clone();
            self.root_sent = true;
        }

        for id in &attached {
            self.was_attached.insert(id.clone());
            let connector = match self.connectors.resolve_mut(id.as_str()) {
                Ok(connector) => connector,
                Err(_) => continue,
            };

            match self.sent_states.get(id) {
                None => {
                    let patch = diff_from_defaults(connector.state());
                    changes.state.push(StateEntry {
                        connector: id.clone(),
                        type_name: Some(connector.type_name().to_string()),
                        diff: encode_patch(connector.state().schema(), &patch),
                    });
                    self.sent_states.insert(id.clone(), connector.state().clone());
                    self.known_to_client.insert(id.clone());
                }
                Some(sent) if connector.dirty => {
                    let patch = diff(sent, connector.state());
                    if !patch.is_empty() {
                        changes.state.push(StateEntry {
                            connector: id.clone(),
                            type_name: None,
                            diff: encode_patch(connector.state().schema(), &patch),
                        });
                        self.sent_states.insert(id.clone(), connector.state().clone());
                    }
                }
                Some(_) => (),
            }
            connector.dirty = false;

            let unchanged = match self.sent_hierarchy.get(id) {
                Some(sent) => *sent == connector.children,
                None => connector.children.is_empty(),
            };
            if !unchanged {
                changes.hierarchy.push(HierarchyEntry {
                    connector: id.clone(),
                    children: connector.children.clone(),
                });
            }
            self.sent_hierarchy.insert(id.clone(), connector.children.clone());

            changes.rpc.extend(connector.drain_client_rpc());
        }

        self.unregister_detached(&attached, sync_id);
        self.hierarchy_dirty = false;
        changes
    }

    /// Unregisters connectors that left the tree, along with their descendants.
    ///
    /// Connectors that were never attached stay registered; they may still be added.
    fn unregister_detached(&mut self, attached: &[ConnectorId], sync_id: u64) {
        let attached: HashSet<&ConnectorId> = attached.iter().collect();
        let mut detached: Vec<ConnectorId> = self
            .connectors
            .ids()
            .filter(|id| !attached.contains(id) && self.was_attached.contains(*id))
            .cloned()
            .collect();

        while let Some(id) = detached.pop() {
            let mut connector = match self.connectors.unregister(id.as_str()) {
                Some(connector) => connector,
                None => continue,
            };
            detached.extend(connector.children.drain(..));

            let dropped = connector.drain_client_rpc();
            if !dropped.is_empty() {
                debug!(connector = %id, count = dropped.len(), "dropping client rpc for detached connector");
            }
            self.sent_hierarchy.remove(&id);
            self.sent_states.remove(&id);
            self.was_attached.remove(&id);
            if self.known_to_client.remove(&id) {
                self.unregistered.insert(id.clone(), sync_id);
            }
            debug!(connector = %id, sync_id, "connector unregistered");
        }

        // client rpc queued on connectors that were never attached is not kept either
        for (id, connector) in self.connectors.iter_mut() {
            if !attached.contains(id) && connector.has_pending_rpc() {
                debug!(connector = %id, "dropping client rpc for unattached connector");
                connector.drain_client_rpc();
            }
        }
    }
}
