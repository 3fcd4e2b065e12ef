//! The client-side connector hierarchy.
//!
//! A server message is applied as one batch: state for new and existing connectors first, then
//! every hierarchy change, and only then are connectors that ended up unreachable from the root
//! destroyed. A connector that is removed from one parent and added to another within the same
//! message is therefore moved, never recreated.

use crate::backend::{Connector, WidgetSet};
use crate::codec::decode_patch;
use crate::diff::apply;
use crate::error::SyncError;
use crate::id::{ConnectorId, ConnectorRegistry};
use crate::message::{HierarchyEntry, ServerMessage, StateEntry};
use crate::state::State;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::{debug, warn};

/// Where a connector is in its client-side life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Created from state, not yet placed in the hierarchy.
    Unattached,
    Attached,
    /// Removed from its parent; destroyed at the end of the batch unless re-parented.
    Detached,
    Destroyed,
}

struct Node {
    connector: Box<dyn Connector>,
    state: State,
    lifecycle: Lifecycle,
    parent: Option<ConnectorId>,
    children: Vec<ConnectorId>,
    initialized: bool,
}

/// A state entry decoded and applied to a copy, ready to be swapped in.
struct Prepared<'a> {
    entry: &'a StateEntry,
    state: State,
    changed: Vec<String>,
    created: bool,
}

/// What applying one batch did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub created: Vec<ConnectorId>,
    pub destroyed: Vec<ConnectorId>,
    /// References to unknown connectors that were skipped.
    pub skipped: usize,
}

/// The client's mirror of the server connector tree.
pub struct ConnectorTree {
    nodes: ConnectorRegistry<Node>,
    root: Option<ConnectorId>,
    widgets: WidgetSet,
}

impl ConnectorTree {
    pub fn new(widgets: WidgetSet) -> ConnectorTree {
        ConnectorTree {
            nodes: ConnectorRegistry::new(),
            root: None,
            widgets,
        }
    }

    pub fn root(&self) -> Option<&ConnectorId> {
        self.root.as_ref()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains(id)
    }

    pub fn state(&self, id: &str) -> Option<&State> {
        self.nodes.resolve(id).ok().map(|n| &n.state)
    }

    pub fn children(&self, id: &str) -> Option<&[ConnectorId]> {
        self.nodes.resolve(id).ok().map(|n| n.children.as_slice())
    }

    pub fn parent(&self, id: &str) -> Option<&ConnectorId> {
        self.nodes.resolve(id).ok().and_then(|n| n.parent.as_ref())
    }

    pub fn lifecycle(&self, id: &str) -> Option<Lifecycle> {
        self.nodes.resolve(id).ok().map(|n| n.lifecycle)
    }

    pub fn connector(&self, id: &str) -> Option<&dyn Connector> {
        self.nodes.resolve(id).ok().map(|n| &*n.connector)
    }

    /// Destroys every connector.
    pub fn clear(&mut self) {
        let ids: Vec<ConnectorId> = self.nodes.ids().cloned().collect();
        for id in ids {
            self.destroy(&id);
        }
        self.root = None;
    }

    /// Applies the connector changes of one server message.
    ///
    /// Fails if a state diff cannot be decoded or applied, in which case nothing has been changed
    /// (unless the message was a full repaint). Unknown connector references are skipped.
    pub fn apply_batch(&mut self, message: &ServerMessage) -> Result<BatchReport, SyncError> {
        if message.meta.repaint_all {
            debug!("full repaint, dropping connector tree");
            self.clear();
        }

        let mut report = BatchReport::default();
        let prepared = self.prepare_state(&message.state, &mut report)?;

        if let Some(root) = &message.root {
            self.root = Some(root.clone());
        }

        let mut changed_state: BTreeMap<ConnectorId, Vec<String>> = BTreeMap::new();
        for prepared in prepared {
            self.apply_state(prepared, &mut changed_state, &mut report);
        }

        let mut changed_children = BTreeSet::new();
        for entry in &message.hierarchy {
            self.apply_hierarchy(entry, &mut changed_children, &mut report);
        }

        let attached = self.collect_garbage(&mut report);

        for id in &attached {
            if let Ok(node) = self.nodes.resolve_mut(id.as_str()) {
                node.lifecycle = Lifecycle::Attached;
                if !node.initialized {
                    node.initialized = true;
                    node.connector.init(id);
                }
            }
        }

        for id in &changed_children {
            if let Ok(node) = self.nodes.resolve_mut(id.as_str()) {
                node.connector.on_children_changed(&node.children);
            }
        }

        for (id, changed) in &changed_state {
            if let Ok(node) = self.nodes.resolve_mut(id.as_str()) {
                node.connector.on_state_changed(&node.state, changed);
            }
        }

        for invocation in &message.rpc {
            match self.nodes.resolve_mut(invocation.connector.as_str()) {
                Ok(node) => {
                    if let Err(err) = node.connector.handle_rpc(invocation) {
                        warn!(connector = %invocation.connector, %err, "client rpc failed");
                    }
                }
                Err(_) => {
                    debug!(connector = %invocation.connector, "client rpc for unknown connector");
                    report.skipped += 1;
                }
            }
        }

        Ok(report)
    }

    /// Decodes every state diff and applies it to a copy of the target state.
    ///
    /// Nothing in the tree is touched here, so a bad diff anywhere fails the whole batch.
    fn prepare_state<'a>(
        &self,
        entries: &'a [StateEntry],
        report: &mut BatchReport,
    ) -> Result<Vec<Prepared<'a>>, SyncError> {
        let mut prepared: Vec<Prepared<'a>> = Vec::with_capacity(entries.len());
        for entry in entries {
            let id = &entry.connector;
            // the same connector twice in one message builds on its earlier entry
            let earlier = prepared.iter().rposition(|p| p.entry.connector == *id);
            let (base, created) = match (earlier, self.nodes.resolve(id.as_str())) {
                (Some(index), _) => (prepared[index].state.clone(), prepared[index].created),
                (None, Ok(node)) => (node.state.clone(), false),
                (None, Err(_)) => match entry.type_name.as_deref().map(|t| (t, self.widgets.schema(t))) {
                    Some((_, Some(schema))) => (State::new(schema), true),
                    Some((type_name, None)) => {
                        warn!(connector = %id, type_name, "unknown connector type");
                        report.skipped += 1;
                        continue;
                    }
                    None => {
                        debug!(connector = %id, "state for unknown connector");
                        report.skipped += 1;
                        continue;
                    }
                },
            };

            let mut state = base;
            let patch = decode_patch(state.schema(), &entry.diff)?;
            let changed = apply(&mut state, &patch).map_err(|err| {
                SyncError::MalformedMessage(format!("state change for {}: {}", id, err))
            })?;
            prepared.push(Prepared {
                entry,
                state,
                changed,
                created,
            });
        }
        Ok(prepared)
    }

    fn apply_state(
        &mut self,
        prepared: Prepared<'_>,
        changed_state: &mut BTreeMap<ConnectorId, Vec<String>>,
        report: &mut BatchReport,
    ) {
        let id = &prepared.entry.connector;
        if !self.nodes.contains(id.as_str()) {
            let type_name = prepared.entry.type_name.as_deref().unwrap_or_default();
            let connector = match self.widgets.create(type_name, id) {
                Some((connector, _)) => connector,
                None => return,
            };
            let node = Node {
                connector,
                state: State::new(prepared.state.schema()),
                lifecycle: Lifecycle::Unattached,
                parent: None,
                children: Vec::new(),
                initialized: false,
            };
            if self.nodes.register(id.clone(), node).is_err() {
                return;
            }
            report.created.push(id.clone());
        }

        let node = match self.nodes.resolve_mut(id.as_str()) {
            Ok(node) => node,
            Err(_) => return,
        };
        node.state = prepared.state;

        let fields = changed_state.entry(id.clone()).or_default();
        let changed = if prepared.created {
            // the first state change reports every field
            node.state.fields().map(|(f, _)| f.name.to_string()).collect()
        } else {
            prepared.changed
        };
        for field in changed {
            if !fields.contains(&field) {
                fields.push(field);
            }
        }
    }

    fn apply_hierarchy(
        &mut self,
        entry: &HierarchyEntry,
        changed_children: &mut BTreeSet<ConnectorId>,
        report: &mut BatchReport,
    ) {
        let parent_id = &entry.connector;
        if !self.nodes.contains(parent_id.as_str()) {
            warn!(connector = %parent_id, "hierarchy change for unknown connector");
            report.skipped += 1;
            return;
        }

        let mut children = Vec::with_capacity(entry.children.len());
        for child in &entry.children {
            if child == parent_id || children.contains(child) {
                warn!(connector = %child, parent = %parent_id, "ignoring invalid child");
            } else if self.nodes.contains(child.as_str()) {
                children.push(child.clone());
            } else {
                warn!(connector = %child, parent = %parent_id, "skipping unknown child");
                report.skipped += 1;
            }
        }

        let old = match self.nodes.resolve_mut(parent_id.as_str()) {
            Ok(node) if node.children == children => return,
            Ok(node) => std::mem::replace(&mut node.children, children.clone()),
            Err(_) => return,
        };
        changed_children.insert(parent_id.clone());

        for removed in old.iter().filter(|c| !children.contains(c)) {
            if let Ok(node) = self.nodes.resolve_mut(removed.as_str()) {
                if node.parent.as_ref() == Some(parent_id) {
                    node.parent = None;
                    node.lifecycle = Lifecycle::Detached;
                }
            }
        }

        for child in &children {
            let previous = match self.nodes.resolve_mut(child.as_str()) {
                Ok(node) => {
                    node.lifecycle = Lifecycle::Attached;
                    node.parent.replace(parent_id.clone())
                }
                Err(_) => continue,
            };
            // moved here before its old parent's entry was processed (or without one)
            if let Some(previous) = previous.filter(|p| p != parent_id) {
                if let Ok(old_parent) = self.nodes.resolve_mut(previous.as_str()) {
                    old_parent.children.retain(|c| c != child);
                    changed_children.insert(previous);
                }
            }
        }
    }

    /// Destroys every connector not reachable from the root.
    ///
    /// Returns the reachable connectors, parents before children.
    fn collect_garbage(&mut self, report: &mut BatchReport) -> Vec<ConnectorId> {
        let root = match &self.root {
            Some(root) if self.nodes.contains(root.as_str()) => root.clone(),
            _ => return Vec::new(),
        };

        let mut reachable = Vec::new();
        let mut seen = HashSet::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Ok(node) = self.nodes.resolve(id.as_str()) {
                stack.extend(node.children.iter().rev().cloned());
                reachable.push(id);
            }
        }

        let unreachable: Vec<ConnectorId> = self
            .nodes
            .ids()
            .filter(|id| !seen.contains(*id))
            .cloned()
            .collect();
        for id in unreachable {
            self.destroy(&id);
            report.destroyed.push(id);
        }
        reachable
    }

    fn destroy(&mut self, id: &ConnectorId) {
        if let Some(mut node) = self.nodes.unregister(id.as_str()) {
            node.lifecycle = Lifecycle::Destroyed;
            node.connector.on_unregister();
            debug!(connector = %id, "connector destroyed");
        }
    }
}
