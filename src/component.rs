//! Server-side connectors.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use vireo_core::rpc::{RpcInterface, RpcQueue, RpcRegistry};
use vireo_core::state::{Schema, State};
use vireo_core::{ConnectorId, Invocation, RpcError, SyncError, Value};

/// Receives merged legacy variable changes.
pub type VariableHandler =
    Arc<dyn Fn(&mut ServerConnector, &BTreeMap<String, Value>) -> Result<(), RpcError> + Send + Sync>;

/// The server half of a connector.
///
/// Owns the authoritative shared state. Every mutable access to the state marks the connector
/// dirty; whether anything is actually sent is decided by diffing at the end of the transaction.
pub struct ServerConnector {
    id: ConnectorId,
    type_name: &'static str,
    state: State,
    pub(crate) parent: Option<ConnectorId>,
    pub(crate) children: Vec<ConnectorId>,
    pub(crate) dirty: bool,
    client_rpc: RpcQueue,
    rpc: RpcRegistry<ServerConnector>,
    variables: Option<VariableHandler>,
}

impl ServerConnector {
    pub(crate) fn new(id: ConnectorId, type_name: &'static str, schema: &'static Schema) -> ServerConnector {
        ServerConnector {
            id,
            type_name,
            state: State::new(schema),
            parent: None,
            children: Vec::new(),
            dirty: true,
            client_rpc: RpcQueue::new(),
            rpc: RpcRegistry::new(),
            variables: None,
        }
    }

    pub fn id(&self) -> &ConnectorId {
        &self.id
    }

    /// The connector type the client instantiates.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut State {
        self.dirty = true;
        &mut self.state
    }

    /// Sets one state field.
    pub fn set(&mut self, field: &str, value: impl Into<Value>) -> Result<(), SyncError> {
        self.state_mut().set(field, value)
    }

    pub fn parent(&self) -> Option<&ConnectorId> {
        self.parent.as_ref()
    }

    pub fn children(&self) -> &[ConnectorId] {
        &self.children
    }

    /// The connector's own `enabled` flag; ancestors are not considered.
    pub fn is_enabled_self(&self) -> bool {
        self.state.get_bool("enabled").unwrap_or(true)
    }

    /// Queues a ClientRpc invocation for the next response.
    pub fn call_client(&mut self, interface: &str, method: &str, args: &[Value]) {
        self.client_rpc
            .push(Invocation::with_values(self.id.clone(), interface, method, args));
    }

    pub(crate) fn has_pending_rpc(&self) -> bool {
        !self.client_rpc.is_empty()
    }

    pub(crate) fn drain_client_rpc(&mut self) -> Vec<Invocation> {
        self.client_rpc.drain()
    }

    /// Puts invocations from an undelivered message back ahead of anything queued since.
    pub(crate) fn restore_client_rpc(&mut self, invocations: Vec<Invocation>) {
        self.client_rpc.requeue_front(invocations);
    }

    /// Registers a ServerRpc handler.
    pub fn register_rpc(&mut self, interface: RpcInterface<ServerConnector>) {
        self.rpc.register(interface);
    }

    /// Sets the handler for legacy variable changes.
    pub fn on_variables<F>(&mut self, handler: F)
    where
        F: Fn(&mut ServerConnector, &BTreeMap<String, Value>) -> Result<(), RpcError> + Send + Sync + 'static,
    {
        self.variables = Some(Arc::new(handler));
    }

    /// Runs a ServerRpc invocation against this connector.
    pub fn dispatch(&mut self, invocation: &Invocation) -> Result<(), RpcError> {
        let interface = self
            .rpc
            .get(&invocation.interface)
            .ok_or_else(|| RpcError::NoHandler {
                connector: self.id.clone(),
                interface: invocation.interface.clone(),
            })?;
        interface.invoke(self, invocation)
    }

    /// Delivers merged legacy variable changes.
    pub fn change_variables(&mut self, changes: &BTreeMap<String, Value>) -> Result<(), RpcError> {
        let handler = self
            .variables
            .clone()
            .ok_or_else(|| RpcError::NotVariableOwner(self.id.clone()))?;
        handler(self, changes)
    }
}

impl fmt::Debug for ServerConnector {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ServerConnector")
            .field("id", &self.id)
            .field("type_name", &self.type_name)
            .field("parent", &self.parent)
            .field("children", &self.children)
            .field("state", &self.state)
            .finish()
    }
}
