//! Traits for client-side widget connectors.

use crate::error::RpcError;
use crate::id::ConnectorId;
use crate::rpc::Invocation;
use crate::state::{Schema, State};
use std::collections::HashMap;
use std::fmt;

/// The client half of a connector: a widget plus the hooks the connector tree drives.
///
/// All hooks run after the whole transaction has been reconciled, so a connector always sees a
/// consistent tree.
pub trait Connector {
    /// Called exactly once, after the connector's first state and hierarchy have been applied.
    fn init(&mut self, _id: &ConnectorId) {}

    /// Called when any subset of the state fields changed, with the changed field names.
    fn on_state_changed(&mut self, _state: &State, _changed: &[String]) {}

    /// Called when the ordered child list changed.
    fn on_children_changed(&mut self, _children: &[ConnectorId]) {}

    /// Called once when the connector is destroyed.
    fn on_unregister(&mut self) {}

    /// Handles a ClientRpc invocation.
    fn handle_rpc(&mut self, invocation: &Invocation) -> Result<(), RpcError> {
        Err(RpcError::NoHandler {
            connector: invocation.connector.clone(),
            interface: invocation.interface.clone(),
        })
    }
}

type Factory = Box<dyn Fn(&ConnectorId) -> Box<dyn Connector>>;

struct WidgetType {
    schema: &'static Schema,
    factory: Factory,
}

/// Maps connector type names to their state schema and a constructor.
///
/// Passed to the client explicitly; there is no global widget registry.
#[derive(Default)]
pub struct WidgetSet {
    types: HashMap<String, WidgetType>,
}

impl WidgetSet {
    pub fn new() -> WidgetSet {
        WidgetSet::default()
    }

    /// Registers a connector type, replacing any previous registration.
    pub fn register<F>(&mut self, type_name: impl Into<String>, schema: &'static Schema, factory: F)
    where
        F: Fn(&ConnectorId) -> Box<dyn Connector> + 'static,
    {
        self.types.insert(
            type_name.into(),
            WidgetType {
                schema,
                factory: Box::new(factory),
            },
        );
    }

    pub fn schema(&self, type_name: &str) -> Option<&'static Schema> {
        self.types.get(type_name).map(|t| t.schema)
    }

    /// Instantiates a connector of the given type.
    pub fn create(&self, type_name: &str, id: &ConnectorId) -> Option<(Box<dyn Connector>, &'static Schema)> {
        let widget_type = self.types.get(type_name)?;
        Some(((widget_type.factory)(id), widget_type.schema))
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.types.contains_key(type_name)
    }
}

impl fmt::Debug for WidgetSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_set().entries(self.types.keys()).finish()
    }
}
