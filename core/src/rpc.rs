//! Remote procedure calls.
//!
//! Invocations are queued, never sent immediately, and travel inside the next transaction. On the
//! receiving side they are dispatched through explicit tables keyed by interface and method name.
//! Overloads are not supported: the wire carries no argument types, so a method is identified by
//! its name and checked against its declared arity.

use crate::codec::{decode_value, encode_value};
use crate::error::RpcError;
use crate::id::ConnectorId;
use crate::value::{TypeTag, Value};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Interface name of legacy variable changes.
pub const LEGACY_INTERFACE: &str = "v";
/// Method name of legacy variable changes.
pub const LEGACY_METHOD: &str = "v";

type WireInvocation = (ConnectorId, String, String, Vec<Json>);

/// One method call targeting a connector.
///
/// Encoded on the wire as `[connector, interface, method, [args...]]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "WireInvocation", into = "WireInvocation")]
pub struct Invocation {
    pub connector: ConnectorId,
    pub interface: String,
    pub method: String,
    pub args: Vec<Json>,
}

impl From<WireInvocation> for Invocation {
    fn from((connector, interface, method, args): WireInvocation) -> Invocation {
        Invocation {
            connector,
            interface,
            method,
            args,
        }
    }
}

impl From<Invocation> for WireInvocation {
    fn from(i: Invocation) -> WireInvocation {
        (i.connector, i.interface, i.method, i.args)
    }
}

impl Invocation {
    pub fn new(
        connector: impl Into<ConnectorId>,
        interface: impl Into<String>,
        method: impl Into<String>,
        args: Vec<Json>,
    ) -> Invocation {
        Invocation {
            connector: connector.into(),
            interface: interface.into(),
            method: method.into(),
            args,
        }
    }

    /// Builds an invocation from native values.
    pub fn with_values(
        connector: impl Into<ConnectorId>,
        interface: impl Into<String>,
        method: impl Into<String>,
        args: &[Value],
    ) -> Invocation {
        Invocation::new(connector, interface, method, args.iter().map(encode_value).collect())
    }

    /// A legacy variable change: `name = value` on a connector.
    pub fn variable(connector: impl Into<ConnectorId>, name: &str, value: &Value) -> Invocation {
        Invocation::new(
            connector,
            LEGACY_INTERFACE,
            LEGACY_METHOD,
            vec![Json::String(name.to_string()), encode_value(value)],
        )
    }

    pub fn is_variable_change(&self) -> bool {
        self.interface == LEGACY_INTERFACE && self.method == LEGACY_METHOD
    }

    /// The variable name and raw value of a legacy variable change.
    pub fn variable_parts(&self) -> Option<(&str, &Json)> {
        if !self.is_variable_change() || self.args.len() != 2 {
            return None;
        }
        Some((self.args[0].as_str()?, &self.args[1]))
    }
}

/// Outgoing invocations waiting for the next transaction.
#[derive(Debug, Default)]
pub struct RpcQueue {
    pending: Vec<Invocation>,
}

impl RpcQueue {
    pub fn new() -> RpcQueue {
        RpcQueue::default()
    }

    /// Appends an invocation. Regular calls are never coalesced.
    pub fn push(&mut self, invocation: Invocation) {
        self.pending.push(invocation);
    }

    /// Queues a legacy variable change, dropping any pending change of the same variable.
    pub fn set_variable(&mut self, connector: &ConnectorId, name: &str, value: &Value) {
        self.pending.retain(|i| {
            !(i.connector == *connector && i.variable_parts().map_or(false, |(n, _)| n == name))
        });
        self.pending.push(Invocation::variable(connector.clone(), name, value));
    }

    /// Puts invocations taken by a send that failed back in front of the queue.
    ///
    /// A variable change queued again since then keeps its newer value.
    pub fn requeue_front(&mut self, invocations: Vec<Invocation>) {
        let mut requeued: Vec<Invocation> = invocations
            .into_iter()
            .filter(|old| match old.variable_parts() {
                Some((name, _)) => !self.pending.iter().any(|i| {
                    i.connector == old.connector && i.variable_parts().map_or(false, |(n, _)| n == name)
                }),
                None => true,
            })
            .collect();
        requeued.append(&mut self.pending);
        self.pending = requeued;
    }

    pub fn drain(&mut self) -> Vec<Invocation> {
        std::mem::take(&mut self.pending)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Invocation> {
        self.pending.iter()
    }
}

/// An incoming call after legacy variable changes have been merged.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Rpc(Invocation),
    Variables {
        connector: ConnectorId,
        changes: BTreeMap<String, Json>,
    },
}

impl Incoming {
    pub fn connector(&self) -> &ConnectorId {
        match self {
            Incoming::Rpc(i) => &i.connector,
            Incoming::Variables { connector, .. } => connector,
        }
    }
}

/// Merges consecutive legacy variable changes for the same connector.
///
/// Within one merged group only the last value of each variable survives; every other
/// invocation keeps its position.
pub fn merge_variable_changes(invocations: Vec<Invocation>) -> Vec<Incoming> {
    let mut merged: Vec<Incoming> = Vec::with_capacity(invocations.len());
    for invocation in invocations {
        let (name, value) = match invocation.variable_parts() {
            Some((name, value)) => (name.to_string(), value.clone()),
            None => {
                if invocation.is_variable_change() {
                    debug!(connector = %invocation.connector, "dropping malformed variable change");
                } else {
                    merged.push(Incoming::Rpc(invocation));
                }
                continue;
            }
        };

        if let Some(Incoming::Variables { connector, changes }) = merged.last_mut() {
            if *connector == invocation.connector {
                changes.insert(name, value);
                continue;
            }
        }
        let mut changes = BTreeMap::new();
        changes.insert(name, value);
        merged.push(Incoming::Variables {
            connector: invocation.connector,
            changes,
        });
    }
    merged
}

type MethodFn<T> = dyn Fn(&mut T, &[Value]) -> Result<(), RpcError> + Send + Sync;

struct Method<T: ?Sized> {
    params: &'static [TypeTag],
    call: Box<MethodFn<T>>,
}

/// A dispatch table for one RPC interface.
///
/// `T` is whatever the methods act on: a server-side component or a client-side connector.
pub struct RpcInterface<T: ?Sized> {
    name: String,
    methods: HashMap<&'static str, Method<T>>,
}

impl<T: ?Sized> RpcInterface<T> {
    pub fn new(name: impl Into<String>) -> RpcInterface<T> {
        RpcInterface {
            name: name.into(),
            methods: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds a method. Arguments are coerced to `params` before `call` runs.
    pub fn method<F>(
        mut self,
        name: &'static str,
        params: &'static [TypeTag],
        call: F,
    ) -> Result<RpcInterface<T>, RpcError>
    where
        F: Fn(&mut T, &[Value]) -> Result<(), RpcError> + Send + Sync + 'static,
    {
        if self.methods.contains_key(name) {
            return Err(RpcError::DuplicateMethod {
                interface: self.name,
                method: name.to_string(),
            });
        }
        self.methods.insert(
            name,
            Method {
                params,
                call: Box::new(call),
            },
        );
        Ok(self)
    }

    pub fn invoke(&self, target: &mut T, invocation: &Invocation) -> Result<(), RpcError> {
        let method = self
            .methods
            .get(invocation.method.as_str())
            .ok_or_else(|| RpcError::NoMethod {
                interface: self.name.clone(),
                method: invocation.method.clone(),
            })?;

        if method.params.len() != invocation.args.len() {
            return Err(RpcError::Arity {
                method: invocation.method.clone(),
                expected: method.params.len(),
                actual: invocation.args.len(),
            });
        }

        let args = method
            .params
            .iter()
            .zip(&invocation.args)
            .enumerate()
            .map(|(index, (ty, json))| {
                decode_value(ty, json).map_err(|reason| RpcError::Coercion {
                    method: invocation.method.clone(),
                    index,
                    reason,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        (method.call)(target, &args)
    }
}

/// The RPC interfaces registered on one connector.
pub struct RpcRegistry<T: ?Sized> {
    interfaces: HashMap<String, Arc<RpcInterface<T>>>,
}

impl<T: ?Sized> Default for RpcRegistry<T> {
    fn default() -> Self {
        RpcRegistry {
            interfaces: HashMap::new(),
        }
    }
}

impl<T: ?Sized> RpcRegistry<T> {
    pub fn new() -> RpcRegistry<T> {
        RpcRegistry::default()
    }

    /// Registers a handler for an interface, replacing any previous one.
    pub fn register(&mut self, interface: RpcInterface<T>) {
        if self.interfaces.contains_key(interface.name()) {
            debug!(interface = interface.name(), "replacing rpc handler");
        }
        self.interfaces
            .insert(interface.name().to_string(), Arc::new(interface));
    }

    pub fn get(&self, interface: &str) -> Option<Arc<RpcInterface<T>>> {
        self.interfaces.get(interface).cloned()
    }

    pub fn contains(&self, interface: &str) -> bool {
        self.interfaces.contains_key(interface)
    }

    /// Looks up the handler and invokes it on `target`.
    pub fn dispatch(&self, target: &mut T, invocation: &Invocation) -> Result<(), RpcError> {
        let interface = self.get(&invocation.interface).ok_or_else(|| RpcError::NoHandler {
            connector: invocation.connector.clone(),
            interface: invocation.interface.clone(),
        })?;
        interface.invoke(target, invocation)
    }
}
