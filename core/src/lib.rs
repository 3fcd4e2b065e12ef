//! Connector synchronization core.
//!
//! # Conceptual overview
//! Vireo keeps a tree of server-side components and a tree of client-side widgets in sync.
//! Each component is paired with a widget through a *connector*: an id, a shared state record,
//! a position in the hierarchy and two RPC channels (ServerRpc, client to server; ClientRpc,
//! server to client).
//!
//! ## Shared state
//! State records are plain data described by a static [`Schema`] (see [`shared_state!`]). Only
//! the owning side (the server) mutates them. At the end of every transaction the server diffs
//! each dirty state against what the client last saw and sends the resulting [`Patch`]; the
//! client applies it to its mirrored copy and tells the widget which fields changed.
//!
//! ## Transactions
//! All traffic is batched into transactions. One server message carries state diffs, hierarchy
//! changes and ClientRpc invocations, tagged with a sync id; one client message carries queued
//! ServerRpc invocations and legacy variable changes, tagged with a client id. Both ids are
//! strictly sequential, and each side rejects, buffers or resynchronizes on anything else.
//!
//! ## Connector tree
//! The client applies a server message as a single batch (see [`ConnectorTree`]), so a connector
//! that moves from one parent to another is reparented rather than destroyed and recreated.
//! Connectors left unreachable from the root at the end of the batch are destroyed.
//!
//! ## Wire format
//! Messages are JSON. The wire carries no type information; values are decoded against the
//! schema of the receiving state or the signature of the receiving RPC method.

pub mod backend;
pub mod client;
pub mod codec;
pub mod connector_tree;
pub mod diff;
pub mod error;
pub mod id;
pub mod message;
pub mod rpc;
#[macro_use]
pub mod state;
pub mod value;

pub use backend::{Connector, WidgetSet};
pub use client::{ClientConfig, ClientConnection, Delivery};
pub use connector_tree::{ConnectorTree, Lifecycle};
pub use diff::{apply, diff, diff_from_defaults, Patch};
pub use error::{RpcError, SyncError};
pub use id::{ConnectorId, ConnectorRegistry, IdAllocator};
pub use message::{ClientMessage, HierarchyEntry, Notice, ServerMessage, StateEntry};
pub use rpc::{Invocation, RpcInterface, RpcQueue, RpcRegistry};
pub use state::{Schema, State, COMPONENT_STATE};
pub use value::{TypeTag, Value};
