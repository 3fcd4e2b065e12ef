//! Errors.

use crate::id::ConnectorId;
use thiserror::Error;

/// Errors raised while synchronizing connectors between the two sides.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A message referred to a connector that is not registered (anymore).
    #[error("no connector with id {0}")]
    BrokenConnectorReference(ConnectorId),

    #[error("a connector with id {0} is already registered")]
    DuplicateConnector(ConnectorId),

    /// A transaction arrived out of sequence.
    #[error("expected message {expected}, got {actual}")]
    SequenceMismatch { expected: u64, actual: u64 },

    #[error("session expired")]
    SessionExpired,

    /// The payload could not be decoded.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("rpc dispatch failed: {0}")]
    RpcDispatch(#[from] RpcError),

    #[error("field {field} expects {expected}")]
    TypeMismatch { field: String, expected: String },

    #[error("{schema} has no field {field}")]
    UnknownField { schema: &'static str, field: String },

    /// A hierarchy change would make a connector its own ancestor.
    #[error("{child} cannot be a child of {parent}")]
    HierarchyCycle { parent: ConnectorId, child: ConnectorId },

    #[error("timed out waiting for the session lock")]
    LockTimeout,

    #[error("invalid security key")]
    InvalidSecurityKey,
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::MalformedMessage(err.to_string())
    }
}

impl SyncError {
    /// True for errors that must abort the whole transaction.
    ///
    /// Everything else is contained at the connector or invocation level.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::SequenceMismatch { .. }
                | SyncError::SessionExpired
                | SyncError::MalformedMessage(_)
                | SyncError::LockTimeout
                | SyncError::InvalidSecurityKey
        )
    }
}

/// Failures while dispatching one invocation.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("no handler for {interface} on connector {connector}")]
    NoHandler {
        connector: ConnectorId,
        interface: String,
    },

    #[error("{interface} has no method {method}")]
    NoMethod { interface: String, method: String },

    #[error("{method} takes {expected} arguments, got {actual}")]
    Arity {
        method: String,
        expected: usize,
        actual: usize,
    },

    #[error("argument {index} of {method}: {reason}")]
    Coercion {
        method: String,
        index: usize,
        reason: String,
    },

    #[error("{interface} declares {method} twice")]
    DuplicateMethod { interface: String, method: String },

    #[error("connector {0} does not accept variable changes")]
    NotVariableOwner(ConnectorId),

    /// The handler itself failed.
    #[error("{0}")]
    Handler(String),
}
