//! The wire envelope for one transaction in either direction.

use crate::error::SyncError;
use crate::id::ConnectorId;
use crate::rpc::Invocation;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

fn is_false(b: &bool) -> bool {
    !*b
}

/// State changes for one connector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEntry {
    pub connector: ConnectorId,
    /// Connector type; only sent the first time the client sees the connector.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    /// The encoded patch.
    pub diff: Json,
}

/// The complete, ordered child list of one connector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HierarchyEntry {
    pub connector: ConnectorId,
    pub children: Vec<ConnectorId>,
}

/// A user-facing notice (session expired, communication error, ...).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Notice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Where the client should go after showing the notice; `None` reloads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    /// The client must drop its connector tree and rebuild it from this message.
    #[serde(default, skip_serializing_if = "is_false")]
    pub repaint_all: bool,
    /// Delivered over push rather than as a response.
    #[serde(rename = "async", default, skip_serializing_if = "is_false")]
    pub is_async: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_expired: Option<Notice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_error: Option<Notice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub csrf_token: Option<String>,
    /// Seconds between heartbeats, sent with the first message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval: Option<u64>,
}

/// Server-to-client transaction.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    /// Transaction sequence number. Absent on out-of-band notices.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_id: Option<u64>,
    /// Id the server expects on the next client message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<u64>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub resynchronize: bool,
    /// Root connector; sent with initial and full-repaint messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<ConnectorId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub state: Vec<StateEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hierarchy: Vec<HierarchyEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rpc: Vec<Invocation>,
    #[serde(default)]
    pub meta: Meta,
}

impl ServerMessage {
    /// A terminal message telling the client its session is gone.
    pub fn session_expired(notice: Notice) -> ServerMessage {
        ServerMessage {
            meta: Meta {
                session_expired: Some(notice),
                ..Meta::default()
            },
            ..ServerMessage::default()
        }
    }

    /// An out-of-band error notice.
    pub fn app_error(notice: Notice) -> ServerMessage {
        ServerMessage {
            meta: Meta {
                app_error: Some(notice),
                ..Meta::default()
            },
            ..ServerMessage::default()
        }
    }

    /// True if the message carries no connector changes.
    pub fn has_changes(&self) -> bool {
        !(self.state.is_empty() && self.hierarchy.is_empty() && self.rpc.is_empty())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, SyncError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<ServerMessage, SyncError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Client-to-server transaction.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMessage {
    #[serde(default)]
    pub csrf_token: String,
    /// Last server sync id the client had applied when sending.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_id: Option<u64>,
    pub client_id: u64,
    #[serde(default, skip_serializing_if = "is_false")]
    pub resynchronize: bool,
    #[serde(default)]
    pub rpc: Vec<Invocation>,
}

impl ClientMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>, SyncError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<ClientMessage, SyncError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
