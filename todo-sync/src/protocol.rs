//! JSON wire envelope shared by server and client.
//!
//! Frame layout:
//! ```text
//! request   { "id": "<correlation id>", "type": "saveItem", "data": {...} }
//! response  { "id": "<same id>",        "type": "response", "data": {...} }
//! error     { "id": "<same id>",        "type": "error",
//!             "error": { "message": "...", "code": 20 } }
//! broadcast { "id": "<fresh uuid>",     "type": "saveItem", "data": {...} }
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorCode, SyncError};
use crate::model::{ItemDraft, ItemId};

pub const TYPE_RESPONSE: &str = "response";
pub const TYPE_ERROR: &str = "error";
pub const TYPE_CREATE_LIST: &str = "createList";
pub const TYPE_GET_LIST: &str = "getList";
pub const TYPE_SAVE_ITEM: &str = "saveItem";
pub const TYPE_DELETE_ITEM: &str = "deleteItem";

/// Request kinds the router dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    CreateList,
    GetList,
    SaveItem,
    DeleteItem,
}

impl RequestKind {
    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            TYPE_CREATE_LIST => Some(Self::CreateList),
            TYPE_GET_LIST => Some(Self::GetList),
            TYPE_SAVE_ITEM => Some(Self::SaveItem),
            TYPE_DELETE_ITEM => Some(Self::DeleteItem),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateList => TYPE_CREATE_LIST,
            Self::GetList => TYPE_GET_LIST,
            Self::SaveItem => TYPE_SAVE_ITEM,
            Self::DeleteItem => TYPE_DELETE_ITEM,
        }
    }
}

/// A frame received from a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundFrame {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl InboundFrame {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    /// Parse `data` into a typed payload.
    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, SyncError> {
        serde_json::from_value(self.data.clone()).map_err(|e| {
            SyncError::InvalidRequest(format!("malformed {} payload: {e}", self.kind))
        })
    }
}

/// Error details of an error frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
    pub code: ErrorCode,
}

impl std::fmt::Display for ErrorBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// A frame sent to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundFrame {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl OutboundFrame {
    /// A reply echoing the request's correlation id.
    pub fn response(id: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            kind: TYPE_RESPONSE.to_string(),
            data: Some(data),
            error: None,
        }
    }

    /// A server-initiated frame with a fresh id.
    pub fn broadcast(kind: &str, data: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: kind.to_string(),
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: impl Into<String>, message: impl Into<String>, code: ErrorCode) -> Self {
        Self {
            id: id.into(),
            kind: TYPE_ERROR.to_string(),
            data: None,
            error: Some(ErrorBody {
                message: message.into(),
                code,
            }),
        }
    }

    pub fn is_error(&self) -> bool {
        self.kind == TYPE_ERROR
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// `getList` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetListRequest {
    pub uuid: Uuid,
}

/// `saveItem` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveItemRequest {
    pub uuid: Uuid,
    #[serde(default)]
    pub item: ItemDraft,
    #[serde(default)]
    pub index: Option<i64>,
}

/// Item reference inside a `deleteItem` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemRef {
    pub id: ItemId,
}

/// `deleteItem` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteItemRequest {
    pub uuid: Uuid,
    pub item: ItemRef,
}

/// `createList` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateListResponse {
    pub id: Uuid,
}

/// `saveItem` / `deleteItem` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemAck {
    pub status: String,
    pub id: ItemId,
}

impl ItemAck {
    pub fn ok(id: ItemId) -> Self {
        Self {
            status: "ok".to_string(),
            id,
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
}
