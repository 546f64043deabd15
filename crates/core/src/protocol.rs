//! Consumer wire protocol
//!
//! Every frame is a JSON envelope `{"type": ..., "data": ...}`.

use serde::{Deserialize, Serialize};

use crate::errors::{ProtocolError, ProtocolResult};
use crate::{HistorySample, InstrumentUpdate, Snapshot};

/// Router -> consumer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Sent exactly once, right after connecting
    Init(Snapshot),
    /// One per processed tick batch
    Update(Vec<InstrumentUpdate>),
    /// Reply to a `getDataSet` request
    Dataset {
        name: String,
        dataset: Vec<HistorySample>,
    },
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Init(_) => "init",
            ServerMessage::Update(_) => "update",
            ServerMessage::Dataset { .. } => "dataset",
        }
    }

    pub fn to_json(&self) -> ProtocolResult<String> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }
}

/// Consumer -> router
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientMessage {
    #[serde(rename = "getDataSet")]
    GetDataSet(String),
    #[serde(rename = "close", alias = "CLOSE_PORT")]
    Close,
}

impl ClientMessage {
    pub fn parse(text: &str) -> ProtocolResult<Self> {
        serde_json::from_str(text).map_err(ProtocolError::Decode)
    }

    pub fn to_json(&self) -> ProtocolResult<String> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }
}
