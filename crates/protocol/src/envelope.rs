use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::constants::MessageType;

/// `error` member of a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsError {
    pub code: i32,
    pub message: String,
}

/// One frame on a tether socket, in either direction.
///
/// Replies reuse the id of the frame they answer, which is how the client
/// matches `resubscribe_ack` to its batch. The payload stays raw until the
/// receiver has looked at `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Box<RawValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WsError>,
}

fn encode<T: Serialize>(payload: Option<&T>) -> Result<Option<Box<RawValue>>, serde_json::Error> {
    payload.map(serde_json::value::to_raw_value).transpose()
}

impl Message {
    pub fn new<T: Serialize>(
        id: impl Into<String>,
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: id.into(),
            msg_type,
            payload: encode(payload)?,
            error: None,
        })
    }

    /// Unsolicited frame under a fresh v4 id.
    pub fn event<T: Serialize>(
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<Self, serde_json::Error> {
        Self::new(uuid::Uuid::new_v4().to_string(), msg_type, payload)
    }

    /// `Ok(None)` when the frame carries no payload.
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        self.payload
            .as_deref()
            .map(|raw| serde_json::from_str(raw.get()))
            .transpose()
    }

    pub fn error(id: impl Into<String>, code: i32, message: impl Into<String>) -> Self {
        let error = WsError {
            code,
            message: message.into(),
        };
        Self {
            id: id.into(),
            msg_type: MessageType::Error,
            payload: None,
            error: Some(error),
        }
    }

    pub fn reply<T: Serialize>(
        &self,
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<Self, serde_json::Error> {
        Self::new(self.id.as_str(), msg_type, payload)
    }

    pub fn reply_error(&self, code: i32, message: impl Into<String>) -> Self {
        Self::error(self.id.as_str(), code, message)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
