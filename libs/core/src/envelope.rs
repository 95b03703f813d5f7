use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::Result;

/// Message record carrying routing metadata and an opaque payload
///
/// `reply_for` is only set on responses, `recipient` only on directed
/// messages (RPC requests, responses and join replies).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Unique id, used to correlate replies
    pub id: String,

    /// Sending circuit, always set on outbound envelopes
    #[serde(default)]
    pub sender: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,

    #[serde(default)]
    pub channel: String,

    /// Channel the responder publishes its answer to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,

    /// Id of the request this envelope answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_for: Option<String>,

    /// UTC creation time in epoch milliseconds
    pub created_at: i64,

    /// RPC deadline in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_to_live: Option<u64>,

    #[serde(default)]
    pub content: Value,
}

impl Envelope {
    /// Empty envelope with a fresh id and the current timestamp
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender: String::new(),
            recipient: None,
            channel: String::new(),
            reply_to: None,
            reply_for: None,
            created_at: chrono::Utc::now().timestamp_millis(),
            time_to_live: None,
            content: Value::Null,
        }
    }

    /// Create an envelope around any serializable payload
    pub fn with_content<T: Serialize + ?Sized>(content: &T) -> Result<Self> {
        let mut envelope = Self::new();
        envelope.content = serde_json::to_value(content)?;
        Ok(envelope)
    }

    /// Decode the payload into a concrete type
    pub fn content_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(T::deserialize(&self.content)?)
    }

    /// Whether this envelope answers a request
    pub fn is_reply(&self) -> bool {
        self.reply_for.is_some()
    }
}

impl Default for Envelope {
    fn default() -> Self {
        Self::new()
    }
}
