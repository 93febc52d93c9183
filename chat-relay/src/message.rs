use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

/// One chat line as it travels between clients and the relay.
///
/// The serialized field names (`time`, `nick`, `text`) are the wire contract
/// shared by every client and server, so they must not change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    time: DateTime<Utc>,
    nick: String,
    text: String,
}

impl ChatMessage {
    /// Stamps a new message with the current time.
    pub fn new(nick: impl Into<String>, text: impl Into<String>) -> Self {
        Self::with_time(Utc::now(), nick, text)
    }

    pub fn with_time(time: DateTime<Utc>, nick: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            time,
            nick: nick.into(),
            text: text.into(),
        }
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    pub fn nick(&self) -> &str {
        &self.nick
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

pub fn encode(message: &ChatMessage) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(message)
}

/// Same as [`encode`], for transports that carry text frames.
pub fn encode_text(message: &ChatMessage) -> serde_json::Result<String> {
    serde_json::to_string(message)
}

pub fn decode(bytes: &[u8]) -> Result<ChatMessage, DecodeError> {
    let message: ChatMessage = serde_json::from_slice(bytes).map_err(|err| {
        if err.is_eof() {
            DecodeError::Truncated(err)
        } else {
            DecodeError::Invalid(err)
        }
    })?;

    if message.nick.trim().is_empty() {
        return Err(DecodeError::EmptyNick);
    }

    Ok(message)
}
