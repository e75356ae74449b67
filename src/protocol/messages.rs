//! JSON message envelope carried in publish payloads
//!
//! Publishers wrap their text as `{"message", "timestamp", "clientId"}`.
//! Receivers must cope with anything else on the topic, so parsing never
//! fails loudly: a payload that is not an envelope is simply raw text.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Envelope published by this connector
///
/// # Examples
/// ```
/// use mqtt_connector::protocol::MessageEnvelope;
///
/// let envelope = MessageEnvelope::new("hello", Some("client-1".to_string()));
/// let json = envelope.to_json().unwrap();
/// assert!(json.contains("\"clientId\":\"client-1\""));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageEnvelope {
    pub message: String,
    /// RFC 3339 UTC timestamp
    pub timestamp: String,
    #[serde(rename = "clientId", skip_serializing_if = "Option::is_none", default)]
    pub client_id: Option<String>,
}

impl MessageEnvelope {
    /// Stamp `message` with the current time
    pub fn new(message: impl Into<String>, client_id: Option<String>) -> Self {
        Self {
            message: message.into(),
            timestamp: now_timestamp(),
            client_id,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Text and timestamp extracted from a valid envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMessage {
    pub message: String,
    pub timestamp: String,
}

/// Parse a payload as an envelope.
///
/// Valid only for a JSON object whose `message` is a non-empty string. A
/// missing, empty or non-string `timestamp` is replaced with the current time.
pub fn parse_message(payload: &str) -> Option<ParsedMessage> {
    let value: Value = serde_json::from_str(payload).ok()?;
    let message = value
        .get("message")
        .and_then(Value::as_str)
        .filter(|text| !text.is_empty())?
        .to_string();
    let timestamp = value
        .get("timestamp")
        .and_then(Value::as_str)
        .filter(|ts| !ts.is_empty())
        .map(str::to_string)
        .unwrap_or_else(now_timestamp);

    Some(ParsedMessage { message, timestamp })
}

/// Message texts of the payloads that parse as envelopes, order preserved
pub fn filter_valid_messages(payloads: &[String]) -> Vec<String> {
    payloads
        .iter()
        .filter_map(|payload| parse_message(payload))
        .map(|parsed| parsed.message)
        .collect()
}

/// A payload as a consumer should render it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedPayload {
    Envelope(ParsedMessage),
    /// Anything that is not an envelope, passed through untouched
    Raw(String),
}

impl ParsedPayload {
    pub fn from_payload(payload: &str) -> Self {
        match parse_message(payload) {
            Some(parsed) => ParsedPayload::Envelope(parsed),
            None => ParsedPayload::Raw(payload.to_string()),
        }
    }

    /// Display text: the envelope's message, or the raw payload
    pub fn text(&self) -> &str {
        match self {
            ParsedPayload::Envelope(parsed) => &parsed.message,
            ParsedPayload::Raw(raw) => raw,
        }
    }
}

fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
