//! Message types: destinations, wire messages and application messages.

use crate::error::{ConfigurationError, ValidationError};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

// ============================================================================
// Destination
// ============================================================================

/// Address of a remote queue: the queue name plus the coordinates of the
/// queue manager hosting it.
///
/// Parsed from `QUEUE@MANAGER/HOST/PORT[/CHANNEL]`, upper-cased. Equality and
/// hashing cover every field so a destination can key the pool registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    queue: String,
    manager: String,
    host: String,
    port: u16,
    channel: String,
}

impl Destination {
    pub fn new(
        queue: impl Into<String>,
        manager: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        channel: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let queue = queue.into().to_uppercase();
        let host = host.into().to_uppercase();

        if queue.is_empty() {
            return Err(ValidationError::Required {
                field: "queue".to_string(),
            });
        }
        if host.is_empty() {
            return Err(ValidationError::Required {
                field: "host".to_string(),
            });
        }

        Ok(Self {
            queue,
            manager: manager.into().to_uppercase(),
            host,
            port,
            channel: channel.into().to_uppercase(),
        })
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn manager(&self) -> &str {
        &self.manager
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Connection coordinates in `HOST(PORT)` form
    pub fn connection_name(&self) -> String {
        format!("{}({})", self.host, self.port)
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}@{}/{}/{}",
            self.queue, self.manager, self.host, self.port
        )?;
        if !self.channel.is_empty() {
            write!(f, "/{}", self.channel)?;
        }
        Ok(())
    }
}

impl FromStr for Destination {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |message: &str| ConfigurationError::Invalid {
            message: format!("destination '{}' {}", s, message),
        };

        let normalized = s.trim().to_uppercase();
        let (queue, location) = normalized
            .split_once('@')
            .ok_or_else(|| invalid("must have the form QUEUE@MANAGER/HOST/PORT[/CHANNEL]"))?;

        let parts: Vec<&str> = location.split('/').collect();
        if parts.len() < 3 || parts.len() > 4 {
            return Err(invalid(
                "must have the form QUEUE@MANAGER/HOST/PORT[/CHANNEL]",
            ));
        }

        let port = parts[2]
            .parse::<u16>()
            .map_err(|_| invalid("has a port that is not a number between 0 and 65535"))?;
        let channel = parts.get(3).copied().unwrap_or_default();

        Destination::new(queue, parts[0], parts[1], port, channel)
            .map_err(|e| invalid(&format!("is incomplete: {}", e)))
    }
}

// ============================================================================
// Identifiers
// ============================================================================

/// Identifier the broker assigns to a message when it is sent
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Generate a fresh broker-style identifier
    pub fn new() -> Self {
        Self(format!("ID:{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ValidationError::Required {
                field: "message_id".to_string(),
            });
        }

        Ok(Self(s.to_string()))
    }
}

// ============================================================================
// Wire message
// ============================================================================

/// Whether the broker must keep the message across restarts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DeliveryMode {
    #[default]
    Persistent,
    NonPersistent,
}

/// Typed message property value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyValue {
    String(String),
    Int(i32),
}

/// A message as the queue client sends and receives it.
///
/// The broker fills in `id` and `timestamp` on send.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueMessage {
    pub id: Option<MessageId>,
    pub correlation_id: Option<String>,
    pub delivery_mode: DeliveryMode,
    pub timestamp: Option<DateTime<Utc>>,
    properties: BTreeMap<String, PropertyValue>,
    pub body: Bytes,
}

impl QueueMessage {
    pub fn new(body: Bytes) -> Self {
        Self {
            body,
            ..Self::default()
        }
    }

    pub fn string_property(&self, key: &str) -> Option<&str> {
        match self.properties.get(key) {
            Some(PropertyValue::String(value)) => Some(value),
            _ => None,
        }
    }

    /// Integer property; string properties holding a number are converted
    pub fn int_property(&self, key: &str) -> Option<i32> {
        match self.properties.get(key) {
            Some(PropertyValue::Int(value)) => Some(*value),
            Some(PropertyValue::String(value)) => value.parse().ok(),
            None => None,
        }
    }

    pub fn set_string_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties
            .insert(key.into(), PropertyValue::String(value.into()));
    }

    pub fn set_int_property(&mut self, key: impl Into<String>, value: i32) {
        self.properties.insert(key.into(), PropertyValue::Int(value));
    }

    /// Copy a property of any type from another message; absent keys stay absent
    pub fn copy_property(&mut self, key: &str, from: &QueueMessage) {
        if let Some(value) = from.properties.get(key) {
            self.properties.insert(key.to_string(), value.clone());
        }
    }

    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.properties.get(key)
    }

    pub fn properties(&self) -> impl Iterator<Item = (&str, &PropertyValue)> {
        self.properties.iter().map(|(k, v)| (k.as_str(), v))
    }
}

// ============================================================================
// Application message
// ============================================================================

/// Purpose of a message in the messaging conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(i32)]
pub enum MessageIntent {
    Init = 0,
    #[default]
    Send = 1,
    Publish = 2,
    Subscribe = 3,
    Unsubscribe = 4,
    Reply = 5,
}

impl TryFrom<i32> for MessageIntent {
    type Error = ValidationError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Init),
            1 => Ok(Self::Send),
            2 => Ok(Self::Publish),
            3 => Ok(Self::Subscribe),
            4 => Ok(Self::Unsubscribe),
            5 => Ok(Self::Reply),
            other => Err(ValidationError::OutOfRange {
                field: "message_intent".to_string(),
                message: format!("unknown intent {}", other),
            }),
        }
    }
}

/// Custom application header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderInfo {
    pub key: String,
    pub value: Option<String>,
}

impl HeaderInfo {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
        }
    }
}

/// Message as the application sees it.
///
/// `body` carries the deserialized payload; `raw_body` carries the bytes when
/// deserialization is skipped or when the caller has already encoded the body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportMessage {
    pub id: Option<MessageId>,
    pub correlation_id: Option<String>,
    pub return_address: Option<String>,
    pub id_for_correlation: Option<String>,
    pub sender_identity: Option<String>,
    pub intent: MessageIntent,
    pub recoverable: bool,
    pub time_sent: Option<DateTime<Utc>>,
    pub headers: Vec<HeaderInfo>,
    pub body: Option<serde_json::Value>,
    pub raw_body: Option<Bytes>,
}

impl TransportMessage {
    pub fn new() -> Self {
        Self {
            recoverable: true,
            ..Self::default()
        }
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_raw_body(mut self, body: impl Into<Bytes>) -> Self {
        self.raw_body = Some(body.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(HeaderInfo::new(key, value));
        self
    }

    /// Value of the first header with the given key
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.key == key)
            .and_then(|h| h.value.as_deref())
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
