//! Mapping between application messages and wire messages.
//!
//! Identity and correlation travel as message properties. Custom headers are
//! written as individual string properties whose (escaped) keys are listed,
//! `|`-separated, under [`HEADER_KEYS`] so the receiver can rebuild them in
//! their original order.

use crate::message::{
    DeliveryMode, Destination, HeaderInfo, MessageId, MessageIntent, QueueMessage,
    TransportMessage,
};
use bytes::Bytes;
use tracing::warn;

pub const HEADER_RETURN_ADDRESS: &str = "ReturnAddress";
pub const HEADER_ID_FOR_CORRELATION: &str = "CorrId";
pub const HEADER_SENDER_IDENTITY: &str = "WinIdName";
pub const HEADER_MESSAGE_INTENT: &str = "MessageIntent";
pub const HEADER_KEYS: &str = "NSBKeys";
pub const HEADER_FAILED_QUEUE: &str = "FailedQ";
pub const HEADER_ORIGINAL_ID: &str = "OriginalId";

const KEY_SEPARATOR: char = '|';

/// Property names may not contain dots.
pub fn escape_header_key(key: &str) -> String {
    key.replace('.', "_")
}

pub fn unescape_header_key(key: &str) -> String {
    key.replace('_', ".")
}

fn wrap_keys<'a>(keys: impl Iterator<Item = &'a str>) -> String {
    keys.collect::<Vec<_>>().join(&KEY_SEPARATOR.to_string())
}

fn unwrap_keys(keys: &str) -> impl Iterator<Item = &str> {
    keys.split(KEY_SEPARATOR).filter(|k| !k.is_empty())
}

/// Build the wire message for `message`, carrying the already encoded `body`
pub fn to_queue_message(message: &TransportMessage, body: Bytes) -> QueueMessage {
    let mut wire = QueueMessage::new(body);
    wire.correlation_id = message.correlation_id.clone();
    wire.delivery_mode = if message.recoverable {
        DeliveryMode::Persistent
    } else {
        DeliveryMode::NonPersistent
    };

    if let Some(value) = &message.return_address {
        wire.set_string_property(HEADER_RETURN_ADDRESS, value.as_str());
    }
    if let Some(value) = &message.id_for_correlation {
        wire.set_string_property(HEADER_ID_FOR_CORRELATION, value.as_str());
    }
    if let Some(value) = &message.sender_identity {
        wire.set_string_property(HEADER_SENDER_IDENTITY, value.as_str());
    }
    wire.set_int_property(HEADER_MESSAGE_INTENT, message.intent as i32);

    let escaped: Vec<String> = message
        .headers
        .iter()
        .map(|header| escape_header_key(&header.key))
        .collect();
    for (key, header) in escaped.iter().zip(&message.headers) {
        if let Some(value) = &header.value {
            wire.set_string_property(key.as_str(), value.as_str());
        }
    }
    wire.set_string_property(HEADER_KEYS, wrap_keys(escaped.iter().map(String::as_str)));

    wire
}

/// Rebuild the application view of a received wire message.
///
/// The body is left for the caller to deserialize; the id is the message's
/// logical identity (see [`real_message_id`]).
pub fn from_queue_message(message: &QueueMessage) -> TransportMessage {
    let intent = match message.int_property(HEADER_MESSAGE_INTENT) {
        Some(value) => MessageIntent::try_from(value).unwrap_or_else(|e| {
            warn!(error = %e, "Unknown message intent; treating it as a send");
            MessageIntent::Send
        }),
        None => MessageIntent::default(),
    };

    let headers = message
        .string_property(HEADER_KEYS)
        .map(|keys| {
            unwrap_keys(keys)
                .map(|key| HeaderInfo {
                    key: unescape_header_key(key),
                    value: message.string_property(key).map(str::to_string),
                })
                .collect()
        })
        .unwrap_or_default();

    TransportMessage {
        id: real_message_id(message),
        correlation_id: message.correlation_id.clone(),
        return_address: message
            .string_property(HEADER_RETURN_ADDRESS)
            .map(str::to_string),
        id_for_correlation: message
            .string_property(HEADER_ID_FOR_CORRELATION)
            .map(str::to_string),
        sender_identity: message
            .string_property(HEADER_SENDER_IDENTITY)
            .map(str::to_string),
        intent,
        recoverable: message.delivery_mode == DeliveryMode::Persistent,
        time_sent: message.timestamp,
        headers,
        body: None,
        raw_body: None,
    }
}

/// Stable identity of a message across redeliveries: the original-id marker
/// when present, otherwise the broker-assigned id.
pub fn real_message_id(message: &QueueMessage) -> Option<MessageId> {
    match message.string_property(HEADER_ORIGINAL_ID) {
        Some(original) if !original.is_empty() => original.parse().ok(),
        _ => message.id.clone(),
    }
}

/// Copy of a failed message addressed to the error queue.
///
/// Body, correlation, identity properties and every custom header are kept;
/// `FailedQ` records where the message failed and `OriginalId` its logical
/// identity so that tracking survives the hop.
pub fn error_queue_message(failed: &QueueMessage, input: &Destination) -> QueueMessage {
    let mut message = QueueMessage::new(failed.body.clone());
    message.correlation_id = failed.correlation_id.clone();
    message.delivery_mode = failed.delivery_mode;

    for key in [
        HEADER_RETURN_ADDRESS,
        HEADER_ID_FOR_CORRELATION,
        HEADER_SENDER_IDENTITY,
        HEADER_MESSAGE_INTENT,
        HEADER_KEYS,
    ] {
        message.copy_property(key, failed);
    }
    if let Some(keys) = failed.string_property(HEADER_KEYS) {
        for key in unwrap_keys(keys) {
            message.copy_property(key, failed);
        }
    }

    message.set_string_property(HEADER_FAILED_QUEUE, input.to_string());
    if let Some(id) = real_message_id(failed) {
        message.set_string_property(HEADER_ORIGINAL_ID, id.as_str());
    }

    message
}

/// Copy of a received message for the forwarding destination.
///
/// Every property is kept and the logical identity is pinned in `OriginalId`.
pub fn forwarded_message(received: &QueueMessage) -> QueueMessage {
    let mut message = received.clone();
    message.id = None;
    message.timestamp = None;
    if let Some(id) = real_message_id(received) {
        message.set_string_property(HEADER_ORIGINAL_ID, id.as_str());
    }
    message
}

#[cfg(test)]
#[path = "codec_tests.rs"]
mod tests;
