// Copyright (c) 2026, The AmqpBus Authors
// MIT License
// All rights reserved.

//! # Message Model
//!
//! Payload typing and the inbound envelope. Every payload carries a kind tag
//! in the AMQP message properties; its ancestor kinds travel in a header so
//! the receiving side can resolve hierarchy subscriptions without any shared
//! type registry between processes.

use crate::errors::BusError;
use crate::options::ReaderLimits;
use lapin::message::Delivery;
use lapin::types::{AMQPValue, FieldTable};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

/// Header carrying the payload's ancestor kinds, nearest first, separated by
/// spaces.
pub const KIND_LINEAGE_HEADER: &str = "x-kind-lineage";

/// A typed bus payload.
///
/// `KIND` is the wire tag stamped into the message properties. `lineage`
/// lists the kinds this payload may also be handled as, nearest ancestor
/// first; hierarchy subscriptions on any of those kinds receive the message.
pub trait Payload: Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: &'static str;

    fn lineage() -> &'static [&'static str] {
        &[]
    }
}

/// Raw inbound message, consumed exactly once by the dispatch engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEnvelope {
    /// Undecoded message body
    pub data: Vec<u8>,
    /// Kind declared by the publisher, absent for foreign messages
    pub kind: Option<String>,
    /// Ancestor kinds declared by the publisher, nearest first
    pub lineage: Vec<String>,
    /// Routing key the broker delivered the message with
    pub routing_key: String,
    /// Broker delivery tag
    pub delivery_tag: u64,
    /// Queue to reply to, when the sender expects an answer
    pub reply_to: Option<String>,
    /// Correlation id to stamp onto the reply
    pub correlation_id: Option<String>,
}

impl InboundEnvelope {
    pub(crate) fn from_delivery(delivery: &Delivery) -> Self {
        let kind = match delivery.properties.kind() {
            Some(value) if !value.as_str().is_empty() => Some(value.to_string()),
            _ => None,
        };

        let reply_to = delivery
            .properties
            .reply_to()
            .as_ref()
            .map(|value| value.to_string());
        let correlation_id = delivery
            .properties
            .correlation_id()
            .as_ref()
            .map(|value| value.to_string());

        InboundEnvelope {
            data: delivery.data.clone(),
            kind,
            lineage: parse_lineage(delivery.properties.headers().as_ref()),
            routing_key: delivery.routing_key.to_string(),
            delivery_tag: delivery.delivery_tag,
            reply_to,
            correlation_id,
        }
    }
}

/// Reads the lineage header from a message header table.
pub(crate) fn parse_lineage(headers: Option<&FieldTable>) -> Vec<String> {
    let Some(headers) = headers else {
        return vec![];
    };

    match headers.inner().get(KIND_LINEAGE_HEADER) {
        Some(AMQPValue::LongString(value)) => match std::str::from_utf8(value.as_bytes()) {
            Ok(text) => text.split_whitespace().map(str::to_owned).collect(),
            Err(_) => vec![],
        },
        _ => vec![],
    }
}

/// Checks a decoded body against the configured reader limits.
pub(crate) fn enforce_limits(
    data: &[u8],
    body: &Value,
    limits: &ReaderLimits,
) -> Result<(), BusError> {
    if data.len() > limits.max_bytes_per_read {
        return Err(BusError::Decode(format!(
            "body of {} bytes exceeds the {} byte read limit",
            data.len(),
            limits.max_bytes_per_read
        )));
    }

    let mut name_chars = 0usize;
    walk(body, 1, limits, &mut name_chars)
}

fn walk(
    value: &Value,
    depth: usize,
    limits: &ReaderLimits,
    name_chars: &mut usize,
) -> Result<(), BusError> {
    if depth > limits.max_depth {
        return Err(BusError::Decode(format!(
            "nesting deeper than {} levels",
            limits.max_depth
        )));
    }

    match value {
        Value::String(text) => {
            if text.chars().count() > limits.max_string_content_length {
                return Err(BusError::Decode(format!(
                    "string longer than {} characters",
                    limits.max_string_content_length
                )));
            }
        }
        Value::Array(items) => {
            if items.len() > limits.max_array_length {
                return Err(BusError::Decode(format!(
                    "array longer than {} elements",
                    limits.max_array_length
                )));
            }
            for item in items {
                walk(item, depth + 1, limits, name_chars)?;
            }
        }
        Value::Object(fields) => {
            for (name, field) in fields {
                *name_chars += name.chars().count();
                if *name_chars > limits.max_name_table_char_count {
                    return Err(BusError::Decode(format!(
                        "object keys exceed {} characters in total",
                        limits.max_name_table_char_count
                    )));
                }
                walk(field, depth + 1, limits, name_chars)?;
            }
        }
        _ => {}
    }

    Ok(())
}
