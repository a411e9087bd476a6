// Copyright (c) 2026, The AmqpBus Authors
// MIT License
// All rights reserved.

//! # Handler Contracts
//!
//! Traits implemented by message consumers. A [`Processor`] is a typed handler
//! that may fail and may produce a reply; plain callbacks registered through
//! the subscriber are wrapped into infallible processors internally. The
//! [`ErrorSink`] is a separate fallback contract that only ever sees failures;
//! it is never part of the type-keyed subscription resolution.

use crate::errors::BusError;
use crate::message::{InboundEnvelope, Payload};
use crate::subscription::SubscriptionId;
use async_trait::async_trait;
use opentelemetry::Context;
use serde_json::Value;
use tracing::warn;

/// Typed message handler.
///
/// Returning `Ok(Some(value))` produces a reply, which is delivered back to
/// the sender when the listener is not one-way-only and the message carries a
/// reply address. One-way listeners drop replies.
#[async_trait]
pub trait Processor<T: Payload>: Send + Sync {
    async fn process(&self, ctx: &Context, payload: T) -> Result<Option<Value>, BusError>;
}

/// Fallback sink for messages that never reach a handler and for handler
/// failures. Always present on a listener; defaults to [`LogErrorSink`].
#[async_trait]
pub trait ErrorSink: Send + Sync {
    /// Called with the raw envelope when the body cannot be decoded or typed.
    async fn on_decode_failure(&self, envelope: &InboundEnvelope, error: &BusError);

    /// Called once per failing handler; remaining handlers still run.
    async fn on_handler_failure(&self, subscription: SubscriptionId, error: &BusError);
}

/// Default sink that records failures in the log and drops the message.
pub struct LogErrorSink;

#[async_trait]
impl ErrorSink for LogErrorSink {
    async fn on_decode_failure(&self, envelope: &InboundEnvelope, error: &BusError) {
        warn!(
            kind = envelope.kind.as_deref().unwrap_or("unknown"),
            routing_key = envelope.routing_key,
            error = error.to_string(),
            "discarding undecodable message"
        );
    }

    async fn on_handler_failure(&self, subscription: SubscriptionId, error: &BusError) {
        warn!(
            subscription = subscription.to_string(),
            error = error.to_string(),
            "handler failed"
        );
    }
}
