// Copyright (c) 2026, The AmqpBus Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! This module provides the error taxonomy for the bus. The `BusError` enum
//! covers address parsing, binding configuration, broker provisioning, channel
//! lifecycle, subscription management and message dispatch. Variants carry
//! enough context for callers to decide between failing fast and retrying.

use crate::subscription::SubscriptionId;
use thiserror::Error;

/// Represents errors that can occur while binding, publishing or dispatching.
///
/// Address and configuration errors surface synchronously to the caller that
/// opened the channel and are not retried. Provisioning errors propagate to the
/// opener so retry/backoff stays a caller decision. Decode and handler errors
/// are contained by the dispatch engine and never cross the pump boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The address URI could not be parsed into broker coordinates
    #[error("invalid broker address: {0}")]
    InvalidAddress(String),

    /// The delivery options are contradictory or out of range
    #[error("invalid binding configuration: {0}")]
    InvalidConfiguration(String),

    /// Error establishing a connection to the broker
    #[error("failure to connect to the broker")]
    Connection,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    Channel,

    /// The broker rejected a resource declaration or binding
    #[error("failure to provision broker resources: {0}")]
    Provisioning(String),

    /// Operation attempted on a channel that was already closed
    #[error("channel is closed")]
    ChannelClosed,

    /// Operation not allowed in the listener's current lifecycle state
    #[error("operation not valid in listener state `{0}`")]
    ListenerState(String),

    /// The same handler is already registered for this payload kind
    #[error("subscription already registered for payload kind `{0}`")]
    DuplicateSubscription(String),

    /// The payload did not match the declared or probed type
    #[error("failure to decode payload: {0}")]
    Decode(String),

    /// A caller-provided handler failed while processing a message
    #[error("handler of subscription {subscription} failed: {message}")]
    Handler {
        subscription: SubscriptionId,
        message: String,
    },

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    Publishing(String),

    /// The broker did not confirm the publish within the configured bound
    #[error("broker did not confirm the publish in time")]
    ConfirmTimeout,

    /// The reply to a request did not arrive within the given bound
    #[error("reply did not arrive in time")]
    ReplyTimeout,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    Ack,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    Nack,

    /// Error creating or driving a consumer
    #[error("failure to consume: {0}")]
    Consumer(String),
}
