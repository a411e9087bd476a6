// Copyright (c) 2026, The AmqpBus Authors
// MIT License
// All rights reserved.

//! # Delivery Options
//!
//! Configuration resolved from binding settings when a channel or listener is
//! opened. Options are immutable once validated and shared freely between the
//! publish and consume sides. They follow the builder pattern used across this
//! crate's definitions.

use crate::errors::BusError;
use std::time::Duration;

/// Limits applied to inbound payloads before they reach handlers.
///
/// Oversized or overly nested payloads are rejected at decode time and routed
/// to the error sink instead of the type handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderLimits {
    /// Maximum size in bytes of a single message body
    pub max_bytes_per_read: usize,
    /// Maximum nesting depth of the decoded document
    pub max_depth: usize,
    /// Maximum number of elements in any array
    pub max_array_length: usize,
    /// Maximum cumulative character count of all object keys
    pub max_name_table_char_count: usize,
    /// Maximum character count of any single string value
    pub max_string_content_length: usize,
}

impl Default for ReaderLimits {
    fn default() -> Self {
        ReaderLimits {
            max_bytes_per_read: 4096,
            max_depth: 32,
            max_array_length: 16384,
            max_name_table_char_count: 16384,
            max_string_content_length: 8192,
        }
    }
}

/// Delivery configuration for one channel or listener.
///
/// `exactly_once` selects confirm-mode publishing and deferred consumer
/// acknowledgement; without it, messages are acknowledged on receipt and
/// publishes return as soon as the transport accepts the write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryOptions {
    pub(crate) auto_bind_exchange: Option<String>,
    pub(crate) exactly_once: bool,
    pub(crate) one_way_only: bool,
    pub(crate) ttl_millis: Option<i64>,
    pub(crate) persistent_delivery: bool,
    pub(crate) prefetch_count: u16,
    pub(crate) requeue_on_failure: bool,
    pub(crate) confirm_timeout: Duration,
    pub(crate) reader_limits: ReaderLimits,
}

impl Default for DeliveryOptions {
    fn default() -> Self {
        DeliveryOptions {
            auto_bind_exchange: None,
            exactly_once: false,
            one_way_only: true,
            ttl_millis: None,
            persistent_delivery: false,
            prefetch_count: 16,
            requeue_on_failure: false,
            confirm_timeout: Duration::from_secs(10),
            reader_limits: ReaderLimits::default(),
        }
    }
}

impl DeliveryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds the consume queue to the given exchange at provisioning time,
    /// using the address routing key.
    pub fn auto_bind_exchange(mut self, exchange: &str) -> Self {
        self.auto_bind_exchange = Some(exchange.to_owned());
        self
    }

    /// Requires broker confirms on publish and defers consumer acks until all
    /// handlers succeed.
    pub fn exactly_once(mut self) -> Self {
        self.exactly_once = true;
        self
    }

    /// Opens the channel with a reply path instead of fire-and-forget.
    pub fn request_reply(mut self) -> Self {
        self.one_way_only = false;
        self
    }

    /// Sets the per-message time to live in milliseconds.
    pub fn ttl(mut self, millis: i64) -> Self {
        self.ttl_millis = Some(millis);
        self
    }

    /// Marks published messages for disk persistence on the broker side.
    pub fn persistent_delivery(mut self) -> Self {
        self.persistent_delivery = true;
        self
    }

    /// Bounds the number of unacknowledged in-flight messages per listener.
    pub fn prefetch(mut self, count: u16) -> Self {
        self.prefetch_count = count;
        self
    }

    /// Requeues instead of dead-lettering when a handler fails under
    /// exactly-once delivery.
    pub fn requeue_on_failure(mut self) -> Self {
        self.requeue_on_failure = true;
        self
    }

    /// Bounds the wait for a broker publish confirmation.
    pub fn confirm_timeout(mut self, timeout: Duration) -> Self {
        self.confirm_timeout = timeout;
        self
    }

    /// Replaces the inbound payload limits.
    pub fn reader_limits(mut self, limits: ReaderLimits) -> Self {
        self.reader_limits = limits;
        self
    }

    pub fn is_exactly_once(&self) -> bool {
        self.exactly_once
    }

    pub fn is_one_way_only(&self) -> bool {
        self.one_way_only
    }

    pub fn limits(&self) -> &ReaderLimits {
        &self.reader_limits
    }

    /// Checks the option set for contradictions.
    ///
    /// Exactly-once delivery is only supported on one-way channels; whether a
    /// broker confirm should cover the request leg alone or the full
    /// round trip has no sound answer, so the combination is rejected instead
    /// of silently picking one.
    pub fn validate(&self) -> Result<(), BusError> {
        if let Some(ttl) = self.ttl_millis {
            if ttl < 0 {
                return Err(BusError::InvalidConfiguration(
                    "message TTL must not be negative".to_owned(),
                ));
            }
        }

        if self.prefetch_count == 0 {
            return Err(BusError::InvalidConfiguration(
                "prefetch count must be positive".to_owned(),
            ));
        }

        if self.exactly_once && !self.one_way_only {
            return Err(BusError::InvalidConfiguration(
                "exactly-once delivery requires a one-way channel".to_owned(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_are_valid() {
        assert_eq!(DeliveryOptions::default().validate(), Ok(()));
    }

    #[test]
    fn negative_ttl_is_rejected() {
        let err = DeliveryOptions::new().ttl(-1).validate().unwrap_err();
        assert!(matches!(err, BusError::InvalidConfiguration(_)));
    }

    #[test]
    fn zero_ttl_is_accepted() {
        assert_eq!(DeliveryOptions::new().ttl(0).validate(), Ok(()));
    }

    #[test]
    fn zero_prefetch_is_rejected() {
        let err = DeliveryOptions::new().prefetch(0).validate().unwrap_err();
        assert!(matches!(err, BusError::InvalidConfiguration(_)));
    }

    #[test]
    fn exactly_once_request_reply_is_rejected() {
        let err = DeliveryOptions::new()
            .exactly_once()
            .request_reply()
            .validate()
            .unwrap_err();
        assert!(matches!(err, BusError::InvalidConfiguration(_)));
    }

    #[test]
    fn exactly_once_one_way_is_accepted() {
        let options = DeliveryOptions::new().exactly_once();
        assert_eq!(options.validate(), Ok(()));
        assert!(options.is_exactly_once());
        assert!(options.is_one_way_only());
    }
}
