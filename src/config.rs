// Copyright (c) 2026, The AmqpBus Authors
// MIT License
// All rights reserved.

//! # Broker Configuration Snapshot
//!
//! Process-wide broker defaults captured once at startup and passed explicitly
//! into the components that need them. Nothing in the crate reads ambient
//! global state; callers fill a `BusConfig` from whatever configuration source
//! they use and hand it to the factories.

use crate::address::Address;
use crate::errors::BusError;
use crate::options::{DeliveryOptions, ReaderLimits};

/// Immutable snapshot of broker defaults.
///
/// The connection is named after `app_name` on the broker side, which makes
/// the owning process identifiable in the management UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusConfig {
    /// Name reported to the broker as the connection name
    pub app_name: String,
    /// Default broker host
    pub host: String,
    /// Default broker port
    pub port: u16,
    /// Default user when an address carries no credentials
    pub user: String,
    /// Default password when an address carries no credentials
    pub password: String,
    /// Default virtual host, empty for the broker default
    pub vhost: String,
    /// Default exchange used by callers that publish without a full address
    pub exchange: String,
    /// Default reader limits applied to inbound payloads
    pub reader_limits: ReaderLimits,
}

impl Default for BusConfig {
    fn default() -> Self {
        BusConfig {
            app_name: "amqp-bus".to_owned(),
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: String::new(),
            exchange: "amq.direct".to_owned(),
            reader_limits: ReaderLimits::default(),
        }
    }
}

impl BusConfig {
    /// Creates a config with the given application name and default broker
    /// coordinates.
    pub fn new(app_name: &str) -> Self {
        BusConfig {
            app_name: app_name.to_owned(),
            ..Default::default()
        }
    }

    /// Address of the configured default exchange, for callers that publish
    /// with nothing but a routing key of their own.
    pub fn exchange_address(&self, routing_key: Option<&str>) -> Result<Address, BusError> {
        let vhost = if self.vhost.is_empty() {
            String::new()
        } else {
            format!("{}/", self.vhost)
        };

        let mut uri = format!(
            "amqp://{}:{}@{}:{}/{}{}",
            self.user, self.password, self.host, self.port, vhost, self.exchange
        );
        if let Some(key) = routing_key {
            uri.push_str("?routingKey=");
            uri.push_str(key);
        }

        Address::parse(&uri)
    }

    /// Delivery options seeded with this snapshot's reader limits.
    pub fn delivery_options(&self) -> DeliveryOptions {
        DeliveryOptions::new().reader_limits(self.reader_limits.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_address_uses_the_snapshot_defaults() {
        let config = BusConfig::new("test-app");
        let address = config.exchange_address(Some("OneWayService")).unwrap();

        assert_eq!(address.host(), "localhost");
        assert_eq!(address.port(), 5672);
        assert_eq!(address.target(), "amq.direct");
        assert_eq!(address.routing_key(), Some("OneWayService"));
    }

    #[test]
    fn exchange_address_carries_the_virtual_host() {
        let config = BusConfig {
            vhost: "staging".to_owned(),
            exchange: "orders-exchange".to_owned(),
            ..Default::default()
        };
        let address = config.exchange_address(None).unwrap();

        assert_eq!(address.virtual_host(), Some("staging"));
        assert_eq!(address.target(), "orders-exchange");
        assert_eq!(address.routing_key(), None);
    }

    #[test]
    fn delivery_options_inherit_the_reader_limits() {
        let config = BusConfig {
            reader_limits: ReaderLimits {
                max_bytes_per_read: 1024,
                ..Default::default()
            },
            ..Default::default()
        };

        assert_eq!(config.delivery_options().limits().max_bytes_per_read, 1024);
    }
}
