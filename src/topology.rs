// Copyright (c) 2026, The AmqpBus Authors
// MIT License
// All rights reserved.

//! # Broker Resource Provisioning
//!
//! Ensures the exchange, queue and binding behind an address exist before the
//! first publish or consume. Declarations use compatible-redeclare semantics,
//! so provisioning the same address twice is a no-op; a guard keyed by address
//! and options short-circuits repeat calls and serializes concurrent openers
//! of the same address. Failures are not retried here: the broker rejecting a
//! declaration usually means an incompatible existing resource, and retrying
//! locally would only mask the misconfiguration.

use crate::address::Address;
use crate::errors::BusError;
use crate::options::DeliveryOptions;
use async_trait::async_trait;
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::FieldTable,
    Channel,
};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error};

/// Reserved exchange-name prefix the broker forbids redeclaring.
const RESERVED_EXCHANGE_PREFIX: &str = "amq.";

/// Broker entities an `ensure` call resolved to.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProvisionedResources {
    pub exchange: Option<String>,
    pub queue: Option<String>,
    pub routing_key: Option<String>,
}

/// Declaration operations against the broker.
///
/// The trait exists so provisioning logic can be exercised against a mock; the
/// production implementation is [`AmqpProvisionOps`] over a live channel.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProvisionOps: Send + Sync {
    async fn declare_exchange(&self, name: &str, durable: bool) -> Result<(), BusError>;

    async fn declare_queue(&self, name: &str, durable: bool) -> Result<(), BusError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BusError>;
}

/// Declaration operations over a live broker channel.
pub struct AmqpProvisionOps {
    channel: Arc<Channel>,
}

impl AmqpProvisionOps {
    pub fn new(channel: Arc<Channel>) -> Self {
        AmqpProvisionOps { channel }
    }
}

#[async_trait]
impl ProvisionOps for AmqpProvisionOps {
    async fn declare_exchange(&self, name: &str, durable: bool) -> Result<(), BusError> {
        debug!("declaring exchange: {}", name);

        match self
            .channel
            .exchange_declare(
                name,
                lapin::ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    passive: false,
                    durable,
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name, "error to declare the exchange"
                );
                Err(BusError::Provisioning(format!("exchange `{}`", name)))
            }
            _ => Ok(()),
        }
    }

    async fn declare_queue(&self, name: &str, durable: bool) -> Result<(), BusError> {
        debug!("declaring queue: {}", name);

        match self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: false,
                    durable,
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name, "error to declare the queue");
                Err(BusError::Provisioning(format!("queue `{}`", name)))
            }
            _ => Ok(()),
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BusError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            queue, exchange, routing_key
        );

        match self
            .channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(BusError::Provisioning(format!(
                    "binding `{}` to `{}`",
                    queue, exchange
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Idempotent, race-free provisioning coordinator.
///
/// Holds the guard mutex across the declaration sequence so concurrent openers
/// of the same address cannot issue conflicting declarations. A guard key is
/// recorded only after the whole sequence succeeded; failed attempts re-issue
/// their declarations on the next call.
#[derive(Default)]
pub struct ResourceProvisioner {
    provisioned: Mutex<HashSet<String>>,
}

impl ResourceProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensures the consume-side resources behind an address: the queue itself
    /// and, when `auto_bind_exchange` is set, the exchange and a binding using
    /// the address routing key (possibly empty).
    pub async fn ensure_consume(
        &self,
        ops: &dyn ProvisionOps,
        address: &Address,
        options: &DeliveryOptions,
    ) -> Result<ProvisionedResources, BusError> {
        let exchange = options.auto_bind_exchange.as_deref();
        let routing_key = address.routing_key().unwrap_or("");

        let resources = ProvisionedResources {
            exchange: exchange.map(str::to_owned),
            queue: Some(address.target().to_owned()),
            routing_key: exchange.and(Some(routing_key.to_owned())),
        };

        let key = format!(
            "consume:{}:{}|{}|{}",
            address.session_key(),
            address.target(),
            exchange.unwrap_or("-"),
            address.routing_key().unwrap_or("-")
        );

        let mut provisioned = self.provisioned.lock().await;
        if provisioned.contains(&key) {
            return Ok(resources);
        }

        ops.declare_queue(address.target(), options.persistent_delivery)
            .await?;

        if let Some(exchange) = exchange {
            if !is_reserved_exchange(exchange) {
                ops.declare_exchange(exchange, options.persistent_delivery)
                    .await?;
            }
            ops.bind_queue(address.target(), exchange, routing_key)
                .await?;
        }

        provisioned.insert(key);
        Ok(resources)
    }

    /// Ensures the publish-side target exchange exists. Reserved and default
    /// exchanges always exist and are left untouched.
    pub async fn ensure_publish(
        &self,
        ops: &dyn ProvisionOps,
        address: &Address,
        options: &DeliveryOptions,
    ) -> Result<ProvisionedResources, BusError> {
        let resources = ProvisionedResources {
            exchange: Some(address.target().to_owned()),
            queue: None,
            routing_key: address.routing_key().map(str::to_owned),
        };

        if is_reserved_exchange(address.target()) {
            return Ok(resources);
        }

        let key = format!("publish:{}:{}", address.session_key(), address.target());

        let mut provisioned = self.provisioned.lock().await;
        if provisioned.contains(&key) {
            return Ok(resources);
        }

        ops.declare_exchange(address.target(), options.persistent_delivery)
            .await?;

        provisioned.insert(key);
        Ok(resources)
    }
}

fn is_reserved_exchange(name: &str) -> bool {
    name.is_empty() || name.starts_with(RESERVED_EXCHANGE_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;

    fn address(uri: &str) -> Address {
        Address::parse(uri).unwrap()
    }

    #[tokio::test]
    async fn repeated_ensure_issues_one_declaration() {
        let mut ops = MockProvisionOps::new();
        ops.expect_declare_queue()
            .with(eq("myQueue"), eq(false))
            .times(1)
            .returning(|_, _| Ok(()));

        let provisioner = ResourceProvisioner::new();
        let target = address("amqp://localhost/myQueue");
        let options = DeliveryOptions::default();

        let first = provisioner
            .ensure_consume(&ops, &target, &options)
            .await
            .unwrap();
        let second = provisioner
            .ensure_consume(&ops, &target, &options)
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(first.queue.as_deref(), Some("myQueue"));
    }

    #[tokio::test]
    async fn auto_bind_declares_exchange_and_binding() {
        let mut ops = MockProvisionOps::new();
        ops.expect_declare_queue()
            .with(eq("orders"), eq(true))
            .times(1)
            .returning(|_, _| Ok(()));
        ops.expect_declare_exchange()
            .with(eq("orders-exchange"), eq(true))
            .times(1)
            .returning(|_, _| Ok(()));
        ops.expect_bind_queue()
            .with(eq("orders"), eq("orders-exchange"), eq("created"))
            .times(1)
            .returning(|_, _, _| Ok(()));

        let provisioner = ResourceProvisioner::new();
        let target = address("amqp://localhost/orders?routingKey=created");
        let options = DeliveryOptions::new()
            .auto_bind_exchange("orders-exchange")
            .persistent_delivery();

        let resources = provisioner
            .ensure_consume(&ops, &target, &options)
            .await
            .unwrap();
        assert_eq!(resources.exchange.as_deref(), Some("orders-exchange"));
        assert_eq!(resources.routing_key.as_deref(), Some("created"));
    }

    #[tokio::test]
    async fn auto_bind_without_routing_key_binds_with_empty_key() {
        let mut ops = MockProvisionOps::new();
        ops.expect_declare_queue().times(1).returning(|_, _| Ok(()));
        ops.expect_declare_exchange()
            .times(1)
            .returning(|_, _| Ok(()));
        ops.expect_bind_queue()
            .with(eq("orders"), eq("orders-exchange"), eq(""))
            .times(1)
            .returning(|_, _, _| Ok(()));

        let provisioner = ResourceProvisioner::new();
        let target = address("amqp://localhost/orders");
        let options = DeliveryOptions::new().auto_bind_exchange("orders-exchange");

        provisioner
            .ensure_consume(&ops, &target, &options)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn reserved_exchanges_are_bound_but_never_declared() {
        let mut ops = MockProvisionOps::new();
        ops.expect_declare_queue().times(1).returning(|_, _| Ok(()));
        ops.expect_bind_queue()
            .with(eq("myQueue"), eq("amq.direct"), eq("OneWayService"))
            .times(1)
            .returning(|_, _, _| Ok(()));

        let provisioner = ResourceProvisioner::new();
        let target = address("amqp://localhost/myQueue?routingKey=OneWayService");
        let options = DeliveryOptions::new().auto_bind_exchange("amq.direct");

        provisioner
            .ensure_consume(&ops, &target, &options)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn failed_provisioning_is_not_cached() {
        let mut ops = MockProvisionOps::new();
        ops.expect_declare_queue()
            .times(1)
            .returning(|name, _| Err(BusError::Provisioning(format!("queue `{}`", name))));
        ops.expect_declare_queue().times(1).returning(|_, _| Ok(()));

        let provisioner = ResourceProvisioner::new();
        let target = address("amqp://localhost/myQueue");
        let options = DeliveryOptions::default();

        provisioner
            .ensure_consume(&ops, &target, &options)
            .await
            .unwrap_err();
        provisioner
            .ensure_consume(&ops, &target, &options)
            .await
            .expect("retry after failure re-issues declarations");
    }

    #[tokio::test]
    async fn publish_side_declares_custom_exchanges_once() {
        let mut ops = MockProvisionOps::new();
        ops.expect_declare_exchange()
            .with(eq("orders-exchange"), eq(false))
            .times(1)
            .returning(|_, _| Ok(()));

        let provisioner = ResourceProvisioner::new();
        let target = address("amqp://localhost/orders-exchange?routingKey=created");
        let options = DeliveryOptions::default();

        provisioner
            .ensure_publish(&ops, &target, &options)
            .await
            .unwrap();
        provisioner
            .ensure_publish(&ops, &target, &options)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn publish_side_skips_reserved_exchanges() {
        let ops = MockProvisionOps::new();

        let provisioner = ResourceProvisioner::new();
        let target = address("amqp://localhost/amq.direct?routingKey=OneWayService");
        let options = DeliveryOptions::default();

        let resources = provisioner
            .ensure_publish(&ops, &target, &options)
            .await
            .unwrap();
        assert_eq!(resources.exchange.as_deref(), Some("amq.direct"));
    }
}
