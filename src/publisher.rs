// Copyright (c) 2026, The AmqpBus Authors
// MIT License
// All rights reserved.

//! # Outbound Channels
//!
//! The factory side of the bus. [`ChannelFactory`] resolves an address into an
//! outbound channel, reusing broker connections between channels that point at
//! the same session. Channels come in two variants: [`OneWayChannel`] for
//! fire-and-forget delivery and [`RequestReplyChannel`] for correlated
//! request-reply, chosen by the delivery options. Keeping the variants apart
//! keeps each state machine small; there is no reply machinery to misuse on a
//! one-way channel.

use crate::address::Address;
use crate::channel;
use crate::config::BusConfig;
use crate::errors::BusError;
use crate::message::{Payload, KIND_LINEAGE_HEADER};
use crate::options::DeliveryOptions;
use crate::topology::{AmqpProvisionOps, ResourceProvisioner};
use crate::trace;
use futures_util::StreamExt;
use lapin::{
    options::{BasicConsumeOptions, BasicPublishOptions, ConfirmSelectOptions, QueueDeclareOptions},
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection,
};
use opentelemetry::Context;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error};
use uuid::Uuid;

/// Content type stamped onto every published message.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Creates outbound channels bound to resolved addresses.
///
/// Connections are shared between channels whose addresses resolve to the same
/// broker session; the connection is released once the factory and every
/// channel holding it are dropped.
pub struct ChannelFactory {
    config: BusConfig,
    sessions: Mutex<HashMap<String, Arc<Connection>>>,
    provisioner: ResourceProvisioner,
}

impl ChannelFactory {
    pub fn new(config: BusConfig) -> Self {
        ChannelFactory {
            config,
            sessions: Mutex::new(HashMap::default()),
            provisioner: ResourceProvisioner::new(),
        }
    }

    /// Opens an outbound channel to the address target.
    ///
    /// Validates the options, establishes or reuses the broker session,
    /// switches the channel into confirm mode for exactly-once delivery and
    /// provisions the target exchange.
    ///
    /// # Errors
    /// `InvalidConfiguration` for contradictory options, `Connection`/`Channel`
    /// for session failures, `Provisioning` when the broker rejects the
    /// declaration; provisioning failures may be retried by calling again.
    pub async fn open(
        &self,
        address: &Address,
        options: DeliveryOptions,
    ) -> Result<OutboundChannel, BusError> {
        options.validate()?;

        let connection = self.session(address).await?;
        let amqp = channel::create_channel(&connection).await?;

        if options.exactly_once {
            if let Err(err) = amqp.confirm_select(ConfirmSelectOptions { nowait: false }).await {
                error!(error = err.to_string(), "error to enable publisher confirms");
                return Err(BusError::Channel);
            }
        }

        let ops = AmqpProvisionOps::new(amqp.clone());
        self.provisioner
            .ensure_publish(&ops, address, &options)
            .await?;

        if options.one_way_only {
            Ok(OutboundChannel::OneWay(OneWayChannel {
                channel: amqp,
                address: address.clone(),
                options,
                closed: AtomicBool::new(false),
            }))
        } else {
            let channel = RequestReplyChannel::open(amqp, address.clone(), options).await?;
            Ok(OutboundChannel::RequestReply(channel))
        }
    }

    async fn session(&self, address: &Address) -> Result<Arc<Connection>, BusError> {
        let mut sessions = self.sessions.lock().await;

        if let Some(connection) = sessions.get(&address.session_key()) {
            if connection.status().connected() {
                return Ok(connection.clone());
            }
        }

        let connection = channel::connect(address, &self.config.app_name).await?;
        sessions.insert(address.session_key(), connection.clone());
        Ok(connection)
    }
}

/// Channel variant returned by [`ChannelFactory::open`].
pub enum OutboundChannel {
    OneWay(OneWayChannel),
    RequestReply(RequestReplyChannel),
}

impl OutboundChannel {
    /// Publishes a payload to the bound target.
    pub async fn send<T: Payload>(&self, payload: &T) -> Result<(), BusError> {
        match self {
            OutboundChannel::OneWay(channel) => channel.send(payload).await,
            OutboundChannel::RequestReply(channel) => channel.send(payload).await,
        }
    }

    /// Closes the channel; repeated closes are no-ops.
    pub async fn close(&self) -> Result<(), BusError> {
        match self {
            OutboundChannel::OneWay(channel) => channel.close().await,
            OutboundChannel::RequestReply(channel) => channel.close().await,
        }
    }
}

/// Fire-and-forget outbound channel.
pub struct OneWayChannel {
    channel: Arc<Channel>,
    address: Address,
    options: DeliveryOptions,
    closed: AtomicBool,
}

impl OneWayChannel {
    /// Serializes and publishes a payload.
    ///
    /// Under exactly-once delivery, returns only after the broker confirmed
    /// the publish; otherwise returns as soon as the transport accepted the
    /// write.
    pub async fn send<T: Payload>(&self, payload: &T) -> Result<(), BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::ChannelClosed);
        }

        let body =
            serde_json::to_vec(payload).map_err(|e| BusError::Publishing(e.to_string()))?;
        let properties = properties_for::<T>(&self.options);

        publish_payload(&self.channel, &self.address, &self.options, body, properties).await
    }

    pub async fn close(&self) -> Result<(), BusError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let _ = self.channel.close(200, "channel closed").await;
        Ok(())
    }
}

/// Outbound channel with a correlated reply path.
///
/// A server-named exclusive queue receives replies; a background pump routes
/// them to the request that published the matching correlation id.
pub struct RequestReplyChannel {
    channel: Arc<Channel>,
    address: Address,
    options: DeliveryOptions,
    reply_queue: String,
    pending: Arc<StdMutex<HashMap<String, oneshot::Sender<Vec<u8>>>>>,
    reply_pump: JoinHandle<()>,
    closed: AtomicBool,
}

impl RequestReplyChannel {
    pub(crate) async fn open(
        channel: Arc<Channel>,
        address: Address,
        options: DeliveryOptions,
    ) -> Result<Self, BusError> {
        let queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    passive: false,
                    durable: false,
                    exclusive: true,
                    auto_delete: true,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Provisioning(format!("reply queue: {}", e)))?;
        let reply_queue = queue.name().as_str().to_owned();

        let mut consumer = channel
            .basic_consume(
                &reply_queue,
                &format!("reply-{}", Uuid::new_v4()),
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: true,
                    exclusive: true,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Consumer(e.to_string()))?;

        let pending: Arc<StdMutex<HashMap<String, oneshot::Sender<Vec<u8>>>>> =
            Arc::new(StdMutex::new(HashMap::default()));

        let routes = pending.clone();
        let reply_pump = tokio::spawn(async move {
            while let Some(result) = consumer.next().await {
                match result {
                    Ok(mut delivery) => {
                        let correlation = delivery
                            .properties
                            .correlation_id()
                            .as_ref()
                            .map(|id| id.as_str().to_owned());
                        let Some(correlation) = correlation else {
                            debug!("dropping reply without correlation id");
                            continue;
                        };

                        let waiter = routes
                            .lock()
                            .expect("reply route table poisoned")
                            .remove(&correlation);
                        match waiter {
                            Some(tx) => {
                                let _ = tx.send(std::mem::take(&mut delivery.data));
                            }
                            None => debug!("dropping reply nobody waits for"),
                        }
                    }
                    Err(err) => error!(error = err.to_string(), "error consuming reply"),
                }
            }
        });

        Ok(RequestReplyChannel {
            channel,
            address,
            options,
            reply_queue,
            pending,
            reply_pump,
            closed: AtomicBool::new(false),
        })
    }

    /// Publishes a payload without waiting for an answer.
    pub async fn send<T: Payload>(&self, payload: &T) -> Result<(), BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::ChannelClosed);
        }

        let body =
            serde_json::to_vec(payload).map_err(|e| BusError::Publishing(e.to_string()))?;
        let properties = properties_for::<T>(&self.options);

        publish_payload(&self.channel, &self.address, &self.options, body, properties).await
    }

    /// Publishes a payload and waits for the correlated reply.
    ///
    /// # Errors
    /// `ReplyTimeout` when no reply arrives within `timeout`; `Decode` when
    /// the reply body does not match `R`.
    pub async fn request<T: Payload, R: DeserializeOwned>(
        &self,
        payload: &T,
        timeout: Duration,
    ) -> Result<R, BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::ChannelClosed);
        }

        let body =
            serde_json::to_vec(payload).map_err(|e| BusError::Publishing(e.to_string()))?;
        let correlation = Uuid::new_v4().to_string();
        let properties = properties_for::<T>(&self.options)
            .with_reply_to(ShortString::from(self.reply_queue.clone()))
            .with_correlation_id(ShortString::from(correlation.clone()));

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("reply route table poisoned")
            .insert(correlation.clone(), tx);

        if let Err(err) =
            publish_payload(&self.channel, &self.address, &self.options, body, properties).await
        {
            self.forget(&correlation);
            return Err(err);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => {
                serde_json::from_slice(&reply).map_err(|e| BusError::Decode(e.to_string()))
            }
            Ok(Err(_)) => Err(BusError::ReplyTimeout),
            Err(_) => {
                self.forget(&correlation);
                Err(BusError::ReplyTimeout)
            }
        }
    }

    fn forget(&self, correlation: &str) {
        self.pending
            .lock()
            .expect("reply route table poisoned")
            .remove(correlation);
    }

    pub async fn close(&self) -> Result<(), BusError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.reply_pump.abort();
        let _ = self.channel.close(200, "channel closed").await;
        Ok(())
    }
}

/// Builds the message properties for a payload type under the given options:
/// JSON content type, kind tag, lineage header, a fresh message id, trace
/// context, and the persistence and expiration flags.
fn properties_for<T: Payload>(options: &DeliveryOptions) -> BasicProperties {
    let mut headers = BTreeMap::<ShortString, AMQPValue>::default();
    trace::inject_context(&Context::current(), &mut headers);

    let lineage = T::lineage();
    if !lineage.is_empty() {
        headers.insert(
            ShortString::from(KIND_LINEAGE_HEADER),
            AMQPValue::LongString(LongString::from(lineage.join(" "))),
        );
    }

    let mut properties = BasicProperties::default()
        .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
        .with_type(ShortString::from(T::KIND))
        .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
        .with_headers(FieldTable::from(headers));

    if options.persistent_delivery {
        properties = properties.with_delivery_mode(2);
    }

    if let Some(ttl) = options.ttl_millis {
        properties = properties.with_expiration(ShortString::from(ttl.to_string()));
    }

    properties
}

async fn publish_payload(
    channel: &Channel,
    address: &Address,
    options: &DeliveryOptions,
    body: Vec<u8>,
    properties: BasicProperties,
) -> Result<(), BusError> {
    let confirm = channel
        .basic_publish(
            address.target(),
            address.routing_key().unwrap_or_default(),
            BasicPublishOptions {
                immediate: false,
                mandatory: false,
            },
            &body,
            properties,
        )
        .await
        .map_err(|err| {
            error!(error = err.to_string(), "error publishing message");
            BusError::Publishing(err.to_string())
        })?;

    if !options.exactly_once {
        return Ok(());
    }

    match tokio::time::timeout(options.confirm_timeout, confirm).await {
        Err(_) => Err(BusError::ConfirmTimeout),
        Ok(Err(err)) => {
            error!(error = err.to_string(), "error awaiting publish confirm");
            Err(BusError::Publishing(err.to_string()))
        }
        Ok(Ok(Confirmation::Nack(_))) => {
            Err(BusError::Publishing("broker rejected the publish".to_owned()))
        }
        Ok(Ok(_)) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct ExtraData {
        id: i32,
        name: String,
        age: i32,
    }

    impl Payload for ExtraData {
        const KIND: &'static str = "ExtraData";

        fn lineage() -> &'static [&'static str] {
            &["Data"]
        }
    }

    #[test]
    fn properties_carry_kind_and_lineage() {
        let properties = properties_for::<ExtraData>(&DeliveryOptions::default());

        assert_eq!(
            properties.kind().as_ref().map(|kind| kind.as_str()),
            Some("ExtraData")
        );
        assert_eq!(
            properties
                .content_type()
                .as_ref()
                .map(|content| content.as_str()),
            Some(JSON_CONTENT_TYPE)
        );
        assert!(properties.message_id().is_some());

        let headers = properties.headers().as_ref().unwrap();
        match headers.inner().get(KIND_LINEAGE_HEADER) {
            Some(AMQPValue::LongString(value)) => assert_eq!(value.as_bytes(), b"Data"),
            other => panic!("missing lineage header: {:?}", other),
        }
    }

    #[test]
    fn transient_delivery_leaves_mode_and_expiration_unset() {
        let properties = properties_for::<ExtraData>(&DeliveryOptions::default());

        assert!(properties.delivery_mode().is_none());
        assert!(properties.expiration().is_none());
    }

    #[test]
    fn persistence_and_ttl_map_onto_properties() {
        let options = DeliveryOptions::new().persistent_delivery().ttl(5000);
        let properties = properties_for::<ExtraData>(&options);

        assert_eq!(properties.delivery_mode().as_ref().copied(), Some(2));
        assert_eq!(
            properties
                .expiration()
                .as_ref()
                .map(|expiration| expiration.as_str()),
            Some("5000")
        );
    }
}
