// Copyright (c) 2026, The AmqpBus Authors
// MIT License
// All rights reserved.

//! # Dispatch Engine
//!
//! Delivers decoded messages to the handler set resolved from the
//! subscription registry and decides acknowledgement from the handler outcome
//! and the delivery options. Everything here is contained: decode failures go
//! to the error sink, handler failures are caught per handler, and nothing
//! propagates across the pump boundary, so one bad message cannot stop a
//! listener.
//!
//! Acknowledgement policy: under exactly-once delivery the message is
//! acknowledged only after every resolved handler returned without failing,
//! and any failure converts to a negative acknowledgement. Otherwise the
//! message is acknowledged on receipt, before handlers run.

use crate::errors::BusError;
use crate::handler::ErrorSink;
use crate::message::{self, InboundEnvelope};
use crate::options::DeliveryOptions;
use crate::publisher::JSON_CONTENT_TYPE;
use crate::subscription::SubscriptionRegistry;
use crate::trace;
use async_trait::async_trait;
use lapin::{
    message::Delivery,
    options::{BasicAckOptions, BasicNackOptions, BasicPublishOptions},
    types::ShortString,
    BasicProperties, Channel,
};
use opentelemetry::trace::{Span, Status};
use opentelemetry::{global, Context};
use serde_json::Value;
use std::borrow::Cow;
use std::sync::Arc;
use tracing::{debug, error};

/// Acknowledgement decisions for one delivery.
#[async_trait]
pub(crate) trait DeliveryAck: Send + Sync {
    async fn ack(&self) -> Result<(), BusError>;

    async fn nack(&self, requeue: bool) -> Result<(), BusError>;
}

pub(crate) struct LapinAck {
    delivery: Delivery,
}

#[async_trait]
impl DeliveryAck for LapinAck {
    async fn ack(&self) -> Result<(), BusError> {
        match self.delivery.ack(BasicAckOptions { multiple: false }).await {
            Err(err) => {
                error!(error = err.to_string(), "error to ack msg");
                Err(BusError::Ack)
            }
            _ => Ok(()),
        }
    }

    async fn nack(&self, requeue: bool) -> Result<(), BusError> {
        match self
            .delivery
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to nack msg");
                Err(BusError::Nack)
            }
            _ => Ok(()),
        }
    }
}

/// Outbound leg for processor replies.
#[async_trait]
pub(crate) trait ReplyTransport: Send + Sync {
    async fn send_reply(
        &self,
        reply_to: &str,
        correlation_id: &str,
        body: Vec<u8>,
    ) -> Result<(), BusError>;
}

/// Publishes replies through the default exchange straight to the reply
/// queue named by the sender.
pub(crate) struct AmqpReplyTransport {
    channel: Arc<Channel>,
}

impl AmqpReplyTransport {
    pub(crate) fn new(channel: Arc<Channel>) -> Self {
        AmqpReplyTransport { channel }
    }
}

#[async_trait]
impl ReplyTransport for AmqpReplyTransport {
    async fn send_reply(
        &self,
        reply_to: &str,
        correlation_id: &str,
        body: Vec<u8>,
    ) -> Result<(), BusError> {
        match self
            .channel
            .basic_publish(
                "",
                reply_to,
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default()
                    .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
                    .with_correlation_id(ShortString::from(correlation_id.to_owned())),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing reply");
                Err(BusError::Publishing(err.to_string()))
            }
            _ => Ok(()),
        }
    }
}

/// Reply leg for one-way listeners; replies are never expected, so any
/// produced value is dropped.
pub(crate) struct NoReplyTransport;

#[async_trait]
impl ReplyTransport for NoReplyTransport {
    async fn send_reply(
        &self,
        reply_to: &str,
        _correlation_id: &str,
        _body: Vec<u8>,
    ) -> Result<(), BusError> {
        debug!(reply_to, "dropping reply on a one-way listener");
        Ok(())
    }
}

/// Routes decoded messages to resolved handlers and settles acknowledgement.
pub struct DispatchEngine {
    registry: Arc<SubscriptionRegistry>,
    error_sink: Arc<dyn ErrorSink>,
    reply: Arc<dyn ReplyTransport>,
    options: DeliveryOptions,
}

impl DispatchEngine {
    pub(crate) fn new(
        registry: Arc<SubscriptionRegistry>,
        error_sink: Arc<dyn ErrorSink>,
        reply: Arc<dyn ReplyTransport>,
        options: DeliveryOptions,
    ) -> Self {
        DispatchEngine {
            registry,
            error_sink,
            reply,
            options,
        }
    }

    /// Entry point for the listener pump. Fully contained: failures are
    /// logged and recorded on the consumer span, never raised.
    pub(crate) async fn on_delivery(&self, delivery: Delivery) {
        let envelope = InboundEnvelope::from_delivery(&delivery);

        let tracer = global::tracer("amqp consumer");
        let (ctx, mut span) = trace::consumer_span(
            &delivery.properties,
            &tracer,
            envelope.kind.as_deref().unwrap_or("message"),
        );

        debug!(
            "received: {} - key: {}",
            envelope.kind.as_deref().unwrap_or("unknown"),
            envelope.routing_key
        );

        let ack = LapinAck { delivery };
        match self.process(&ctx, &ack, &envelope).await {
            Ok(()) => span.set_status(Status::Ok),
            Err(err) => {
                error!(error = err.to_string(), "error consume msg");
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from(err.to_string()),
                });
            }
        }
    }

    /// Decodes one envelope, invokes the resolved handlers in order and
    /// settles the acknowledgement.
    pub(crate) async fn process(
        &self,
        ctx: &Context,
        ack: &dyn DeliveryAck,
        envelope: &InboundEnvelope,
    ) -> Result<(), BusError> {
        if !self.options.exactly_once {
            ack.ack().await?;
        }

        let body = match self.decode(envelope) {
            Ok(body) => body,
            Err(err) => return self.reject(ack, envelope, err).await,
        };

        let Some((kind, lineage)) = self.runtime_kind(envelope, &body) else {
            let err = BusError::Decode("unable to determine payload kind".to_owned());
            return self.reject(ack, envelope, err).await;
        };

        let handlers = self.registry.resolve(&kind, &lineage);
        if handlers.is_empty() {
            debug!(kind, "removing message from queue - reason: no subscribers");
            if self.options.exactly_once {
                ack.ack().await?;
            }
            return Ok(());
        }

        let mut failures = 0usize;
        let mut reply = None;
        for (id, handler) in handlers {
            match handler.call(ctx, &body).await {
                Ok(produced) => {
                    if reply.is_none() {
                        reply = produced;
                    }
                }
                Err(err) => {
                    failures += 1;
                    let wrapped = BusError::Handler {
                        subscription: id,
                        message: err.to_string(),
                    };
                    error!(
                        subscription = id.to_string(),
                        error = err.to_string(),
                        "error handling message"
                    );
                    self.error_sink.on_handler_failure(id, &wrapped).await;
                }
            }
        }

        if !self.options.one_way_only {
            self.deliver_reply(envelope, reply).await;
        }

        if self.options.exactly_once {
            if failures == 0 {
                ack.ack().await?;
            } else {
                ack.nack(self.options.requeue_on_failure).await?;
            }
        }

        Ok(())
    }

    fn decode(&self, envelope: &InboundEnvelope) -> Result<Value, BusError> {
        let body: Value = serde_json::from_slice(&envelope.data)
            .map_err(|err| BusError::Decode(err.to_string()))?;
        message::enforce_limits(&envelope.data, &body, self.options.limits())?;
        Ok(body)
    }

    fn runtime_kind(
        &self,
        envelope: &InboundEnvelope,
        body: &Value,
    ) -> Option<(String, Vec<String>)> {
        match &envelope.kind {
            Some(kind) => {
                let lineage = if envelope.lineage.is_empty() {
                    self.registry.known_lineage(kind).unwrap_or_default()
                } else {
                    envelope.lineage.clone()
                };
                Some((kind.clone(), lineage))
            }
            None => self.registry.probe_kind(body),
        }
    }

    // Poison messages are routed to the error sink and removed from the
    // queue; requeuing them would redeliver the same undecodable body
    // forever.
    async fn reject(
        &self,
        ack: &dyn DeliveryAck,
        envelope: &InboundEnvelope,
        err: BusError,
    ) -> Result<(), BusError> {
        self.error_sink.on_decode_failure(envelope, &err).await;
        if self.options.exactly_once {
            ack.ack().await?;
        }
        Ok(())
    }

    async fn deliver_reply(&self, envelope: &InboundEnvelope, reply: Option<Value>) {
        let (Some(reply_to), Some(correlation_id), Some(value)) =
            (&envelope.reply_to, &envelope.correlation_id, reply)
        else {
            return;
        };

        let body = match serde_json::to_vec(&value) {
            Ok(body) => body,
            Err(err) => {
                error!(error = err.to_string(), "error encoding reply");
                return;
            }
        };

        if let Err(err) = self.reply.send_reply(reply_to, correlation_id, body).await {
            error!(error = err.to_string(), "error delivering reply");
        }
    }
}
