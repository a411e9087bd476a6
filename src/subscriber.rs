// Copyright (c) 2026, The AmqpBus Authors
// MIT License
// All rights reserved.

//! # Subscriber Facade
//!
//! The caller-facing surface of the consume side: typed subscription
//! registration over an owned listener. A subscriber wires a subscription
//! registry, an error sink and the reply transport into a dispatch engine and
//! drives the listener with it. Disposing the subscriber unregisters every
//! subscription and stops the listener.

use crate::dispatcher::{AmqpReplyTransport, DispatchEngine, NoReplyTransport, ReplyTransport};
use crate::errors::BusError;
use crate::handler::{ErrorSink, LogErrorSink, Processor};
use crate::listener::InboundListener;
use crate::message::Payload;
use crate::subscription::{SubscriptionId, SubscriptionRegistry};
use serde_json::Value;
use std::sync::Arc;

/// Typed subscription surface over one inbound listener.
pub struct Subscriber {
    registry: Arc<SubscriptionRegistry>,
    engine: Arc<DispatchEngine>,
    listener: InboundListener,
}

impl Subscriber {
    /// Wraps a listener with the default log-only error sink.
    pub fn new(listener: InboundListener) -> Self {
        Self::with_error_sink(listener, Arc::new(LogErrorSink))
    }

    /// Wraps a listener with a caller-provided error sink. The sink receives
    /// undecodable messages and handler failures; it is never part of the
    /// type-keyed handler resolution.
    pub fn with_error_sink(listener: InboundListener, error_sink: Arc<dyn ErrorSink>) -> Self {
        let registry = Arc::new(SubscriptionRegistry::new());
        let reply: Arc<dyn ReplyTransport> = if listener.options().is_one_way_only() {
            Arc::new(NoReplyTransport)
        } else {
            Arc::new(AmqpReplyTransport::new(listener.channel()))
        };
        let engine = Arc::new(DispatchEngine::new(
            registry.clone(),
            error_sink,
            reply,
            listener.options().clone(),
        ));

        Subscriber {
            registry,
            engine,
            listener,
        }
    }

    /// Starts consuming; valid once, from the listener's `Opened` state.
    pub async fn start(&self) -> Result<(), BusError> {
        self.listener.start(self.engine.clone()).await
    }

    /// Registers a callback for payloads of exactly kind `T::KIND`.
    pub fn subscribe<T, F>(&self, callback: F) -> Result<SubscriptionId, BusError>
    where
        T: Payload,
        F: Fn(T) + Send + Sync + 'static,
    {
        self.registry.register_callback::<T, F>(false, callback)
    }

    /// Registers a processor for payloads of exactly kind `T::KIND`.
    pub fn subscribe_processor<T: Payload>(
        &self,
        processor: Arc<dyn Processor<T>>,
    ) -> Result<SubscriptionId, BusError> {
        self.registry.register_processor::<T>(false, processor)
    }

    /// Registers an untyped callback for an explicit kind tag.
    pub fn subscribe_kind<F>(&self, kind: &str, callback: F) -> Result<SubscriptionId, BusError>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.registry.register_raw(kind, callback)
    }

    /// Registers a callback that also receives payloads whose lineage
    /// contains `T::KIND`.
    pub fn subscribe_hierarchy<T, F>(&self, callback: F) -> Result<SubscriptionId, BusError>
    where
        T: Payload,
        F: Fn(T) + Send + Sync + 'static,
    {
        self.registry.register_callback::<T, F>(true, callback)
    }

    /// Removes one subscription. An in-flight dispatch that already resolved
    /// its handler set is unaffected.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.registry.unregister(id)
    }

    pub fn listener(&self) -> &InboundListener {
        &self.listener
    }

    /// Unregisters every subscription and stops the owned listener.
    pub async fn dispose(self) -> Result<(), BusError> {
        self.registry.clear();
        self.listener.stop().await
    }
}

impl Drop for Subscriber {
    // Best-effort teardown for subscribers dropped without dispose: clear the
    // registrations and signal the pump; the broker reclaims the channel when
    // the connection drops.
    fn drop(&mut self) {
        self.registry.clear();
        self.listener.request_stop();
    }
}
