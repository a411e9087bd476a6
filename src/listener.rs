// Copyright (c) 2026, The AmqpBus Authors
// MIT License
// All rights reserved.

//! # Inbound Listeners
//!
//! The consume side of the bus. [`ChannelListener`] resolves an address into
//! an [`InboundListener`] with its broker resources provisioned; starting the
//! listener spawns a message pump that feeds deliveries to a dispatch engine.
//!
//! Listener lifecycle: `Created -> Opened -> Pumping -> Stopping -> Closed`.
//! `start` is only valid from `Opened`; `stop` and `close` are valid from any
//! state and idempotent. The pump preserves broker delivery order into
//! dispatch invocation order while letting deliveries run concurrently up to
//! the prefetch bound, which also backs the broker-side flow control window.

use crate::address::Address;
use crate::channel;
use crate::config::BusConfig;
use crate::dispatcher::DispatchEngine;
use crate::errors::BusError;
use crate::options::DeliveryOptions;
use crate::topology::{AmqpProvisionOps, ResourceProvisioner};
use futures_util::StreamExt;
use lapin::{
    options::{BasicConsumeOptions, BasicQosOptions},
    types::FieldTable,
    Channel, Connection,
};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Bound on the wait for in-flight deliveries when a listener stops. Messages
/// still unacknowledged after the grace period are returned to the queue by
/// the broker when the channel closes.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Listener lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Created,
    Opened,
    Pumping,
    Stopping,
    Closed,
}

/// Creates inbound listeners bound to resolved addresses.
pub struct ChannelListener {
    config: BusConfig,
    provisioner: ResourceProvisioner,
}

impl ChannelListener {
    pub fn new(config: BusConfig) -> Self {
        ChannelListener {
            config,
            provisioner: ResourceProvisioner::new(),
        }
    }

    /// Opens a listener on the address queue.
    ///
    /// Validates the options, connects, applies the prefetch window and
    /// provisions the queue (and its exchange binding when configured). The
    /// returned listener is in state `Opened` and does not consume until
    /// started.
    pub async fn open(
        &self,
        address: &Address,
        options: DeliveryOptions,
    ) -> Result<InboundListener, BusError> {
        options.validate()?;

        let connection = channel::connect(address, &self.config.app_name).await?;
        let amqp = channel::create_channel(&connection).await?;

        if let Err(err) = amqp
            .basic_qos(options.prefetch_count, BasicQosOptions { global: false })
            .await
        {
            error!(error = err.to_string(), "error to configure qos");
            return Err(BusError::Consumer(format!("qos: {}", err)));
        }

        let ops = AmqpProvisionOps::new(amqp.clone());
        self.provisioner
            .ensure_consume(&ops, address, &options)
            .await?;

        let (shutdown, _) = watch::channel(false);

        Ok(InboundListener {
            _connection: connection,
            channel: amqp,
            queue: address.target().to_owned(),
            options,
            state: StdMutex::new(ListenerState::Opened),
            shutdown,
            pump: StdMutex::new(None),
        })
    }
}

/// A provisioned consume-side channel with its message pump.
pub struct InboundListener {
    _connection: Arc<Connection>,
    channel: Arc<Channel>,
    queue: String,
    options: DeliveryOptions,
    state: StdMutex<ListenerState>,
    shutdown: watch::Sender<bool>,
    pump: StdMutex<Option<JoinHandle<()>>>,
}

impl InboundListener {
    pub fn state(&self) -> ListenerState {
        *self.state.lock().expect("listener state poisoned")
    }

    pub fn options(&self) -> &DeliveryOptions {
        &self.options
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub(crate) fn channel(&self) -> Arc<Channel> {
        self.channel.clone()
    }

    /// Starts the message pump, feeding every delivery to the engine.
    ///
    /// # Errors
    /// `ListenerState` when the listener is not in `Opened`, `Consumer` when
    /// the broker rejects the consume request.
    pub async fn start(&self, engine: Arc<DispatchEngine>) -> Result<(), BusError> {
        {
            let mut state = self.state.lock().expect("listener state poisoned");
            if *state != ListenerState::Opened {
                return Err(BusError::ListenerState(format!("{:?}", *state)));
            }
            *state = ListenerState::Pumping;
        }

        let mut consumer = match self
            .channel
            .basic_consume(
                &self.queue,
                &format!("{}-{}", self.queue, Uuid::new_v4()),
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Ok(consumer) => consumer,
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                *self.state.lock().expect("listener state poisoned") = ListenerState::Opened;
                return Err(BusError::Consumer(err.to_string()));
            }
        };

        let mut shutdown = self.shutdown.subscribe();
        let permits = Arc::new(Semaphore::new(self.options.prefetch_count as usize));
        let queue = self.queue.clone();

        let handle = tokio::spawn(async move {
            let mut in_flight = JoinSet::new();

            loop {
                if *shutdown.borrow_and_update() {
                    break;
                }

                tokio::select! {
                    _ = shutdown.changed() => break,
                    Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
                    next = consumer.next() => {
                        let Some(result) = next else {
                            warn!(queue, "consume stream ended");
                            break;
                        };

                        match result {
                            Ok(delivery) => {
                                let Ok(permit) = permits.clone().acquire_owned().await else {
                                    break;
                                };
                                let engine = engine.clone();
                                in_flight.spawn(async move {
                                    let _permit = permit;
                                    engine.on_delivery(delivery).await;
                                });
                            }
                            Err(err) => error!(error = err.to_string(), "errors consume msg"),
                        }
                    }
                }
            }

            // Dropping the set would abort in-flight handlers; drain instead.
            while in_flight.join_next().await.is_some() {}
            debug!(queue, "message pump finished");
        });

        *self.pump.lock().expect("listener pump poisoned") = Some(handle);
        Ok(())
    }

    /// Stops the pump and closes the channel.
    ///
    /// In-flight deliveries get [`SHUTDOWN_GRACE`] to finish; stragglers are
    /// aborted and their messages are redelivered by the broker once the
    /// channel is gone. Safe to call from any state, repeatedly.
    pub async fn stop(&self) -> Result<(), BusError> {
        {
            let mut state = self.state.lock().expect("listener state poisoned");
            if *state == ListenerState::Closed {
                return Ok(());
            }
            *state = ListenerState::Stopping;
        }

        let _ = self.shutdown.send(true);

        let pump = self.pump.lock().expect("listener pump poisoned").take();
        if let Some(mut pump) = pump {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut pump).await.is_err() {
                warn!(
                    queue = self.queue,
                    "in-flight deliveries outlived the grace period"
                );
                pump.abort();
            }
        }

        let _ = self.channel.close(200, "listener stopped").await;

        *self.state.lock().expect("listener state poisoned") = ListenerState::Closed;
        Ok(())
    }

    /// Alias for [`stop`](Self::stop); both transitions end in `Closed`.
    pub async fn close(&self) -> Result<(), BusError> {
        self.stop().await
    }

    /// Signals the pump without waiting, for teardown paths that cannot
    /// await.
    pub(crate) fn request_stop(&self) {
        let mut state = self.state.lock().expect("listener state poisoned");
        if *state == ListenerState::Pumping {
            *state = ListenerState::Stopping;
        }
        let _ = self.shutdown.send(true);
    }
}
