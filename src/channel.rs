// Copyright (c) 2026, The AmqpBus Authors
// MIT License
// All rights reserved.

//! # Broker Session Management
//!
//! Establishes connections and channels against the broker coordinates of a
//! parsed [`Address`]. Connections are named after the owning application so
//! they are identifiable on the broker side; channels are cheap per-use
//! sessions on top of a shared connection.

use crate::address::Address;
use crate::errors::BusError;
use lapin::{types::LongString, Channel, Connection, ConnectionProperties};
use std::sync::Arc;
use tracing::{debug, error};

/// Opens a connection to the broker the address points at.
pub async fn connect(address: &Address, app_name: &str) -> Result<Arc<Connection>, BusError> {
    debug!(host = address.host(), "creating amqp connection...");

    let properties =
        ConnectionProperties::default().with_connection_name(LongString::from(app_name.to_owned()));

    let connection = match Connection::connect(&address.broker_uri(), properties).await {
        Ok(connection) => connection,
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            return Err(BusError::Connection);
        }
    };

    debug!("amqp connected");
    Ok(Arc::new(connection))
}

/// Creates a channel on an established connection.
pub async fn create_channel(connection: &Connection) -> Result<Arc<Channel>, BusError> {
    debug!("creating amqp channel...");

    match connection.create_channel().await {
        Ok(channel) => {
            debug!("channel created");
            Ok(Arc::new(channel))
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(BusError::Channel)
        }
    }
}
