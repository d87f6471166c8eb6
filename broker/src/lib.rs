#![allow(clippy::missing_docs_in_private_items)]

use lapin::{Connection, ConnectionProperties};
use thiserror::Error;

pub mod consumer;
pub mod inflight;
pub mod publisher;
pub mod topology;

pub use consumer::{dispatch, Disposition, MessageHandler, QueueConsumer};
pub use inflight::{InFlight, InFlightGuard};
pub use publisher::{MessagePublisher, Publisher};
pub use topology::{declare_topology, QueueBinding};

/// Connection coordinates shared by every broker-side component. Each
/// publisher and consumer opens its own connection from these settings; a
/// channel is never shared across components.
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub uri: String,
    pub exchange: String,
}

impl BrokerSettings {
    pub fn new(uri: impl Into<String>, exchange: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            exchange: exchange.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Connection error: {0}")]
    Connect(String),
    #[error("Channel error: {0}")]
    Channel(String),
    #[error("Topology error: {0}")]
    Topology(String),
    #[error("Publish error: {0}")]
    Publish(String),
    #[error("Consume error: {0}")]
    Consume(String),
}

pub(crate) async fn open_connection(settings: &BrokerSettings) -> Result<Connection, BrokerError> {
    Connection::connect(&settings.uri, ConnectionProperties::default())
        .await
        .map_err(|e| BrokerError::Connect(e.to_string()))
}
