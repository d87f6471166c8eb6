use async_trait::async_trait;
use lapin::{options::BasicPublishOptions, BasicProperties, Channel, Connection};
use serde::Serialize;
use tracing::debug;

use super::{open_connection, BrokerError, BrokerSettings};

/// Narrow publish seam so handlers that re-enqueue messages can be
/// exercised without a live broker.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish_bytes(&self, routing_key: &str, payload: Vec<u8>) -> Result<(), BrokerError>;
}

/// Long-lived publisher over its own connection and channel. The lapin
/// channel serializes outgoing frames internally, so a single `Publisher`
/// shared behind an `Arc` is safe for concurrent `publish` calls without an
/// additional lock.
pub struct Publisher {
    connection: Connection,
    channel: Channel,
    exchange: String,
}

impl Publisher {
    pub async fn connect(settings: &BrokerSettings) -> Result<Self, BrokerError> {
        let connection = open_connection(settings).await?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))?;

        Ok(Self {
            connection,
            channel,
            exchange: settings.exchange.clone(),
        })
    }

    /// Serializes the message to JSON and publishes it persistently to the
    /// configured exchange. Broker-level failures propagate to the caller;
    /// there is no internal retry.
    pub async fn publish<T: Serialize>(
        &self,
        message: &T,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let payload = serde_json::to_vec(message)
            .map_err(|e| BrokerError::Publish(format!("Serialization Error: {e}")))?;
        self.publish_bytes(routing_key, payload).await
    }

    pub async fn close(self) {
        self.connection.close(200, "publisher shutting down").await.ok();
    }
}

#[async_trait]
impl MessagePublisher for Publisher {
    async fn publish_bytes(&self, routing_key: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        self.channel
            .basic_publish(
                &self.exchange,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default()
                    .with_delivery_mode(2)
                    .with_content_type("application/json".into()),
            )
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?;

        debug!(
            exchange = %self.exchange,
            routing_key,
            bytes = payload.len(),
            "message published"
        );
        Ok(())
    }
}
