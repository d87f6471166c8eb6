use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::FieldTable,
    ExchangeKind,
};
use tracing::info;

use super::{open_connection, BrokerError, BrokerSettings};

#[derive(Debug, Clone)]
pub struct QueueBinding {
    pub queue: String,
    pub routing_key: String,
}

impl QueueBinding {
    pub fn new(queue: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            routing_key: routing_key.into(),
        }
    }
}

/// One-shot topology declaration at process start: one durable direct
/// exchange, each durable queue, each queue bound with its routing key.
/// Re-declaring an identical topology is a broker-side no-op; an
/// incompatible existing topology or an unreachable broker propagates as an
/// error and must abort startup. Deliberately not retried.
pub async fn declare_topology(
    settings: &BrokerSettings,
    bindings: &[QueueBinding],
) -> Result<(), BrokerError> {
    let connection = open_connection(settings).await?;
    let channel = connection
        .create_channel()
        .await
        .map_err(|e| BrokerError::Channel(e.to_string()))?;

    channel
        .exchange_declare(
            &settings.exchange,
            ExchangeKind::Direct,
            ExchangeDeclareOptions {
                durable: true,
                ..ExchangeDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| BrokerError::Topology(e.to_string()))?;

    for binding in bindings {
        channel
            .queue_declare(
                &binding.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Topology(e.to_string()))?;

        channel
            .queue_bind(
                &binding.queue,
                &settings.exchange,
                &binding.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Topology(e.to_string()))?;

        info!(
            exchange = %settings.exchange,
            queue = %binding.queue,
            routing_key = %binding.routing_key,
            "declared queue binding"
        );
    }

    connection.close(200, "topology declared").await.ok();
    Ok(())
}
