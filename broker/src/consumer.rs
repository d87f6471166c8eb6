use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicQosOptions,
        BasicRejectOptions,
    },
    types::FieldTable,
    Channel, Connection, Consumer,
};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{open_connection, BrokerError, BrokerSettings};
use crate::inflight::InFlight;

/// Typed handler bound to one queue. Returning `Err` rejects the delivery
/// without requeue; any retry must happen through an explicit republish
/// inside the handler.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    type Message: DeserializeOwned + Send + 'static;

    async fn handle(&self, message: Self::Message) -> anyhow::Result<()>;
}

/// What the consumer tells the broker about a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Reject,
}

/// Decodes a raw payload and runs the handler, yielding the broker
/// disposition. Malformed payloads never reach the handler: retrying a
/// message that cannot be decoded cannot help, so it is dropped with an
/// error log. Factored out of the delivery loop so the ack decision is
/// testable without a broker.
pub async fn dispatch<H: MessageHandler>(handler: &H, payload: &[u8]) -> Disposition {
    let message = match serde_json::from_slice::<H::Message>(payload) {
        Ok(message) => message,
        Err(err) => {
            error!(error = %err, bytes = payload.len(), "dropping malformed message");
            return Disposition::Reject;
        }
    };

    match handler.handle(message).await {
        Ok(()) => Disposition::Ack,
        Err(err) => {
            warn!(error = %err, "handler failed; rejecting without requeue");
            Disposition::Reject
        }
    }
}

/// Generic queue consumer owning one connection and channel, with
/// prefetch = 1 so a slow document never holds more than a single
/// unacknowledged delivery.
pub struct QueueConsumer {
    connection: Connection,
    channel: Channel,
    consumer: Consumer,
    queue: String,
    consumer_tag: String,
    in_flight: InFlight,
}

impl QueueConsumer {
    pub async fn open(
        settings: &BrokerSettings,
        queue: &str,
        consumer_tag: &str,
        in_flight: InFlight,
    ) -> Result<Self, BrokerError> {
        let connection = open_connection(settings).await?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))?;

        // Fair dispatch: one unacknowledged delivery per consumer at a time.
        channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))?;

        let consumer = channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Consume(e.to_string()))?;

        Ok(Self {
            connection,
            channel,
            consumer,
            queue: queue.to_owned(),
            consumer_tag: consumer_tag.to_owned(),
            in_flight,
        })
    }

    /// Pulls deliveries until the shutdown token fires or the stream dies.
    /// Returns `Ok` after a graceful unsubscribe on shutdown and `Err` on
    /// connection loss so a supervisor can restart the consumer.
    pub async fn run<H: MessageHandler>(
        mut self,
        handler: &H,
        shutdown: CancellationToken,
    ) -> Result<(), BrokerError> {
        info!(queue = %self.queue, "consumer started");

        loop {
            let delivery = tokio::select! {
                () = shutdown.cancelled() => {
                    self.stop().await;
                    return Ok(());
                }
                delivery = self.consumer.next() => delivery,
            };

            let delivery = match delivery {
                Some(Ok(delivery)) => delivery,
                Some(Err(err)) => return Err(BrokerError::Consume(err.to_string())),
                None => {
                    return Err(BrokerError::Consume(format!(
                        "delivery stream for queue {} ended",
                        self.queue
                    )))
                }
            };

            let disposition = {
                let _guard = self.in_flight.begin();
                dispatch(handler, &delivery.data).await
            };

            match disposition {
                Disposition::Ack => delivery
                    .ack(BasicAckOptions::default())
                    .await
                    .map_err(|e| BrokerError::Consume(e.to_string()))?,
                Disposition::Reject => delivery
                    .reject(BasicRejectOptions { requeue: false })
                    .await
                    .map_err(|e| BrokerError::Consume(e.to_string()))?,
            }
        }
    }

    /// Unsubscribe before closing so the broker stops sending new
    /// deliveries while in-flight work drains.
    async fn stop(&self) {
        if let Err(err) = self
            .channel
            .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
            .await
        {
            warn!(queue = %self.queue, error = %err, "failed to cancel consumer");
        }
        self.connection
            .close(200, "consumer shutting down")
            .await
            .ok();
        info!(queue = %self.queue, "consumer stopped");
    }
}
