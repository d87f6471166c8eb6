use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use broker::{BrokerError, BrokerSettings, InFlight, MessageHandler, QueueConsumer};
use common::utils::config::AppConfig;
use tokio::{
    task::JoinHandle,
    time::{sleep, timeout, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// One supervised consumer. `run` should block until the shutdown token
/// fires (returning `Ok`) or the underlying transport dies (returning
/// `Err`, after which the host restarts it).
#[async_trait]
pub trait ConsumerRunner: Send + Sync {
    fn name(&self) -> &str;

    async fn run(
        &self,
        shutdown: CancellationToken,
        in_flight: InFlight,
    ) -> Result<(), BrokerError>;
}

/// Opens a fresh queue consumer on every (re)start so a broken connection
/// is replaced wholesale instead of reused.
pub struct QueueConsumerRunner<H: MessageHandler> {
    name: String,
    settings: BrokerSettings,
    queue: String,
    handler: Arc<H>,
}

impl<H: MessageHandler + 'static> QueueConsumerRunner<H> {
    pub fn new(
        name: impl Into<String>,
        settings: BrokerSettings,
        queue: impl Into<String>,
        handler: Arc<H>,
    ) -> Self {
        Self {
            name: name.into(),
            settings,
            queue: queue.into(),
            handler,
        }
    }

    pub fn boxed(
        name: impl Into<String>,
        settings: BrokerSettings,
        queue: impl Into<String>,
        handler: Arc<H>,
    ) -> Arc<dyn ConsumerRunner> {
        Arc::new(Self::new(name, settings, queue, handler))
    }
}

#[async_trait]
impl<H: MessageHandler + 'static> ConsumerRunner for QueueConsumerRunner<H> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(
        &self,
        shutdown: CancellationToken,
        in_flight: InFlight,
    ) -> Result<(), BrokerError> {
        let consumer =
            QueueConsumer::open(&self.settings, &self.queue, &self.name, in_flight).await?;
        consumer.run(self.handler.as_ref(), shutdown).await
    }
}

/// Supervises the specialized consumers: restarts them with a fixed backoff
/// on transport failure and, on shutdown, drains in-flight deliveries
/// within a bounded window before forcibly disposing whatever is left.
pub struct WorkerHost {
    shutdown: CancellationToken,
    in_flight: InFlight,
    restart_backoff: Duration,
    drain_timeout: Duration,
    drain_poll: Duration,
}

impl WorkerHost {
    pub fn new(
        shutdown: CancellationToken,
        restart_backoff: Duration,
        drain_timeout: Duration,
        drain_poll: Duration,
    ) -> Self {
        Self {
            shutdown,
            in_flight: InFlight::new(),
            restart_backoff,
            drain_timeout,
            drain_poll,
        }
    }

    pub fn from_config(config: &AppConfig, shutdown: CancellationToken) -> Self {
        Self::new(
            shutdown,
            Duration::from_secs(config.consumer_restart_backoff_secs),
            Duration::from_secs(config.drain_timeout_secs),
            Duration::from_millis(config.drain_poll_millis),
        )
    }

    pub fn in_flight(&self) -> InFlight {
        self.in_flight.clone()
    }

    pub async fn run(&self, runners: Vec<Arc<dyn ConsumerRunner>>) {
        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        for runner in runners {
            handles.push(tokio::spawn(supervise(
                runner,
                self.shutdown.clone(),
                self.in_flight.clone(),
                self.restart_backoff,
            )));
        }

        self.shutdown.cancelled().await;
        info!("shutdown requested; draining consumers");
        self.drain().await;

        for mut handle in handles {
            match timeout(self.drain_poll, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    error!(error = %join_err, "consumer supervision task panicked")
                }
                Err(_) => {
                    handle.abort();
                    let _ = handle.await;
                }
            }
        }
        info!("worker host stopped");
    }

    /// Polls the shared in-flight counter until it reaches zero or the
    /// drain window closes. Deliveries still unacknowledged past the window
    /// go back to the broker for redelivery elsewhere.
    async fn drain(&self) {
        let deadline = Instant::now() + self.drain_timeout;
        while !self.in_flight.is_idle() {
            if Instant::now() >= deadline {
                warn!(
                    in_flight = self.in_flight.count(),
                    "drain timeout reached; releasing remaining deliveries to the broker"
                );
                return;
            }
            sleep(self.drain_poll).await;
        }
        info!("all in-flight deliveries drained");
    }
}

async fn supervise(
    runner: Arc<dyn ConsumerRunner>,
    shutdown: CancellationToken,
    in_flight: InFlight,
    restart_backoff: Duration,
) {
    loop {
        info!(consumer = runner.name(), "starting consumer");
        match runner.run(shutdown.clone(), in_flight.clone()).await {
            Ok(()) => {
                info!(consumer = runner.name(), "consumer finished");
                return;
            }
            Err(err) => {
                if shutdown.is_cancelled() {
                    warn!(
                        consumer = runner.name(),
                        error = %err,
                        "consumer failed during shutdown"
                    );
                    return;
                }
                // Connectivity, not data: restart indefinitely.
                error!(
                    consumer = runner.name(),
                    error = %err,
                    backoff_secs = restart_backoff.as_secs(),
                    "consumer failed; restarting after backoff"
                );
                tokio::select! {
                    () = shutdown.cancelled() => return,
                    () = sleep(restart_backoff) => {}
                }
            }
        }
    }
}
