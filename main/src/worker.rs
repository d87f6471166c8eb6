use std::sync::Arc;

use broker::{declare_topology, BrokerSettings, Publisher, QueueBinding};
use common::{
    storage::{
        documents::{DocumentRepository, InMemoryDocumentRepository},
        store::StorageManager,
        vector::{InMemoryVectorStore, VectorStore},
    },
    utils::{config::get_config, embedding::EmbeddingProvider, realtime::LogNotifier},
};
use ingestion_pipeline::{
    consumers::{TranscriptionHandler, UploadHandler},
    pipeline::{DefaultPipelineServices, DocumentProcessor, PipelineTuning},
    worker::QueueConsumerRunner,
    RetryPolicy, WorkerHost,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set up tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let config = get_config()?;
    let settings = BrokerSettings::new(config.amqp_url(), config.exchange_name.clone());

    // Topology is a startup precondition for the whole pipeline; any broker
    // error here aborts the process.
    declare_topology(
        &settings,
        &[
            QueueBinding::new(&config.upload_queue, &config.upload_routing_key),
            QueueBinding::new(
                &config.transcribe_request_queue,
                &config.transcribe_request_routing_key,
            ),
            QueueBinding::new(
                &config.transcribe_completed_queue,
                &config.transcribe_completed_routing_key,
            ),
        ],
    )
    .await?;

    let storage = StorageManager::new(&config).await?;
    let repository: Arc<dyn DocumentRepository> = Arc::new(InMemoryDocumentRepository::new());
    let vector_store: Arc<dyn VectorStore> = Arc::new(InMemoryVectorStore::new());
    let embedding_provider = Arc::new(EmbeddingProvider::from_config(&config)?);
    info!(
        embedding_backend = embedding_provider.backend_label(),
        embedding_dimension = embedding_provider.dimension(),
        "Embedding provider initialized"
    );
    let notifier = Arc::new(LogNotifier);

    let services = Arc::new(DefaultPipelineServices::new(
        storage.clone(),
        vector_store,
        embedding_provider,
        PipelineTuning::default(),
        config.vector_collection_prefix.clone(),
    ));
    let processor = Arc::new(DocumentProcessor::new(
        Arc::clone(&repository),
        services,
        notifier.clone(),
    ));

    let publisher = Arc::new(Publisher::connect(&settings).await?);

    let shutdown = CancellationToken::new();
    let host = WorkerHost::from_config(&config, shutdown.clone());

    let upload_handler = Arc::new(UploadHandler::new(
        Arc::clone(&processor),
        publisher.clone(),
        config.transcribe_request_routing_key.clone(),
    ));
    let transcription_handler = Arc::new(TranscriptionHandler::new(
        processor,
        repository,
        storage,
        publisher,
        notifier,
        RetryPolicy::from_config(&config),
        config.transcribe_completed_routing_key.clone(),
        shutdown.clone(),
    ));

    let runners = vec![
        QueueConsumerRunner::boxed(
            "upload-consumer",
            settings.clone(),
            config.upload_queue.clone(),
            upload_handler,
        ),
        QueueConsumerRunner::boxed(
            "transcription-consumer",
            settings.clone(),
            config.transcribe_completed_queue.clone(),
            transcription_handler,
        ),
    ];

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(error = %err, "failed to listen for shutdown signal");
                return;
            }
            info!("shutdown signal received");
            shutdown.cancel();
        }
    });

    info!("Starting worker process");
    host.run(runners).await;

    Ok(())
}
