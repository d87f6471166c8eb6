#![allow(clippy::missing_docs_in_private_items)]

pub mod consumers;
pub mod pipeline;
pub mod retry;
pub mod worker;

pub use pipeline::{
    DefaultPipelineServices, DocumentProcessor, PipelineError, PipelineServices, PipelineTuning,
};
pub use retry::{RetryOutcome, RetryPolicy};
pub use worker::{ConsumerRunner, QueueConsumerRunner, WorkerHost};
