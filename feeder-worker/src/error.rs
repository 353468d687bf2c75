use feeder_common::notification::RetrievalError;
use feeder_common::queue::QueueError;
use feeder_common::xml::ParseError;
use thiserror::Error;

use crate::pipeline::Stage;

/// Errors that stop the worker itself, rather than a single message.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("the queue failed: {0}")]
    QueueError(#[from] QueueError),
    #[error("failed to initialize processor {processor}: {error}")]
    ProcessorInitError {
        processor: &'static str,
        error: ProcessorError,
    },
}

/// A hash or registration call failed.
#[derive(Error, Debug)]
pub enum DownstreamError {
    #[error("request to {url} failed: {error}")]
    RequestError { url: String, error: reqwest::Error },
    #[error("{url} responded with status {status}: {body}")]
    StatusError {
        url: String,
        status: http::StatusCode,
        body: String,
    },
    #[error("failed to serialize record: {0}")]
    SerializeError(#[from] serde_json::Error),
}

/// Why a pipeline stage failed.
#[derive(Error, Debug)]
pub enum StageError {
    #[error(transparent)]
    Retrieval(#[from] RetrievalError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Downstream(#[from] DownstreamError),
}

/// A pipeline stopped at `stage` for the given item.
#[derive(Error, Debug)]
#[error("{stage} failed for item {item_id} version {version}: {cause}")]
pub struct PipelineFailure {
    pub stage: Stage,
    pub item_id: String,
    pub version: String,
    #[source]
    pub cause: StageError,
}

/// Errors raised by a message processor.
#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error("message body is not a valid envelope: {0}")]
    InvalidEnvelope(#[source] serde_json::Error),
    #[error("failed to parse notification: {0}")]
    Notification(#[from] ParseError),
    #[error(transparent)]
    Pipeline(#[from] Box<PipelineFailure>),
    #[error("processor is misconfigured: {0}")]
    Configuration(String),
}

impl From<PipelineFailure> for ProcessorError {
    fn from(failure: PipelineFailure) -> Self {
        ProcessorError::Pipeline(Box::new(failure))
    }
}

/// The first processor failure of a dispatch.
#[derive(Error, Debug)]
#[error("processor {processor} failed: {error}")]
pub struct DispatchError {
    pub processor: &'static str,
    #[source]
    pub error: ProcessorError,
}
