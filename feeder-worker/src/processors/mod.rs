//! Message processors, created by kind name at startup.
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use feeder_common::notification::NotificationService;
use feeder_common::queue::MessagePayload;
use tracing::info;

use crate::config::{CountingConfig, PhotoRegistryConfig};
use crate::error::{ProcessorError, WorkerError};
use crate::mapper::PhotoMapper;
use crate::pipeline::PhotoPipeline;
use crate::registry::{HttpHashService, HttpLedger};

pub mod counting;
pub mod photo_registry;

pub use counting::CountingProcessor;
pub use photo_registry::PhotoRegistryProcessor;

/// Handles every message received from the queue.
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Called once, in order, before any message is processed.
    async fn initialize(&self) -> Result<(), ProcessorError> {
        Ok(())
    }

    async fn process_message(&self, payload: &MessagePayload) -> Result<(), ProcessorError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorKind {
    PhotoRegistry,
    Counting,
}

impl FromStr for ProcessorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "photoregistry" => Ok(ProcessorKind::PhotoRegistry),
            "counting" => Ok(ProcessorKind::Counting),
            _ => Err(format!("unknown message processor: {}", s)),
        }
    }
}

/// Initialized processors, in configured order.
pub struct Processors {
    pub all: Vec<Arc<dyn MessageProcessor>>,
    /// Set when a counting processor is configured.
    pub counting: Option<Arc<CountingProcessor>>,
}

/// Everything processors may need to be built.
#[derive(Clone)]
pub struct ProcessorFactory {
    pub service: NotificationService,
    pub http_client: reqwest::Client,
    pub photo_registry: PhotoRegistryConfig,
    pub counting: CountingConfig,
}

impl ProcessorFactory {
    pub fn create(&self, kind: ProcessorKind) -> Arc<dyn MessageProcessor> {
        match kind {
            ProcessorKind::PhotoRegistry => {
                let config = &self.photo_registry;
                let pipeline = PhotoPipeline::new(
                    self.service.clone(),
                    PhotoMapper::new(self.service.feed(), &config.mapi_base_url),
                    Arc::new(HttpHashService::new(
                        self.http_client.clone(),
                        &config.hash_service_url,
                    )),
                    Arc::new(HttpLedger::new(self.http_client.clone(), &config.ledger_url)),
                    config.product_ids.as_ref().map(|ids| ids.0.clone()),
                );
                Arc::new(PhotoRegistryProcessor::new(
                    pipeline,
                    config.ack_on_downstream_error,
                ))
            }
            ProcessorKind::Counting => self.create_counting(),
        }
    }

    fn create_counting(&self) -> Arc<CountingProcessor> {
        Arc::new(CountingProcessor::new(self.counting.expected_count))
    }

    /// Create and initialize processors in order. The first initialization failure aborts.
    pub async fn create_all(
        &self,
        kinds: &[ProcessorKind],
    ) -> Result<Processors, WorkerError> {
        let mut processors = Processors {
            all: Vec::with_capacity(kinds.len()),
            counting: None,
        };

        for kind in kinds {
            let processor: Arc<dyn MessageProcessor> = match kind {
                ProcessorKind::Counting => {
                    let counting = self.create_counting();
                    processors.counting = Some(counting.clone());
                    counting
                }
                _ => self.create(*kind),
            };
            processor
                .initialize()
                .await
                .map_err(|error| WorkerError::ProcessorInitError {
                    processor: processor.name(),
                    error,
                })?;
            info!(processor = processor.name(), "initialized message processor");
            processors.all.push(processor);
        }

        Ok(processors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::tests::service;

    fn factory() -> ProcessorFactory {
        ProcessorFactory {
            service: service(),
            http_client: reqwest::Client::new(),
            photo_registry: PhotoRegistryConfig {
                mapi_base_url: "http://mapi".to_owned(),
                hash_service_url: "http://hash".to_owned(),
                ledger_url: "http://ledger".to_owned(),
                product_ids: None,
                ack_on_downstream_error: true,
            },
            counting: CountingConfig {
                expected_count: None,
            },
        }
    }

    #[test]
    fn test_kind_names_are_case_insensitive() {
        assert_eq!("photoRegistry".parse(), Ok(ProcessorKind::PhotoRegistry));
        assert_eq!("PHOTOREGISTRY".parse(), Ok(ProcessorKind::PhotoRegistry));
        assert_eq!("Counting".parse(), Ok(ProcessorKind::Counting));
        assert!("spreadsheet".parse::<ProcessorKind>().is_err());
    }

    #[tokio::test]
    async fn test_create_all_keeps_order() {
        let processors = factory()
            .create_all(&[ProcessorKind::Counting, ProcessorKind::PhotoRegistry])
            .await
            .unwrap();

        let names: Vec<&str> = processors.all.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["counting", "photoRegistry"]);
        assert!(processors.counting.is_some());
    }

    #[tokio::test]
    async fn test_counting_handle_is_absent_without_counting_processor() {
        let processors = factory()
            .create_all(&[ProcessorKind::PhotoRegistry])
            .await
            .unwrap();

        assert!(processors.counting.is_none());
    }

    #[tokio::test]
    async fn test_failed_initialization_aborts() {
        let mut factory = factory();
        factory.counting = CountingConfig {
            expected_count: Some(0),
        };

        let result = factory
            .create_all(&[ProcessorKind::PhotoRegistry, ProcessorKind::Counting])
            .await;

        assert!(matches!(
            result,
            Err(WorkerError::ProcessorInitError {
                processor: "counting",
                error: ProcessorError::Configuration(_),
            })
        ));
    }
}
