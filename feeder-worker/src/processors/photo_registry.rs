use async_trait::async_trait;
use feeder_common::queue::MessagePayload;
use serde_derive::Deserialize;
use tracing::{error, info, info_span, Instrument};

use super::MessageProcessor;
use crate::error::ProcessorError;
use crate::pipeline::PhotoPipeline;

/// The JSON document carried in the body of a queue envelope.
#[derive(Debug, Deserialize)]
struct EnvelopeBody {
    #[serde(rename = "Message")]
    message: String,
}

/// Registers photos announced by content notifications.
pub struct PhotoRegistryProcessor {
    pipeline: PhotoPipeline,
    /// Treat hash and registration failures as handled, so the message is deleted.
    ack_on_downstream_error: bool,
}

impl PhotoRegistryProcessor {
    pub fn new(pipeline: PhotoPipeline, ack_on_downstream_error: bool) -> Self {
        Self {
            pipeline,
            ack_on_downstream_error,
        }
    }
}

/// Extract notification markup from a queue payload.
fn notification_markup(payload: &MessagePayload) -> Result<String, ProcessorError> {
    match payload {
        MessagePayload::Raw(body) => Ok(body.clone()),
        MessagePayload::Envelope(message) => serde_json::from_str::<EnvelopeBody>(&message.body)
            .map(|body| body.message)
            .map_err(ProcessorError::InvalidEnvelope),
    }
}

#[async_trait]
impl MessageProcessor for PhotoRegistryProcessor {
    fn name(&self) -> &'static str {
        "photoRegistry"
    }

    async fn process_message(&self, payload: &MessagePayload) -> Result<(), ProcessorError> {
        let message_id = payload.message_id();
        let markup = notification_markup(payload)?;

        let mut notification = self
            .pipeline
            .service()
            .parse(message_id, &markup)
            .map_err(|error| {
                error!(message_id, "error creating notification: {}", error);
                error
            })?;

        let span = info_span!(
            "notification",
            message_id,
            feed_id = notification.feed_id().unwrap_or_default(),
            item_id = notification.item_id().unwrap_or_default(),
            version = notification.version().unwrap_or_default(),
        );

        async move {
            info!(
                filing_ids = %notification.filing_ids().join(","),
                "received notification"
            );

            match self.pipeline.run(&mut notification).await {
                Ok(outcome) => {
                    info!(?outcome, "processed notification");
                    Ok(())
                }
                Err(failure) if failure.stage.is_downstream() && self.ack_on_downstream_error => {
                    error!("{}", failure);
                    Ok(())
                }
                Err(failure) => {
                    error!("{}", failure);
                    Err(ProcessorError::from(failure))
                }
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use feeder_common::config::FeedConfig;
    use feeder_common::queue::QueueMessage;
    use httpmock::prelude::*;

    use super::*;
    use crate::mapper::PhotoMapper;
    use crate::pipeline::tests::{
        notification_markup as markup, service, FakeHasher, FakeLedger, PHOTO_APPL,
    };
    use crate::pipeline::Stage;

    fn envelope(markup: &str) -> MessagePayload {
        let body = serde_json::json!({ "Message": markup }).to_string();
        MessagePayload::Envelope(QueueMessage {
            message_id: Some("m-1".to_owned()),
            receipt_handle: Some("r-1".to_owned()),
            body,
        })
    }

    fn processor(
        hasher: Arc<FakeHasher>,
        ledger: Arc<FakeLedger>,
        ack_on_downstream_error: bool,
    ) -> PhotoRegistryProcessor {
        let pipeline = PhotoPipeline::new(
            service(),
            PhotoMapper::new(&FeedConfig::default(), "http://mapi"),
            hasher,
            ledger,
            None,
        );
        PhotoRegistryProcessor::new(pipeline, ack_on_downstream_error)
    }

    async fn appl_server() -> MockServer {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/items/abc123");
                then.status(200).body(PHOTO_APPL);
            })
            .await;
        server
    }

    #[tokio::test]
    async fn test_processes_envelope() {
        let server = appl_server().await;
        let ledger = Arc::new(FakeLedger::default());
        let processor = processor(Arc::default(), ledger.clone(), true);

        processor
            .process_message(&envelope(&markup(&server.url("/items/abc123"), "3")))
            .await
            .unwrap();

        assert_eq!(ledger.registrations.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_processes_raw_markup() {
        let server = appl_server().await;
        let ledger = Arc::new(FakeLedger::default());
        let processor = processor(Arc::default(), ledger.clone(), true);

        processor
            .process_message(&MessagePayload::Raw(markup(
                &server.url("/items/abc123"),
                "3",
            )))
            .await
            .unwrap();

        assert_eq!(ledger.registrations.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_envelope_fails() {
        let processor = processor(Arc::default(), Arc::default(), true);
        let payload = MessagePayload::Envelope(QueueMessage {
            message_id: Some("m-1".to_owned()),
            receipt_handle: None,
            body: "not json".to_owned(),
        });

        let result = processor.process_message(&payload).await;

        assert!(matches!(result, Err(ProcessorError::InvalidEnvelope(_))));
    }

    #[tokio::test]
    async fn test_malformed_notification_fails() {
        let processor = processor(Arc::default(), Arc::default(), true);

        let result = processor.process_message(&envelope("<feed>")).await;

        assert!(matches!(result, Err(ProcessorError::Notification(_))));
    }

    #[tokio::test]
    async fn test_downstream_failures_follow_ack_policy() {
        let server = appl_server().await;
        let payload = envelope(&markup(&server.url("/items/abc123"), "3"));
        let failing_hasher = || {
            Arc::new(FakeHasher {
                fail: true,
                ..FakeHasher::default()
            })
        };

        let acknowledging = processor(failing_hasher(), Arc::default(), true);
        assert!(acknowledging.process_message(&payload).await.is_ok());

        let retrying = processor(failing_hasher(), Arc::default(), false);
        match retrying.process_message(&payload).await {
            Err(ProcessorError::Pipeline(failure)) => assert_eq!(failure.stage, Stage::Hashing),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fetch_failures_are_never_acknowledged() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/items/abc123");
                then.status(404);
            })
            .await;
        let processor = processor(Arc::default(), Arc::default(), true);

        let result = processor
            .process_message(&envelope(&markup(&server.url("/items/abc123"), "3")))
            .await;

        assert!(matches!(result, Err(ProcessorError::Pipeline(_))));
    }
}
