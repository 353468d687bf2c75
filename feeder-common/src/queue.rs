//! # Queue
//!
//! The managed message queue the feeder consumes from. Receive and delete semantics are
//! delegated to the queue service; this module only shapes its messages.
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_sqs::config::{Credentials, Region};
use aws_sdk_sqs::error::DisplayErrorContext;
use aws_sdk_sqs::Client;
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("failed to resolve url of queue {queue}: {error}")]
    Resolve { queue: String, error: String },
    #[error("failed to receive messages from {queue}: {error}")]
    Receive { queue: String, error: String },
    #[error("failed to delete message {message_id} from {queue}: {error}")]
    Delete {
        queue: String,
        message_id: String,
        error: String,
    },
    #[error("message {0} has no receipt handle")]
    MissingReceiptHandle(String),
}

/// A message as delivered by the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct QueueMessage {
    pub message_id: Option<String>,
    pub receipt_handle: Option<String>,
    #[serde(default)]
    pub body: String,
}

impl QueueMessage {
    pub fn id(&self) -> &str {
        self.message_id.as_deref().unwrap_or("unknown")
    }
}

/// What message processors receive: the whole envelope, or only its body in raw mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessagePayload {
    Raw(String),
    Envelope(QueueMessage),
}

impl MessagePayload {
    pub fn new(message: QueueMessage, raw: bool) -> Self {
        match raw {
            true => MessagePayload::Raw(message.body),
            false => MessagePayload::Envelope(message),
        }
    }

    /// Message id used in logs; raw payloads carry none.
    pub fn message_id(&self) -> &str {
        match self {
            MessagePayload::Raw(_) => "raw",
            MessagePayload::Envelope(message) => message.id(),
        }
    }
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    fn name(&self) -> &str;

    /// Receive up to `max_messages`, waiting at most `wait_time_seconds` for the first.
    /// Received messages stay invisible to other consumers for `visibility_timeout_seconds`.
    async fn receive(
        &self,
        max_messages: i32,
        wait_time_seconds: i32,
        visibility_timeout_seconds: i32,
    ) -> Result<Vec<QueueMessage>, QueueError>;

    /// Delete a fully processed message so it is not delivered again.
    async fn acknowledge(&self, message: &QueueMessage) -> Result<(), QueueError>;
}

/// Connection settings for an SQS queue.
#[derive(Debug, Clone)]
pub struct SqsSettings {
    pub queue_name: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

#[derive(Clone)]
pub struct SqsQueue {
    client: Client,
    name: String,
    url: String,
}

impl SqsQueue {
    /// Build a client and resolve the queue url from its name.
    ///
    /// Explicit credentials take precedence over the default provider chain.
    pub async fn connect(settings: SqsSettings) -> Result<Self, QueueError> {
        let region = Region::new(settings.region.clone());
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(region.clone())
            .load()
            .await;

        let mut builder = aws_sdk_sqs::config::Builder::from(&aws_config).region(region);
        if let Some(endpoint) = &settings.endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        if let (Some(access_key), Some(secret_key)) =
            (&settings.access_key_id, &settings.secret_access_key)
        {
            let credentials = Credentials::new(access_key, secret_key, None, None, "env");
            builder = builder.credentials_provider(credentials);
        }
        let client = Client::from_conf(builder.build());

        let url = client
            .get_queue_url()
            .queue_name(&settings.queue_name)
            .send()
            .await
            .map_err(|error| QueueError::Resolve {
                queue: settings.queue_name.clone(),
                error: DisplayErrorContext(&error).to_string(),
            })?
            .queue_url()
            .map(str::to_owned)
            .ok_or_else(|| QueueError::Resolve {
                queue: settings.queue_name.clone(),
                error: "response has no queue url".to_owned(),
            })?;

        info!(queue = %settings.queue_name, %url, "resolved queue url");

        Ok(Self {
            client,
            name: settings.queue_name,
            url,
        })
    }
}

#[async_trait]
impl MessageQueue for SqsQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn receive(
        &self,
        max_messages: i32,
        wait_time_seconds: i32,
        visibility_timeout_seconds: i32,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let output = self
            .client
            .receive_message()
            .queue_url(&self.url)
            .max_number_of_messages(max_messages)
            .wait_time_seconds(wait_time_seconds)
            .visibility_timeout(visibility_timeout_seconds)
            .send()
            .await
            .map_err(|error| QueueError::Receive {
                queue: self.name.clone(),
                error: DisplayErrorContext(&error).to_string(),
            })?;

        let messages: Vec<QueueMessage> = output
            .messages()
            .iter()
            .map(|message| QueueMessage {
                message_id: message.message_id().map(str::to_owned),
                receipt_handle: message.receipt_handle().map(str::to_owned),
                body: message.body().unwrap_or_default().to_owned(),
            })
            .collect();

        debug!(queue = %self.name, count = messages.len(), "received messages");

        Ok(messages)
    }

    async fn acknowledge(&self, message: &QueueMessage) -> Result<(), QueueError> {
        let receipt_handle = message
            .receipt_handle
            .as_deref()
            .ok_or_else(|| QueueError::MissingReceiptHandle(message.id().to_owned()))?;

        self.client
            .delete_message()
            .queue_url(&self.url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|error| QueueError::Delete {
                queue: self.name.clone(),
                message_id: message.id().to_owned(),
                error: DisplayErrorContext(&error).to_string(),
            })?;

        Ok(())
    }
}
