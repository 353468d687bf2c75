use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use feeder_common::config::NotificationConfig;
use feeder_common::queue::SqsSettings;
use feeder_common::retry::RetryPolicy;
use thiserror::Error;

use crate::processors::ProcessorKind;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("PERSIST_PATH is required when PERSIST_MESSAGES is enabled")]
    MissingPersistPath,
    #[error("MESSAGE_PROCESSORS must name at least one processor")]
    NoProcessors,
    #[error("MAX_CONCURRENT_MESSAGES must be positive")]
    NoConcurrency,
    #[error("{name} must be between {min} and {max}, got {value}")]
    OutOfRange {
        name: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },
}

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    pub queue_name: NonEmptyString,

    #[envconfig(default = "us-east-1")]
    pub aws_region: String,

    pub sqs_endpoint: Option<String>,

    pub access_key: Option<String>,

    pub secret_key: Option<String>,

    /// Seconds a received message stays invisible to other consumers.
    #[envconfig(default = "30")]
    pub visibility_timeout: u32,

    /// Seconds a receive call waits for messages to arrive.
    #[envconfig(default = "20")]
    pub wait_time: u32,

    #[envconfig(default = "10")]
    pub max_messages: u32,

    #[envconfig(default = "false")]
    pub raw_messages: bool,

    #[envconfig(default = "false")]
    pub persist_messages: bool,

    pub persist_path: Option<String>,

    #[envconfig(default = ".json")]
    pub persist_extension: String,

    #[envconfig(default = "100")]
    pub poll_interval: EnvMsDuration,

    #[envconfig(default = "5000")]
    pub request_timeout: EnvMsDuration,

    #[envconfig(default = "64")]
    pub max_concurrent_messages: usize,

    #[envconfig(default = "photoRegistry")]
    pub message_processors: ProcessorKindList,

    pub feed_config_path: Option<String>,

    #[envconfig(nested = true)]
    pub retry_policy: RetryPolicyConfig,

    #[envconfig(nested = true)]
    pub notification: NotificationSettings,

    #[envconfig(nested = true)]
    pub photo_registry: PhotoRegistryConfig,

    #[envconfig(nested = true)]
    pub counting: CountingConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check settings that depend on each other or on the queue's limits.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.persist_messages && self.persist_path.as_deref().map_or(true, str::is_empty) {
            return Err(ConfigError::MissingPersistPath);
        }
        if self.message_processors.0.is_empty() {
            return Err(ConfigError::NoProcessors);
        }
        if self.max_concurrent_messages == 0 {
            return Err(ConfigError::NoConcurrency);
        }
        check_range("MAX_MESSAGES", self.max_messages, 1, 10)?;
        check_range("WAIT_TIME", self.wait_time, 0, 20)?;
        check_range("VISIBILITY_TIMEOUT", self.visibility_timeout, 0, 43_200)?;

        Ok(())
    }

    pub fn sqs_settings(&self) -> SqsSettings {
        SqsSettings {
            queue_name: self.queue_name.as_str().to_owned(),
            region: self.aws_region.clone(),
            endpoint: self.sqs_endpoint.clone(),
            access_key_id: self.access_key.clone(),
            secret_access_key: self.secret_key.clone(),
        }
    }
}

fn check_range(name: &'static str, value: u32, min: u32, max: u32) -> Result<(), ConfigError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            name,
            value: value.into(),
            min: min.into(),
            max: max.into(),
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Envconfig, Clone)]
pub struct RetryPolicyConfig {
    #[envconfig(default = "2")]
    pub backoff_coefficient: u32,

    #[envconfig(default = "500")]
    pub initial_interval: EnvMsDuration,

    pub maximum_interval: Option<EnvMsDuration>,
}

impl RetryPolicyConfig {
    pub fn provide(&self) -> RetryPolicy {
        let builder = RetryPolicy::build(self.backoff_coefficient, self.initial_interval.0);
        match self.maximum_interval {
            Some(maximum) => builder.maximum_interval(maximum.0).provide(),
            None => builder.provide(),
        }
    }
}

#[derive(Envconfig, Clone)]
pub struct NotificationSettings {
    #[envconfig(default = "3")]
    pub default_retries: u32,

    #[envconfig(default = "5")]
    pub reingest_retries: u32,

    #[envconfig(default = "true")]
    pub populate_missing_etag: bool,

    #[envconfig(default = "http://localhost:8080/items/{item_id}")]
    pub item_url_template: String,

    #[envconfig(default = "tag:pipelineingestion.ap.org")]
    pub feed_id_namespace: String,
}

impl From<&NotificationSettings> for NotificationConfig {
    fn from(settings: &NotificationSettings) -> Self {
        NotificationConfig {
            default_retries: settings.default_retries,
            reingest_retries: settings.reingest_retries,
            populate_missing_etag: settings.populate_missing_etag,
            item_url_template: settings.item_url_template.clone(),
            feed_id_namespace: settings.feed_id_namespace.clone(),
        }
    }
}

#[derive(Envconfig, Clone)]
pub struct PhotoRegistryConfig {
    #[envconfig(default = "http://localhost:8080/media")]
    pub mapi_base_url: String,

    #[envconfig(default = "http://localhost:8081/hash")]
    pub hash_service_url: String,

    #[envconfig(default = "http://localhost:8082/register")]
    pub ledger_url: String,

    /// Product ids a notification must carry at least one of. Unset passes everything.
    pub product_ids: Option<ProductIdList>,

    /// Acknowledge messages whose hash or registration call failed.
    #[envconfig(default = "true")]
    pub ack_on_downstream_error: bool,
}

#[derive(Envconfig, Clone)]
pub struct CountingConfig {
    #[envconfig(from = "COUNTING_EXPECTED_COUNT")]
    pub expected_count: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}

/// A comma separated list of integer product ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductIdList(pub Vec<i64>);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseProductIdListError(pub String);

impl FromStr for ProductIdList {
    type Err = ParseProductIdListError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split(',')
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(|token| {
                token
                    .parse::<i64>()
                    .map_err(|_| ParseProductIdListError(token.to_owned()))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(ProductIdList)
    }
}

/// A comma separated list of processor kinds, in the order they are created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorKindList(pub Vec<ProcessorKind>);

impl FromStr for ProcessorKindList {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split(',')
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(ProcessorKind::from_str)
            .collect::<Result<Vec<_>, _>>()
            .map(ProcessorKindList)
    }
}
