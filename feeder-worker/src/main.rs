//! Consume content notifications from a queue and register photos.
use std::sync::Arc;

use envconfig::Envconfig;
use feeder_common::config::FeedConfig;
use feeder_common::fetch::DocumentFetcher;
use feeder_common::health::HealthRegistry;
use feeder_common::metrics::{serve, setup_metrics_router};
use feeder_common::notification::NotificationService;
use feeder_common::queue::SqsQueue;
use feeder_worker::config::Config;
use feeder_worker::dispatch::Dispatcher;
use feeder_worker::error::WorkerError;
use feeder_worker::processors::ProcessorFactory;
use feeder_worker::worker::{MessagePersistence, QueueWorker, ReceiveSettings};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::init_from_env().expect("Invalid configuration:");
    config.validate().expect("Invalid configuration:");

    let feed = match &config.feed_config_path {
        Some(path) => FeedConfig::from_json_file(path).expect("failed to load feed configuration"),
        None => FeedConfig::default(),
    };

    let fetcher = DocumentFetcher::new(config.request_timeout.0, config.retry_policy.provide())
        .expect("failed to construct document fetcher");
    let service = NotificationService::new(
        fetcher,
        Arc::new(feed),
        (&config.notification).into(),
    );
    let http_client = reqwest::Client::builder()
        .user_agent("Photo Registry Feeder")
        .timeout(config.request_timeout.0)
        .build()
        .expect("failed to construct http client");

    let factory = ProcessorFactory {
        service,
        http_client,
        photo_registry: config.photo_registry.clone(),
        counting: config.counting.clone(),
    };
    let processors = factory.create_all(&config.message_processors.0).await?;

    let liveness = HealthRegistry::new("liveness");
    let worker_liveness = liveness.register(
        "worker",
        time::Duration::seconds(i64::from(config.wait_time) + 30),
    );

    let queue = SqsQueue::connect(config.sqs_settings()).await?;
    let persistence = match (config.persist_messages, &config.persist_path) {
        (true, Some(path)) => Some(MessagePersistence::new(path, &config.persist_extension)),
        _ => None,
    };

    let worker = QueueWorker::new(
        Arc::new(queue),
        Arc::new(Dispatcher::new(processors.all)),
        ReceiveSettings {
            max_messages: config.max_messages,
            wait_time: config.wait_time,
            visibility_timeout: config.visibility_timeout,
            raw_messages: config.raw_messages,
        },
        persistence,
        config.poll_interval.0,
        config.max_concurrent_messages,
        worker_liveness,
    );

    let bind = config.bind();
    tokio::task::spawn(async move {
        let router = setup_metrics_router(liveness).expect("failed to install metrics recorder");
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    info!(queue = config.queue_name.as_str(), "starting queue worker");
    match processors.counting {
        Some(counting) => {
            tokio::select! {
                _ = worker.run() => {}
                _ = counting.wait_for_expected() => {
                    info!(count = counting.count(), "expected message count reached, stopping");
                }
            }
        }
        None => worker.run().await,
    }

    Ok(())
}
