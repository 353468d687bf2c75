use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time;

use feeder_common::health::HealthHandle;
use feeder_common::queue::{MessagePayload, MessageQueue, QueueMessage};
use tokio::sync;
use tracing::{error, info, info_span, warn, Instrument};

use crate::dispatch::Dispatcher;

/// Queue receive settings.
#[derive(Debug, Clone)]
pub struct ReceiveSettings {
    pub max_messages: u32,
    pub wait_time: u32,
    pub visibility_timeout: u32,
    /// Hand processors the message body only, instead of the whole envelope.
    pub raw_messages: bool,
}

/// Writes every received payload to a directory before it is processed.
#[derive(Debug, Clone)]
pub struct MessagePersistence {
    directory: PathBuf,
    extension: String,
}

impl MessagePersistence {
    /// `directory` may start with `~`, standing for the home directory.
    pub fn new(directory: &str, extension: &str) -> Self {
        Self {
            directory: expand_home(directory),
            extension: extension.to_owned(),
        }
    }

    /// File name for a message: its id without dashes, or a random id in raw mode.
    fn file_name(&self, message: &QueueMessage, raw: bool) -> String {
        let id = match (&message.message_id, raw) {
            (Some(id), false) => id.clone(),
            _ => uuid::Uuid::new_v4().to_string(),
        };
        format!("{}{}", id.replace('-', ""), self.extension)
    }

    pub async fn persist(&self, message: &QueueMessage, raw: bool) -> std::io::Result<PathBuf> {
        let contents = match raw {
            true => message.body.clone(),
            false => serde_json::to_string(message)?,
        };
        let path = self.directory.join(self.file_name(message, raw));

        tokio::fs::create_dir_all(&self.directory).await?;
        tokio::fs::write(&path, contents).await?;

        Ok(path)
    }
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix('~'), std::env::var_os("HOME")) {
        (Some(rest), Some(home)) => Path::new(&home).join(rest.trim_start_matches('/')),
        _ => PathBuf::from(path),
    }
}

/// What happened to one received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageOutcome {
    /// The message was deleted from the queue.
    pub acknowledged: bool,
    /// Handling finished after the visibility timeout had elapsed since receipt.
    pub overran_visibility: bool,
}

fn exceeded_visibility(elapsed: time::Duration, visibility_timeout: time::Duration) -> bool {
    elapsed > visibility_timeout
}

/// Polls the queue and dispatches each message on its own task.
pub struct QueueWorker {
    queue: Arc<dyn MessageQueue>,
    dispatcher: Arc<Dispatcher>,
    settings: ReceiveSettings,
    persistence: Option<MessagePersistence>,
    /// The interval for polling the queue.
    poll_interval: time::Duration,
    max_concurrent_messages: usize,
    liveness: HealthHandle,
}

impl QueueWorker {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        dispatcher: Arc<Dispatcher>,
        settings: ReceiveSettings,
        persistence: Option<MessagePersistence>,
        poll_interval: time::Duration,
        max_concurrent_messages: usize,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            queue,
            dispatcher,
            settings,
            persistence,
            poll_interval,
            max_concurrent_messages,
            liveness,
        }
    }

    /// Receive and dispatch messages until the task is dropped.
    pub async fn run(&self) {
        let semaphore = Arc::new(sync::Semaphore::new(self.max_concurrent_messages));
        let report_semaphore_utilization = || {
            metrics::gauge!("feeder_worker_saturation_percent").set(
                1f64 - semaphore.available_permits() as f64 / self.max_concurrent_messages as f64,
            );
        };
        let mut interval = tokio::time::interval(self.poll_interval);

        loop {
            interval.tick().await;
            self.liveness.report_healthy();
            report_semaphore_utilization();

            // Handles are detached: each task acknowledges its own message.
            let _handles = self.poll(&semaphore).await;
        }
    }

    /// Receive one batch and spawn a task per message. Receive errors are logged.
    pub async fn poll(
        &self,
        semaphore: &Arc<sync::Semaphore>,
    ) -> Vec<tokio::task::JoinHandle<MessageOutcome>> {
        let messages = match self
            .queue
            .receive(
                to_i32(self.settings.max_messages),
                to_i32(self.settings.wait_time),
                to_i32(self.settings.visibility_timeout),
            )
            .await
        {
            Ok(messages) => messages,
            Err(error) => {
                error!("error receiving messages: {}", error);
                metrics::counter!("feeder_receive_errors_total").increment(1);
                return Vec::new();
            }
        };

        // Visibility timeouts run from receipt, including time spent waiting for a permit.
        let received = tokio::time::Instant::now();
        let mut handles = Vec::with_capacity(messages.len());
        for message in messages {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                error!("message semaphore has been closed");
                break;
            };
            metrics::counter!("feeder_messages_received_total").increment(1);

            let task = MessageTask {
                queue: self.queue.clone(),
                dispatcher: self.dispatcher.clone(),
                persistence: self.persistence.clone(),
                raw: self.settings.raw_messages,
                received,
                visibility_timeout: time::Duration::from_secs(self.settings.visibility_timeout.into()),
            };
            handles.push(tokio::spawn(async move {
                let outcome = task.process(message).await;
                drop(permit);
                outcome
            }));
        }

        handles
    }
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

struct MessageTask {
    queue: Arc<dyn MessageQueue>,
    dispatcher: Arc<Dispatcher>,
    persistence: Option<MessagePersistence>,
    raw: bool,
    received: tokio::time::Instant,
    visibility_timeout: time::Duration,
}

impl MessageTask {
    /// Persist, dispatch and acknowledge one message.
    async fn process(self, message: QueueMessage) -> MessageOutcome {
        let span = info_span!("message", message_id = message.id(), queue = self.queue.name());
        async move {
            if let Some(persistence) = &self.persistence {
                match persistence.persist(&message, self.raw).await {
                    Ok(path) => info!(path = %path.display(), "persisted message"),
                    Err(error) => error!("failed to persist message: {}", error),
                }
            }

            let payload = MessagePayload::new(message.clone(), self.raw);
            let result = self.dispatcher.dispatch(&payload).await;

            let elapsed = self.received.elapsed();
            metrics::histogram!("feeder_message_processing_duration_seconds")
                .record(elapsed.as_secs_f64());
            let overran_visibility = exceeded_visibility(elapsed, self.visibility_timeout);
            if overran_visibility {
                warn!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    visibility_timeout_s = self.visibility_timeout.as_secs(),
                    "processing took longer than the visibility timeout, message may be delivered again"
                );
            }

            let acknowledged = match result {
                Ok(()) => match self.queue.acknowledge(&message).await {
                    Ok(()) => {
                        metrics::counter!("feeder_messages_processed_total").increment(1);
                        info!(elapsed_ms = elapsed.as_millis() as u64, "processed message");
                        true
                    }
                    Err(error) => {
                        error!("error deleting message: {}", error);
                        metrics::counter!("feeder_messages_failed_total").increment(1);
                        false
                    }
                },
                Err(error) => {
                    error!("error processing message, leaving it on the queue: {}", error);
                    metrics::counter!("feeder_messages_failed_total").increment(1);
                    false
                }
            };

            MessageOutcome {
                acknowledged,
                overran_visibility,
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use feeder_common::health::HealthRegistry;
    use feeder_common::queue::QueueError;

    use super::*;
    use crate::error::ProcessorError;
    use crate::processors::{CountingProcessor, MessageProcessor};

    #[derive(Default)]
    struct InMemoryQueue {
        pending: Mutex<VecDeque<QueueMessage>>,
        acknowledged: Mutex<Vec<String>>,
    }

    impl InMemoryQueue {
        fn with_messages(ids: &[&str]) -> Arc<Self> {
            let queue = Self::default();
            for id in ids {
                queue.pending.lock().unwrap().push_back(QueueMessage {
                    message_id: Some((*id).to_owned()),
                    receipt_handle: Some(format!("receipt-{}", id)),
                    body: format!("{{\"Message\": \"{}\"}}", id),
                });
            }
            Arc::new(queue)
        }
    }

    #[async_trait]
    impl MessageQueue for InMemoryQueue {
        fn name(&self) -> &str {
            "in-memory"
        }

        async fn receive(
            &self,
            max_messages: i32,
            _wait_time_seconds: i32,
            _visibility_timeout_seconds: i32,
        ) -> Result<Vec<QueueMessage>, QueueError> {
            let mut pending = self.pending.lock().unwrap();
            let count = pending.len().min(max_messages as usize);
            Ok(pending.drain(..count).collect())
        }

        async fn acknowledge(&self, message: &QueueMessage) -> Result<(), QueueError> {
            self.acknowledged
                .lock()
                .unwrap()
                .push(message.id().to_owned());
            Ok(())
        }
    }

    /// Fails messages whose body mentions `poison`.
    struct PoisonDetector;

    #[async_trait]
    impl MessageProcessor for PoisonDetector {
        fn name(&self) -> &'static str {
            "poison"
        }

        async fn process_message(&self, payload: &MessagePayload) -> Result<(), ProcessorError> {
            match payload {
                MessagePayload::Envelope(message) if message.body.contains("poison") => {
                    Err(ProcessorError::Configuration("poisoned".to_owned()))
                }
                _ => Ok(()),
            }
        }
    }

    /// Takes a fixed time per message.
    struct Slow(time::Duration);

    #[async_trait]
    impl MessageProcessor for Slow {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn process_message(&self, _payload: &MessagePayload) -> Result<(), ProcessorError> {
            tokio::time::sleep(self.0).await;
            Ok(())
        }
    }

    fn worker(
        queue: Arc<InMemoryQueue>,
        processors: Vec<Arc<dyn MessageProcessor>>,
        persistence: Option<MessagePersistence>,
        raw_messages: bool,
    ) -> QueueWorker {
        let registry = HealthRegistry::new("liveness");
        QueueWorker::new(
            queue,
            Arc::new(Dispatcher::new(processors)),
            ReceiveSettings {
                max_messages: 10,
                wait_time: 0,
                visibility_timeout: 30,
                raw_messages,
            },
            persistence,
            time::Duration::from_millis(10),
            4,
            registry.register("worker", ::time::Duration::seconds(30)),
        )
    }

    async fn outcomes(worker: &QueueWorker, permits: usize) -> Vec<MessageOutcome> {
        let semaphore = Arc::new(sync::Semaphore::new(permits));
        let mut outcomes = Vec::new();
        for handle in worker.poll(&semaphore).await {
            outcomes.push(handle.await.unwrap());
        }
        outcomes
    }

    async fn poll_and_wait(worker: &QueueWorker) -> Vec<bool> {
        outcomes(worker, 4)
            .await
            .into_iter()
            .map(|outcome| outcome.acknowledged)
            .collect()
    }

    #[tokio::test]
    async fn test_successful_messages_are_acknowledged() {
        let queue = InMemoryQueue::with_messages(&["m-1", "m-2"]);
        let counter = Arc::new(CountingProcessor::new(None));
        let worker = worker(queue.clone(), vec![counter.clone()], None, false);

        let results = poll_and_wait(&worker).await;

        assert_eq!(results, vec![true, true]);
        assert_eq!(counter.count(), 2);
        let mut acknowledged = queue.acknowledged.lock().unwrap().clone();
        acknowledged.sort();
        assert_eq!(acknowledged, vec!["m-1".to_owned(), "m-2".to_owned()]);
    }

    #[tokio::test]
    async fn test_failed_messages_stay_on_the_queue() {
        let queue = InMemoryQueue::with_messages(&["m-1", "poison"]);
        let worker = worker(queue.clone(), vec![Arc::new(PoisonDetector)], None, false);

        poll_and_wait(&worker).await;

        assert_eq!(
            queue.acknowledged.lock().unwrap().as_slice(),
            &["m-1".to_owned()]
        );
    }

    #[tokio::test]
    async fn test_empty_queue_spawns_nothing() {
        let queue = InMemoryQueue::with_messages(&[]);
        let worker = worker(queue, Vec::new(), None, false);

        assert!(poll_and_wait(&worker).await.is_empty());
    }

    #[tokio::test]
    async fn test_envelopes_are_persisted_by_message_id() {
        let directory = std::env::temp_dir().join(format!("feeder-{}", uuid::Uuid::new_v4()));
        let persistence = MessagePersistence::new(directory.to_str().unwrap(), ".json");
        let queue = InMemoryQueue::with_messages(&["a-b-c"]);
        let worker = worker(queue, Vec::new(), Some(persistence), false);

        poll_and_wait(&worker).await;

        let contents = std::fs::read_to_string(directory.join("abc.json")).unwrap();
        let persisted: QueueMessage = serde_json::from_str(&contents).unwrap();
        assert_eq!(persisted.id(), "a-b-c");
        std::fs::remove_dir_all(directory).unwrap();
    }

    #[tokio::test]
    async fn test_raw_bodies_are_persisted_under_random_names() {
        let directory = std::env::temp_dir().join(format!("feeder-{}", uuid::Uuid::new_v4()));
        let persistence = MessagePersistence::new(directory.to_str().unwrap(), ".xml");
        let queue = InMemoryQueue::with_messages(&["m-1"]);
        let worker = worker(queue, Vec::new(), Some(persistence), true);

        poll_and_wait(&worker).await;

        let files: Vec<PathBuf> = std::fs::read_dir(&directory)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect();
        assert_eq!(files.len(), 1);
        let name = files[0].file_name().unwrap().to_str().unwrap().to_owned();
        assert!(name.ends_with(".xml"));
        assert!(!name.contains('-'));
        assert_eq!(name.len(), 32 + ".xml".len());
        assert_eq!(
            std::fs::read_to_string(&files[0]).unwrap(),
            r#"{"Message": "m-1"}"#
        );
        std::fs::remove_dir_all(directory).unwrap();
    }

    #[test]
    fn test_visibility_is_exceeded_only_past_the_timeout() {
        let timeout = time::Duration::from_secs(30);

        assert!(!exceeded_visibility(time::Duration::from_secs(29), timeout));
        assert!(!exceeded_visibility(timeout, timeout));
        assert!(exceeded_visibility(time::Duration::from_millis(30_001), timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_for_a_permit_counts_towards_visibility() {
        let queue = InMemoryQueue::with_messages(&["m-1", "m-2"]);
        let slow: Arc<dyn MessageProcessor> = Arc::new(Slow(time::Duration::from_secs(20)));
        let worker = worker(queue.clone(), vec![slow], None, false);

        // One permit: the second message waits 20s, then takes 20s of its own.
        let outcomes = outcomes(&worker, 1).await;

        assert_eq!(
            outcomes,
            vec![
                MessageOutcome {
                    acknowledged: true,
                    overran_visibility: false,
                },
                MessageOutcome {
                    acknowledged: true,
                    overran_visibility: true,
                },
            ]
        );
    }

    #[test]
    fn test_expand_home() {
        let expanded = expand_home("~/feeder/messages");

        match std::env::var_os("HOME") {
            Some(home) => assert_eq!(expanded, Path::new(&home).join("feeder/messages")),
            None => assert_eq!(expanded, PathBuf::from("~/feeder/messages")),
        }
        assert_eq!(expand_home("/var/feeder"), PathBuf::from("/var/feeder"));
    }
}
