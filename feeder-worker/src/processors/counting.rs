use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use feeder_common::queue::MessagePayload;
use tokio::sync::Notify;
use tracing::info;

use super::MessageProcessor;
use crate::error::ProcessorError;

/// Counts messages, waking waiters once an expected number has been seen.
#[derive(Debug, Default)]
pub struct CountingProcessor {
    count: AtomicUsize,
    expected: Option<usize>,
    reached: Notify,
}

impl CountingProcessor {
    pub fn new(expected: Option<usize>) -> Self {
        Self {
            count: AtomicUsize::new(0),
            expected,
            reached: Notify::new(),
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Resolve once the expected count has been reached. Never resolves without one.
    pub async fn wait_for_expected(&self) {
        let Some(expected) = self.expected else {
            return std::future::pending().await;
        };

        loop {
            let notified = self.reached.notified();
            if self.count() >= expected {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl MessageProcessor for CountingProcessor {
    fn name(&self) -> &'static str {
        "counting"
    }

    async fn initialize(&self) -> Result<(), ProcessorError> {
        match self.expected {
            Some(0) => Err(ProcessorError::Configuration(
                "expected message count must be positive".to_owned(),
            )),
            _ => Ok(()),
        }
    }

    async fn process_message(&self, payload: &MessagePayload) -> Result<(), ProcessorError> {
        let count = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        info!(message_id = payload.message_id(), count, "counted message");

        if self.expected == Some(count) {
            info!(count, "expected message count reached");
            self.reached.notify_waiters();
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_counts_every_message() {
        let processor = CountingProcessor::new(None);

        for _ in 0..3 {
            processor
                .process_message(&MessagePayload::Raw("<feed/>".to_owned()))
                .await
                .unwrap();
        }

        assert_eq!(processor.count(), 3);
    }

    #[tokio::test]
    async fn test_zero_expected_count_is_rejected() {
        assert!(CountingProcessor::new(Some(0)).initialize().await.is_err());
        assert!(CountingProcessor::new(Some(1)).initialize().await.is_ok());
    }

    #[tokio::test]
    async fn test_wakes_waiter_at_expected_count() {
        let processor = Arc::new(CountingProcessor::new(Some(2)));
        let waiter = tokio::spawn({
            let processor = processor.clone();
            async move { processor.wait_for_expected().await }
        });

        for _ in 0..2 {
            processor
                .process_message(&MessagePayload::Raw("<feed/>".to_owned()))
                .await
                .unwrap();
        }

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter was not woken")
            .unwrap();
    }
}
