//! Fan one message out to every processor.
use std::sync::Arc;

use feeder_common::queue::MessagePayload;
use futures::stream::{FuturesUnordered, StreamExt};
use tracing::warn;

use crate::error::DispatchError;
use crate::processors::MessageProcessor;

pub struct Dispatcher {
    processors: Vec<Arc<dyn MessageProcessor>>,
}

impl Dispatcher {
    pub fn new(processors: Vec<Arc<dyn MessageProcessor>>) -> Self {
        Self { processors }
    }

    /// Run every processor on `payload` concurrently and wait for all of them.
    ///
    /// A failing processor does not cancel the others. The first failure to complete is
    /// returned; later ones are only logged.
    pub async fn dispatch(&self, payload: &MessagePayload) -> Result<(), DispatchError> {
        let mut running: FuturesUnordered<_> = self
            .processors
            .iter()
            .map(|processor| async move {
                processor
                    .process_message(payload)
                    .await
                    .map_err(|error| DispatchError {
                        processor: processor.name(),
                        error,
                    })
            })
            .collect();

        let mut first_failure = None;
        while let Some(result) = running.next().await {
            if let Err(failure) = result {
                match first_failure {
                    None => first_failure = Some(failure),
                    Some(_) => warn!(
                        message_id = payload.message_id(),
                        "another processor also failed: {}", failure
                    ),
                }
            }
        }

        match first_failure {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }
}
