//! The photo registry pipeline: filter, fetch, map, hash and register one notification.
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use feeder_common::notification::{Notification, NotificationService};
use tracing::{info, warn};

use crate::error::{PipelineFailure, StageError};
use crate::mapper::{Mapping, PhotoMapper};
use crate::registry::{HashService, Ledger};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fetching,
    Mapping,
    Hashing,
    Registering,
}

impl Stage {
    /// Hash and registration failures come from services outside the feeder.
    pub fn is_downstream(&self) -> bool {
        matches!(self, Stage::Hashing | Stage::Registering)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Fetching => "fetching",
            Stage::Mapping => "mapping",
            Stage::Hashing => "hashing",
            Stage::Registering => "registering",
        };
        f.write_str(name)
    }
}

/// How a pipeline that did not fail ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Registered { transaction: String },
    /// None of the notification's products are allowed.
    SkippedByFilter,
    /// The item is not a photo.
    NotApplicable,
}

impl Outcome {
    fn label(&self) -> &'static str {
        match self {
            Outcome::Registered { .. } => "registered",
            Outcome::SkippedByFilter => "filtered",
            Outcome::NotApplicable => "not_applicable",
        }
    }
}

#[derive(Clone)]
pub struct PhotoPipeline {
    service: NotificationService,
    mapper: PhotoMapper,
    hasher: Arc<dyn HashService>,
    ledger: Arc<dyn Ledger>,
    /// Unset lets every notification through.
    product_allowlist: Option<Vec<i64>>,
}

impl PhotoPipeline {
    pub fn new(
        service: NotificationService,
        mapper: PhotoMapper,
        hasher: Arc<dyn HashService>,
        ledger: Arc<dyn Ledger>,
        product_allowlist: Option<Vec<i64>>,
    ) -> Self {
        Self {
            service,
            mapper,
            hasher,
            ledger,
            product_allowlist,
        }
    }

    pub fn service(&self) -> &NotificationService {
        &self.service
    }

    pub async fn run(&self, notification: &mut Notification) -> Result<Outcome, PipelineFailure> {
        let started = Instant::now();
        let result = self.run_stages(notification).await;

        let elapsed = started.elapsed().as_secs_f64();
        match &result {
            Ok(outcome) => {
                let labels = [("outcome", outcome.label().to_owned())];
                metrics::counter!("photo_pipeline_completed_total", &labels).increment(1);
                metrics::histogram!("photo_pipeline_duration_seconds", &labels).record(elapsed);
            }
            Err(failure) => {
                let labels = [("stage", failure.stage.to_string())];
                metrics::counter!("photo_pipeline_failed_total", &labels).increment(1);
            }
        }

        result
    }

    async fn run_stages(&self, notification: &mut Notification) -> Result<Outcome, PipelineFailure> {
        let item_id = notification.item_id().unwrap_or_default().to_owned();
        let version = notification.version().unwrap_or_default().to_owned();
        let fail = |stage: Stage, cause: StageError| PipelineFailure {
            stage,
            item_id: item_id.clone(),
            version: version.clone(),
            cause,
        };

        if let Some(allowlist) = &self.product_allowlist {
            let matching = notification.matching_products(allowlist);
            if matching.is_empty() {
                info!(
                    products = ?notification.products(),
                    "no allowed products in notification, skipping"
                );
                return Ok(Outcome::SkippedByFilter);
            }
            info!(products = ?matching, "notification has allowed products");
        }

        let retries = self.service.config().default_retries;
        let appl = self
            .service
            .fetch_appl(notification, retries)
            .await
            .map_err(|error| fail(Stage::Fetching, error.into()))?;

        let record = match self
            .mapper
            .map(&appl.body, &item_id)
            .map_err(|error| fail(Stage::Mapping, error.into()))?
        {
            Mapping::Mapped(record) => record,
            Mapping::NotApplicable => return Ok(Outcome::NotApplicable),
        };

        let url = match record.url() {
            Some(url) => url.to_owned(),
            None => {
                warn!("mapped record has no url");
                String::new()
            }
        };
        let photo_hash = self
            .hasher
            .photo_hash(&url)
            .await
            .map_err(|error| fail(Stage::Hashing, error.into()))?;

        let json = record
            .to_json()
            .map_err(|error| fail(Stage::Registering, StageError::Downstream(error.into())))?;
        let transaction = self
            .ledger
            .register(&photo_hash, &json)
            .await
            .map_err(|error| fail(Stage::Registering, error.into()))?;

        info!(%transaction, "registered photo");

        Ok(Outcome::Registered { transaction })
    }
}
