//! Per-feature upload loop

use crate::context_provider::ContextProvider;
use crate::storage::{BatchFile, Event, FeatureStorage};
use crate::telemetry::Telemetry;
use crate::upload::conditions::{UploadBlocker, UploadConditions};
use crate::upload::delay::UploadDelay;
use crate::upload::request::FeatureRequestBuilder;
use crate::upload::status::{RetryReason, UploadStatus};
use crate::upload::transport::{HttpClient, UploadMetrics, UploadMetricsSnapshot};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, instrument, warn};

/// What a single upload pass did.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct UploadReport {
    pub blockers: Vec<UploadBlocker>,
    pub delivered: usize,
    pub rejected: usize,
    /// Batches deleted without a request: empty or not buildable.
    pub dropped: usize,
    /// Set when the pass stopped on a retryable failure.
    pub retry: Option<RetryReason>,
}

impl UploadReport {
    pub fn is_blocked(&self) -> bool {
        !self.blockers.is_empty()
    }
}

/// Everything a worker needs besides its feature storage.
#[derive(Clone)]
pub struct UploadDependencies {
    pub client: Arc<dyn HttpClient>,
    pub context: Arc<ContextProvider>,
    pub conditions: UploadConditions,
    pub upload_enabled: Arc<AtomicBool>,
    pub http_timeout: Duration,
    pub telemetry: Telemetry,
}

/// Uploads the authorized batches of one feature, one request at a time.
pub struct UploadWorker {
    storage: Arc<FeatureStorage>,
    request_builder: Arc<dyn FeatureRequestBuilder>,
    deps: UploadDependencies,
    /// Held for the whole pass, so a feature never has two uploads in flight.
    delay: Mutex<UploadDelay>,
    metrics: UploadMetrics,
}

impl UploadWorker {
    pub fn new(
        storage: Arc<FeatureStorage>,
        request_builder: Arc<dyn FeatureRequestBuilder>,
        deps: UploadDependencies,
    ) -> Self {
        let delay = UploadDelay::new(storage.preset());
        Self {
            storage,
            request_builder,
            deps,
            delay: Mutex::new(delay),
            metrics: UploadMetrics::new(),
        }
    }

    pub fn feature(&self) -> &str {
        self.storage.name()
    }

    pub async fn current_delay(&self) -> Duration {
        self.delay.lock().await.current()
    }

    pub async fn metrics(&self) -> UploadMetricsSnapshot {
        self.metrics.snapshot().await
    }

    /// Runs one scheduled upload pass.
    pub async fn tick(&self) -> UploadReport {
        self.upload(false).await
    }

    /// Uploads whatever is readable regardless of device conditions. The
    /// retry rules still apply, so a retryable failure keeps the batch.
    pub async fn drain(&self) -> UploadReport {
        self.upload(true).await
    }

    async fn upload(&self, forced: bool) -> UploadReport {
        let mut delay = self.delay.lock().await;
        let context = self.deps.context.read();
        let mut report = UploadReport::default();

        if !forced {
            let enabled = self.deps.upload_enabled.load(Ordering::SeqCst);
            report.blockers = self.deps.conditions.blockers(&context, enabled);
            if report.is_blocked() {
                debug!(
                    "Skipping {} upload: {}",
                    self.feature(),
                    report
                        .blockers
                        .iter()
                        .map(|b| b.to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                );
                return report;
            }
        }

        let files = match self.storage.readable_files() {
            Ok(files) => files,
            Err(e) => {
                self.deps
                    .telemetry
                    .error(format!("Failed to list {} batches", self.feature()), Some(&e));
                if !forced {
                    delay.increase();
                }
                return report;
            }
        };

        let max_batches = self.storage.preset().max_batches_per_upload;
        for file in files.into_iter().take(max_batches) {
            let Some(events) = self.read_events(&file).await else {
                continue;
            };

            if events.is_empty() {
                self.storage.delete(&file, "empty");
                report.dropped += 1;
                continue;
            }

            let request = match self.request_builder.request(&events, &context) {
                Ok(request) => request,
                Err(e) => {
                    self.deps.telemetry.error(
                        format!("Failed to build {} request, dropping batch {}", self.feature(), file.name()),
                        Some(&e),
                    );
                    self.storage.delete(&file, "invalid_request");
                    report.dropped += 1;
                    continue;
                }
            };

            let started = Instant::now();
            let status = match timeout(self.deps.http_timeout, self.deps.client.send(request)).await {
                Ok(Ok(response)) => UploadStatus::from_response(&response),
                Ok(Err(e)) => {
                    warn!("Upload of {} batch {} failed: {}", self.feature(), file.name(), e);
                    UploadStatus::from_error(&e)
                }
                Err(_) => UploadStatus::Retry(RetryReason::Timeout),
            };
            self.metrics
                .record(started, matches!(status, UploadStatus::Delivered { .. }))
                .await;

            if status.is_invalid_token() {
                error!("{} upload rejected: the client token is invalid", self.feature());
            }

            match status {
                UploadStatus::Delivered { status } => {
                    debug!(
                        "Delivered {} batch {} with {} events (status {})",
                        self.feature(),
                        file.name(),
                        events.len(),
                        status
                    );
                    self.storage.delete(&file, "delivered");
                    report.delivered += 1;
                }
                UploadStatus::Rejected { status } => {
                    self.report_rejection(&file, status, events.len());
                    self.storage.delete(&file, "rejected");
                    report.rejected += 1;
                }
                UploadStatus::Retry(reason) => {
                    warn!(
                        "Keeping {} batch {} for a later retry ({})",
                        self.feature(),
                        file.name(),
                        reason
                    );
                    report.retry = Some(reason);
                    break;
                }
            }
        }

        if !forced {
            if report.delivered > 0 && report.rejected == 0 && report.retry.is_none() {
                delay.decrease();
            } else {
                delay.increase();
            }
        }

        report
    }

    async fn read_events(&self, file: &BatchFile) -> Option<Vec<Event>> {
        match tokio::fs::read(&file.path).await {
            Ok(bytes) => Some(file.decode(&bytes, self.storage.preset().max_object_size)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                self.deps.telemetry.error(
                    format!("Failed to read {} batch {}", self.feature(), file.name()),
                    Some(&e),
                );
                None
            }
        }
    }

    fn report_rejection(&self, file: &BatchFile, status: u16, events: usize) {
        self.deps.telemetry.error(
            format!(
                "Intake rejected {} batch {} with status {}, dropping {} events",
                self.feature(),
                file.name(),
                status,
                events
            ),
            None,
        );
        self.deps.telemetry.metric(
            "upload_rejected",
            BTreeMap::from([
                ("feature".to_string(), json!(self.feature())),
                ("status".to_string(), json!(status)),
            ]),
        );
    }

    /// Ticks after every delay until `shutdown` turns true or its sender is dropped.
    #[instrument(skip_all, fields(feature = %self.feature()))]
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("Upload worker started");

        loop {
            let delay = self.current_delay().await;
            tokio::select! {
                _ = sleep(delay) => {
                    let report = self.tick().await;
                    if report.delivered > 0 {
                        debug!("Uploaded {} batches", report.delivered);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Upload worker stopped");
    }
}

impl std::fmt::Debug for UploadWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadWorker")
            .field("feature", &self.feature())
            .finish()
    }
}
