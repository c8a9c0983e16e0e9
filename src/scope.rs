//! The narrow API through which a feature talks to the core

use crate::consent::TrackingConsent;
use crate::context::{DatadogContext, FeatureBaggage};
use crate::sdk::CoreHandle;
use crate::errors::{CoreError, Result};
use crate::lane::LaneCommand;
use crate::message_bus::FeatureMessage;
use crate::storage::{FeatureStorage, WriteOutcome};
use crate::telemetry::Telemetry;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Writes events of one feature into the directory resolved for the
/// current write. Failures are logged and reported, never returned.
pub struct EventWriter<'a> {
    storage: &'a FeatureStorage,
    consent: TrackingConsent,
    bypass_consent: bool,
    telemetry: &'a Telemetry,
    written: usize,
}

impl<'a> EventWriter<'a> {
    pub(crate) fn new(
        storage: &'a FeatureStorage,
        consent: TrackingConsent,
        bypass_consent: bool,
        telemetry: &'a Telemetry,
    ) -> Self {
        Self {
            storage,
            consent,
            bypass_consent,
            telemetry,
            written: 0,
        }
    }

    /// Consent this writer routes by.
    pub fn consent(&self) -> TrackingConsent {
        self.consent
    }

    /// Number of events stored so far.
    pub fn written(&self) -> usize {
        self.written
    }

    /// Appends one encoded event.
    pub fn write(&mut self, data: &[u8]) {
        match self.storage.write(data, self.consent, self.bypass_consent) {
            Ok(WriteOutcome::Stored { .. }) => self.written += 1,
            Ok(WriteOutcome::Discarded) => {}
            Err(e @ CoreError::ObjectTooLarge { .. }) => {
                warn!("Dropping {} event: {}", self.storage.name(), e);
            }
            Err(e) => {
                self.telemetry
                    .error(format!("Failed to write {} event", self.storage.name()), Some(&e));
            }
        }
    }

    /// Encodes `event` as JSON and appends it.
    pub fn write_json<T: Serialize>(&mut self, event: &T) {
        match serde_json::to_vec(event) {
            Ok(data) => self.write(&data),
            Err(e) => {
                let e = CoreError::from(e);
                self.telemetry
                    .error(format!("Failed to encode {} event", self.storage.name()), Some(&e));
            }
        }
    }
}

/// Handle given to a feature at registration.
#[derive(Clone, Debug)]
pub struct FeatureScope {
    feature: String,
    core: CoreHandle,
}

impl FeatureScope {
    pub(crate) fn new(feature: impl Into<String>, core: CoreHandle) -> Self {
        Self {
            feature: feature.into(),
            core,
        }
    }

    pub fn feature(&self) -> &str {
        &self.feature
    }

    /// Runs `block` on the core lane with the current context and a writer
    /// bound to the consent in effect for this write. Returns immediately.
    pub fn event_write_context<F>(&self, bypass_consent: bool, block: F)
    where
        F: FnOnce(&DatadogContext, &mut EventWriter<'_>) + Send + 'static,
    {
        let command = LaneCommand::Write {
            feature: self.feature.clone(),
            bypass_consent,
            block: Box::new(block),
        };
        if self.core.lane().enqueue(command).is_err() {
            debug!("Dropping {} write: core is stopped", self.feature);
        }
    }

    /// Latest committed context.
    pub fn context(&self) -> Arc<DatadogContext> {
        self.core.context()
    }

    pub fn send(&self, message: FeatureMessage) {
        self.core.send(message);
    }

    /// Publishes `baggage` under `label` in the shared context.
    pub fn set_baggage(&self, label: impl Into<String>, baggage: Option<FeatureBaggage>) {
        self.core.set_baggage(label, baggage);
    }

    pub fn telemetry(&self) -> &Telemetry {
        self.core.telemetry()
    }

    /// Waits until every write enqueued before this call is on disk.
    pub async fn flush(&self) -> Result<()> {
        self.core.barrier().await
    }

    /// Blocking variant of [`FeatureScope::flush`] for crash paths.
    ///
    /// Must not be called from within an async runtime.
    pub fn flush_blocking(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.core.lane().enqueue(LaneCommand::Barrier(tx))?;
        rx.blocking_recv().map_err(|_| CoreError::LaneClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::performance::PerformancePreset;
    use crate::storage::orchestrator::tests::MockDateProvider;
    use crate::storage::BatchDirectory;
    use crate::telemetry::tests::RecordingSink;
    use crate::telemetry::TelemetryMessage;
    use chrono::Utc;
    use tempfile::TempDir;

    fn storage(temp: &TempDir) -> FeatureStorage {
        FeatureStorage::new(
            temp.path(),
            "logs",
            PerformancePreset::default(),
            Arc::new(MockDateProvider::new(Utc::now())),
            Telemetry::noop(),
        )
        .unwrap()
    }

    #[test]
    fn test_io_error_is_reported_not_returned() {
        let temp = TempDir::new().unwrap();
        let storage = storage(&temp);
        std::fs::remove_dir_all(storage.directories().path(BatchDirectory::Authorized)).unwrap();

        let sink = Arc::new(RecordingSink::default());
        let telemetry = Telemetry::new(sink.clone());
        let mut writer = EventWriter::new(&storage, TrackingConsent::Granted, false, &telemetry);
        writer.write(b"event");

        assert_eq!(writer.written(), 0);
        let messages = sink.messages.lock().unwrap();
        assert!(matches!(
            &messages[..],
            [TelemetryMessage::Error { message, cause: Some(_) }] if message == "Failed to write logs event"
        ));
    }

    #[test]
    fn test_oversized_event_is_dropped_quietly() {
        let temp = TempDir::new().unwrap();
        let storage = storage(&temp);

        let sink = Arc::new(RecordingSink::default());
        let telemetry = Telemetry::new(sink.clone());
        let mut writer = EventWriter::new(&storage, TrackingConsent::Granted, false, &telemetry);
        let oversized = vec![b'x'; storage.preset().max_object_size as usize + 1];
        writer.write(&oversized);
        writer.write_json(&serde_json::json!({"message": "fits"}));

        assert_eq!(writer.written(), 1);
        assert!(sink.messages.lock().unwrap().is_empty());
        assert_eq!(storage.files(BatchDirectory::Authorized).unwrap().len(), 1);
    }
}
