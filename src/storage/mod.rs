//! Consent-aware persistence of events in per-feature batch files

pub mod files;
pub mod orchestrator;
pub mod tlv;

pub use files::{BatchDirectory, BatchFile, FeatureDirectories, FileIdGenerator, SCHEMA_VERSION};
pub use orchestrator::{DateProvider, FilesOrchestrator, MigrationReport, SystemDateProvider};

use crate::consent::{ConsentMigration, TrackingConsent};
use crate::errors::{CoreError, Result};
use crate::performance::PerformancePreset;
use crate::telemetry::Telemetry;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// One encoded event, opaque to the storage layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub data: Vec<u8>,
}

/// The decoded content of one batch file.
#[derive(Clone, Debug)]
pub struct Batch {
    pub file: BatchFile,
    pub events: Vec<Event>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    Stored {
        directory: BatchDirectory,
        file: BatchFile,
    },
    /// Consent was `not_granted` and the write did not bypass it.
    Discarded,
}

/// Directory an event goes to, or `None` if it must be dropped.
pub fn resolve_directory(consent: TrackingConsent, bypass_consent: bool) -> Option<BatchDirectory> {
    if bypass_consent {
        return Some(BatchDirectory::Authorized);
    }
    match consent {
        TrackingConsent::Granted => Some(BatchDirectory::Authorized),
        TrackingConsent::Pending => Some(BatchDirectory::Unauthorized),
        TrackingConsent::NotGranted => None,
    }
}

/// Storage of a single feature: its directory pair and their orchestrators.
#[derive(Debug)]
pub struct FeatureStorage {
    name: String,
    directories: FeatureDirectories,
    preset: PerformancePreset,
    authorized: FilesOrchestrator,
    unauthorized: FilesOrchestrator,
    telemetry: Telemetry,
}

impl FeatureStorage {
    pub fn new(
        storage_root: &Path,
        name: &str,
        preset: PerformancePreset,
        dates: Arc<dyn DateProvider>,
        telemetry: Telemetry,
    ) -> Result<Self> {
        let directories =
            FeatureDirectories::create(storage_root, name, preset.max_file_age_for_read)?;
        let ids = Arc::new(FileIdGenerator::seeded(&[
            &directories.authorized,
            &directories.unauthorized,
        ]));

        let orchestrator = |directory: BatchDirectory| {
            FilesOrchestrator::new(
                directories.path(directory).to_path_buf(),
                directory,
                preset.clone(),
                ids.clone(),
                dates.clone(),
                telemetry.clone(),
            )
        };
        let authorized = orchestrator(BatchDirectory::Authorized);
        let unauthorized = orchestrator(BatchDirectory::Unauthorized);

        Ok(Self {
            name: name.to_string(),
            directories,
            preset,
            authorized,
            unauthorized,
            telemetry,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn preset(&self) -> &PerformancePreset {
        &self.preset
    }

    pub fn directories(&self) -> &FeatureDirectories {
        &self.directories
    }

    pub fn orchestrator(&self, directory: BatchDirectory) -> &FilesOrchestrator {
        match directory {
            BatchDirectory::Authorized => &self.authorized,
            BatchDirectory::Unauthorized => &self.unauthorized,
        }
    }

    /// Appends one event to the directory selected by `consent`.
    pub fn write(
        &self,
        data: &[u8],
        consent: TrackingConsent,
        bypass_consent: bool,
    ) -> Result<WriteOutcome> {
        let Some(directory) = resolve_directory(consent, bypass_consent) else {
            debug!("Discarding {} event: consent is {}", self.name, consent);
            return Ok(WriteOutcome::Discarded);
        };

        let file = self.orchestrator(directory).write(data)?;
        Ok(WriteOutcome::Stored { directory, file })
    }

    /// Every batch file in `directory`, oldest first.
    pub fn files(&self, directory: BatchDirectory) -> Result<Vec<BatchFile>> {
        self.orchestrator(directory).all_files()
    }

    /// Closed authorized files, oldest first.
    pub fn readable_files(&self) -> Result<Vec<BatchFile>> {
        self.authorized.readable_files()
    }

    pub fn read_batch(&self, file: &BatchFile) -> Result<Batch> {
        let events = file.read_batch(self.preset.max_object_size)?;
        Ok(Batch {
            file: file.clone(),
            events,
        })
    }

    pub fn delete(&self, file: &BatchFile, reason: &str) {
        self.authorized.delete(file, reason);
    }

    pub fn close_batches(&self) {
        self.authorized.close_writable();
        self.unauthorized.close_writable();
    }

    /// Applies the storage side effect of a consent transition.
    pub fn migrate(&self, from: TrackingConsent, to: TrackingConsent) {
        match ConsentMigration::for_transition(from, to) {
            ConsentMigration::MoveUnauthorizedToAuthorized => {
                let report = self.unauthorized.move_all_into(&self.authorized);
                info!(
                    "Moved {} {} batches to authorized ({} failed)",
                    report.moved, self.name, report.failed
                );
                if report.failed > 0 {
                    self.telemetry.metric(
                        "consent_migration_incomplete",
                        BTreeMap::from([
                            ("feature".to_string(), json!(self.name)),
                            ("failed".to_string(), json!(report.failed)),
                        ]),
                    );
                }
            }
            ConsentMigration::DeleteUnauthorized => {
                let deleted = self.unauthorized.delete_all();
                info!("Deleted {} unauthorized {} batches", deleted, self.name);
            }
            ConsentMigration::None => {}
        }
    }
}

/// Registry of every feature's storage under one root directory.
pub struct EventStorage {
    root: PathBuf,
    dates: Arc<dyn DateProvider>,
    telemetry: Telemetry,
    features: RwLock<HashMap<String, Arc<FeatureStorage>>>,
}

/// Whether `name` is exactly one normal path component, so it stays inside the storage root.
fn is_plain_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

impl EventStorage {
    pub fn new(root: PathBuf, dates: Arc<dyn DateProvider>, telemetry: Telemetry) -> Result<Self> {
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            dates,
            telemetry,
            features: RwLock::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates the directory pair of `feature`.
    pub fn register(&self, feature: &str, preset: PerformancePreset) -> Result<Arc<FeatureStorage>> {
        if !is_plain_name(feature) {
            return Err(CoreError::InvalidFeatureName(feature.to_string()));
        }

        let mut features = self.features.write().unwrap_or_else(PoisonError::into_inner);
        if features.contains_key(feature) {
            return Err(CoreError::FeatureAlreadyRegistered(feature.to_string()));
        }

        let storage = Arc::new(FeatureStorage::new(
            &self.root,
            feature,
            preset,
            self.dates.clone(),
            self.telemetry.clone(),
        )?);
        features.insert(feature.to_string(), storage.clone());
        info!("Registered storage for feature {}", feature);
        Ok(storage)
    }

    pub fn feature(&self, feature: &str) -> Result<Arc<FeatureStorage>> {
        self.features
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(feature)
            .cloned()
            .ok_or_else(|| CoreError::FeatureNotRegistered(feature.to_string()))
    }

    fn all(&self) -> Vec<Arc<FeatureStorage>> {
        self.features
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn write(
        &self,
        feature: &str,
        event: &[u8],
        consent: TrackingConsent,
        bypass_consent: bool,
    ) -> Result<WriteOutcome> {
        self.feature(feature)?.write(event, consent, bypass_consent)
    }

    pub fn files(&self, feature: &str, directory: BatchDirectory) -> Result<Vec<BatchFile>> {
        self.feature(feature)?.files(directory)
    }

    pub fn delete(&self, feature: &str, file: &BatchFile) -> Result<()> {
        self.feature(feature)?.delete(file, "deleted");
        Ok(())
    }

    /// Applies a consent transition to every registered feature.
    pub fn migrate(&self, from: TrackingConsent, to: TrackingConsent) {
        if from == to {
            return;
        }
        for feature in self.all() {
            feature.migrate(from, to);
        }
    }

    pub fn close_batches(&self) {
        for feature in self.all() {
            feature.close_batches();
        }
    }

    /// Number of batch files per feature and directory.
    pub fn file_counts(&self) -> BTreeMap<String, (usize, usize)> {
        self.all()
            .iter()
            .map(|feature| {
                let count = |directory| match feature.files(directory) {
                    Ok(files) => files.len(),
                    Err(e) => {
                        warn!("Failed to list {} files: {}", feature.name(), e);
                        0
                    }
                };
                (
                    feature.name().to_string(),
                    (
                        count(BatchDirectory::Authorized),
                        count(BatchDirectory::Unauthorized),
                    ),
                )
            })
            .collect()
    }
}

impl std::fmt::Debug for EventStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStorage")
            .field("root", &self.root)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::orchestrator::tests::MockDateProvider;
    use chrono::Utc;
    use tempfile::TempDir;

    fn storage(temp: &TempDir) -> EventStorage {
        EventStorage::new(
            temp.path().to_path_buf(),
            Arc::new(MockDateProvider::new(Utc::now())),
            Telemetry::noop(),
        )
        .unwrap()
    }

    fn events(storage: &EventStorage, directory: BatchDirectory) -> Vec<Vec<u8>> {
        storage
            .files("logs", directory)
            .unwrap()
            .iter()
            .flat_map(|f| f.read_batch(1024).unwrap())
            .map(|e| e.data)
            .collect()
    }

    #[test]
    fn test_routing_by_consent() {
        assert_eq!(resolve_directory(TrackingConsent::Granted, false), Some(BatchDirectory::Authorized));
        assert_eq!(resolve_directory(TrackingConsent::Pending, false), Some(BatchDirectory::Unauthorized));
        assert_eq!(resolve_directory(TrackingConsent::NotGranted, false), None);
        assert_eq!(resolve_directory(TrackingConsent::NotGranted, true), Some(BatchDirectory::Authorized));
        assert_eq!(resolve_directory(TrackingConsent::Pending, true), Some(BatchDirectory::Authorized));
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let temp = TempDir::new().unwrap();
        let storage = storage(&temp);
        storage.register("logs", PerformancePreset::default()).unwrap();

        let result = storage.register("logs", PerformancePreset::default());
        assert!(matches!(result, Err(CoreError::FeatureAlreadyRegistered(name)) if name == "logs"));
    }

    #[test]
    fn test_feature_names_stay_inside_the_root() {
        let temp = TempDir::new().unwrap();
        let storage = storage(&temp);

        for name in ["", ".", "..", "../logs", "/tmp/logs", "logs/v1", "rum/../.."] {
            let result = storage.register(name, PerformancePreset::default());
            assert!(
                matches!(result, Err(CoreError::InvalidFeatureName(_))),
                "{:?} was accepted",
                name
            );
        }
        assert!(storage.register("session-replay", PerformancePreset::default()).is_ok());
    }

    #[test]
    fn test_write_to_unknown_feature_fails() {
        let temp = TempDir::new().unwrap();
        let storage = storage(&temp);

        let result = storage.write("rum", b"event", TrackingConsent::Granted, false);
        assert!(matches!(result, Err(CoreError::FeatureNotRegistered(_))));
    }

    #[test]
    fn test_not_granted_writes_are_discarded() {
        let temp = TempDir::new().unwrap();
        let storage = storage(&temp);
        storage.register("logs", PerformancePreset::default()).unwrap();

        let outcome = storage.write("logs", b"event", TrackingConsent::NotGranted, false).unwrap();
        assert_eq!(outcome, WriteOutcome::Discarded);
        assert!(events(&storage, BatchDirectory::Authorized).is_empty());
        assert!(events(&storage, BatchDirectory::Unauthorized).is_empty());
    }

    #[test]
    fn test_pending_to_granted_moves_events_in_order() {
        let temp = TempDir::new().unwrap();
        let storage = storage(&temp);
        storage
            .register(
                "logs",
                PerformancePreset {
                    max_objects_in_file: 2,
                    ..PerformancePreset::default()
                },
            )
            .unwrap();

        storage.write("logs", b"granted", TrackingConsent::Granted, false).unwrap();
        for event in [b"p1", b"p2", b"p3"] {
            storage.write("logs", event, TrackingConsent::Pending, false).unwrap();
        }

        storage.migrate(TrackingConsent::Pending, TrackingConsent::Granted);
        storage.write("logs", b"after", TrackingConsent::Granted, false).unwrap();

        assert!(events(&storage, BatchDirectory::Unauthorized).is_empty());
        assert_eq!(
            events(&storage, BatchDirectory::Authorized),
            vec![
                b"granted".to_vec(),
                b"p1".to_vec(),
                b"p2".to_vec(),
                b"p3".to_vec(),
                b"after".to_vec()
            ]
        );
    }

    #[test]
    fn test_not_granted_purges_unauthorized_only() {
        let temp = TempDir::new().unwrap();
        let storage = storage(&temp);
        storage.register("logs", PerformancePreset::default()).unwrap();

        storage.write("logs", b"approved", TrackingConsent::Granted, false).unwrap();
        storage.write("logs", b"waiting", TrackingConsent::Pending, false).unwrap();

        storage.migrate(TrackingConsent::Pending, TrackingConsent::NotGranted);

        assert!(storage.files("logs", BatchDirectory::Unauthorized).unwrap().is_empty());
        assert_eq!(events(&storage, BatchDirectory::Authorized), vec![b"approved".to_vec()]);
    }

    #[test]
    fn test_file_counts() {
        let temp = TempDir::new().unwrap();
        let storage = storage(&temp);
        storage.register("logs", PerformancePreset::default()).unwrap();
        storage.register("rum", PerformancePreset::default()).unwrap();

        storage.write("logs", b"a", TrackingConsent::Granted, false).unwrap();
        storage.write("rum", b"b", TrackingConsent::Pending, false).unwrap();

        let counts = storage.file_counts();
        assert_eq!(counts["logs"], (1, 0));
        assert_eq!(counts["rum"], (0, 1));
    }
}
