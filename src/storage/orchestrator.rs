//! Selection of the writable batch file and of files ready for upload

use crate::errors::{CoreError, Result};
use crate::performance::PerformancePreset;
use crate::storage::files::{list_batch_files, BatchDirectory, BatchFile, FileIdGenerator};
use crate::telemetry::Telemetry;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;
use tracing::{debug, warn};

/// Source of the current date, replaceable in tests.
pub trait DateProvider: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDateProvider;

impl DateProvider for SystemDateProvider {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug)]
struct WritableFile {
    file: BatchFile,
    objects: u64,
    size: u64,
}

/// Result of moving the files of one directory into another.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub moved: usize,
    pub failed: usize,
}

/// Owns one batch directory. Every append and every closure decision happens
/// under the same lock, so a file reported as readable never grows again.
pub struct FilesOrchestrator {
    directory: PathBuf,
    kind: BatchDirectory,
    preset: PerformancePreset,
    ids: Arc<FileIdGenerator>,
    dates: Arc<dyn DateProvider>,
    telemetry: Telemetry,
    writable: Mutex<Option<WritableFile>>,
}

impl FilesOrchestrator {
    pub fn new(
        directory: PathBuf,
        kind: BatchDirectory,
        preset: PerformancePreset,
        ids: Arc<FileIdGenerator>,
        dates: Arc<dyn DateProvider>,
        telemetry: Telemetry,
    ) -> Self {
        Self {
            directory,
            kind,
            preset,
            ids,
            dates,
            telemetry,
            writable: Mutex::new(None),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn kind(&self) -> BatchDirectory {
        self.kind
    }

    fn lock(&self) -> MutexGuard<'_, Option<WritableFile>> {
        self.writable.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends `payload` to the current writable file, opening a new one if needed.
    pub fn write(&self, payload: &[u8]) -> Result<BatchFile> {
        let size = payload.len() as u64;
        if size > self.preset.max_object_size {
            return Err(CoreError::ObjectTooLarge {
                size,
                max: self.preset.max_object_size,
            });
        }

        let mut writable = self.lock();
        let now = self.dates.now();
        let record_size = size + crate::storage::tlv::LENGTH_PREFIX_SIZE as u64;

        let reusable = writable.as_ref().is_some_and(|current| {
            current.file.exists()
                && current.file.age(now) <= self.preset.max_file_age_for_write
                && current.objects < self.preset.max_objects_in_file
                && current.size + record_size <= self.preset.max_file_size
                && current.file.size().ok() == Some(current.size)
        });

        if !reusable {
            self.purge_directory();
            let file = BatchFile::new(&self.directory, self.ids.next(now));
            file.create()?;
            debug!("Created batch file {} in {}", file.name(), self.kind.dir_name());
            *writable = Some(WritableFile {
                file,
                objects: 0,
                size: 0,
            });
        }

        let Some(current) = writable.as_mut() else {
            return Err(CoreError::Other("no writable batch file".to_string()));
        };

        let written = match current.file.append(payload) {
            Ok(written) => written,
            Err(e) => {
                warn!("Closing batch file {} after a failed append", current.file.name());
                *writable = None;
                return Err(e);
            }
        };
        current.objects += 1;
        current.size += written;
        Ok(current.file.clone())
    }

    /// Closes the current writable file so that it becomes readable.
    pub fn close_writable(&self) {
        if let Some(current) = self.lock().take() {
            debug!(
                "Closed batch file {} with {} events",
                current.file.name(),
                current.objects
            );
        }
    }

    fn is_closed(&self, writable: &Option<WritableFile>, file: &BatchFile, now: DateTime<Utc>) -> bool {
        match writable {
            Some(current) if current.file.id == file.id => {
                current.file.age(now) > self.preset.max_file_age_for_write
                    || current.objects >= self.preset.max_objects_in_file
                    || current.size >= self.preset.max_file_size
            }
            _ => true,
        }
    }

    /// Every batch file currently on disk, oldest first.
    pub fn all_files(&self) -> Result<Vec<BatchFile>> {
        let _writable = self.lock();
        let (files, _) = list_batch_files(&self.directory)?;
        Ok(files)
    }

    /// Closed batch files eligible for upload, oldest first. Obsolete files
    /// and expired entries with foreign names are deleted on the way.
    pub fn readable_files(&self) -> Result<Vec<BatchFile>> {
        let writable = self.lock();
        let now = self.dates.now();
        let (files, unknown) = list_batch_files(&self.directory)?;

        self.delete_expired_unknown(&unknown);

        let mut readable = Vec::with_capacity(files.len());
        for file in files {
            if file.age(now) > self.preset.max_file_age_for_read {
                self.delete_file(&file, "obsolete");
                continue;
            }
            if self.is_closed(&writable, &file, now) {
                readable.push(file);
            }
        }
        Ok(readable)
    }

    /// Deletes `file`, forgetting it if it was the writable one.
    pub fn delete(&self, file: &BatchFile, reason: &str) {
        let mut writable = self.lock();
        if writable.as_ref().is_some_and(|current| current.file.id == file.id) {
            *writable = None;
        }
        self.delete_file(file, reason);
    }

    /// Deletes every entry of the directory.
    pub fn delete_all(&self) -> usize {
        let mut writable = self.lock();
        *writable = None;

        let (files, unknown) = match list_batch_files(&self.directory) {
            Ok(listing) => listing,
            Err(e) => {
                self.telemetry.error(
                    format!("Failed to list {} files", self.kind.dir_name()),
                    Some(&e),
                );
                return 0;
            }
        };

        for path in &unknown {
            if let Err(e) = fs::remove_file(path) {
                warn!("Failed to delete {}: {}", path.display(), e);
            }
        }
        for file in &files {
            self.delete_file(file, "purged");
        }
        files.len()
    }

    /// Moves every batch file of this directory into `target`, keeping names.
    ///
    /// Locks this directory first and then `target`. A file that cannot be
    /// moved stays here; a name already taken in `target` is never overwritten.
    pub fn move_all_into(&self, target: &FilesOrchestrator) -> MigrationReport {
        let mut source = self.lock();
        let mut destination = target.lock();
        *source = None;
        *destination = None;

        let mut report = MigrationReport::default();
        let files = match list_batch_files(&self.directory) {
            Ok((files, _)) => files,
            Err(e) => {
                self.telemetry.error("Failed to list files for migration", Some(&e));
                return report;
            }
        };

        for file in files {
            let moved = BatchFile::new(&target.directory, file.id);
            if moved.path.exists() {
                warn!("Batch {} already exists in {}, not moving it", file.name(), target.kind.dir_name());
                report.failed += 1;
                continue;
            }
            match fs::rename(&file.path, &moved.path) {
                Ok(()) => report.moved += 1,
                Err(e) => {
                    warn!("Failed to move batch {}: {}", file.name(), e);
                    report.failed += 1;
                }
            }
        }
        report
    }

    fn delete_file(&self, file: &BatchFile, reason: &str) {
        match file.delete() {
            Ok(()) => {
                debug!("Deleted batch file {} ({})", file.name(), reason);
                if reason != "delivered" {
                    self.telemetry.metric(
                        "batch_deleted",
                        BTreeMap::from([
                            ("directory".to_string(), json!(self.kind.dir_name())),
                            ("reason".to_string(), json!(reason)),
                        ]),
                    );
                }
            }
            Err(CoreError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => self
                .telemetry
                .error(format!("Failed to delete batch file {}", file.name()), Some(&e)),
        }
    }

    fn delete_expired_unknown(&self, unknown: &[PathBuf]) {
        for path in unknown {
            let expired = fs::metadata(path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| SystemTime::now().duration_since(modified).ok())
                .is_some_and(|age| age > self.preset.max_file_age_for_read);
            if expired {
                match fs::remove_file(path) {
                    Ok(()) => debug!("Deleted unrecognized file {}", path.display()),
                    Err(e) => warn!("Failed to delete {}: {}", path.display(), e),
                }
            }
        }
    }

    fn purge_directory(&self) {
        let Ok((files, _)) = list_batch_files(&self.directory) else {
            return;
        };

        let sized: Vec<(BatchFile, u64)> = files
            .into_iter()
            .map(|file| {
                let size = file.size().unwrap_or(0);
                (file, size)
            })
            .collect();

        let mut total: u64 = sized.iter().map(|(_, size)| size).sum();
        for (file, size) in sized {
            if total <= self.preset.max_directory_size {
                break;
            }
            self.delete_file(&file, "purged");
            total = total.saturating_sub(size);
        }
    }
}

impl std::fmt::Debug for FilesOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilesOrchestrator")
            .field("directory", &self.directory)
            .field("kind", &self.kind)
            .finish()
    }
}
