//! Batch files and the per-feature directory layout
//!
//! ```text
//! <storage_root>/<feature>/v<SCHEMA_VERSION>/authorized/<id>
//! <storage_root>/<feature>/v<SCHEMA_VERSION>/unauthorized/<id>
//! ```

use crate::errors::Result;
use crate::storage::tlv;
use crate::storage::Event;
use chrono::{DateTime, Utc};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// Version of the on-disk record layout. Bumped whenever old files can no longer be parsed.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BatchDirectory {
    /// Events approved for upload.
    Authorized,
    /// Events waiting for a consent decision. Never uploaded.
    Unauthorized,
}

impl BatchDirectory {
    pub fn dir_name(&self) -> &'static str {
        match self {
            BatchDirectory::Authorized => "authorized",
            BatchDirectory::Unauthorized => "unauthorized",
        }
    }
}

/// The authorized/unauthorized directory pair of one feature.
#[derive(Clone, Debug)]
pub struct FeatureDirectories {
    pub root: PathBuf,
    pub authorized: PathBuf,
    pub unauthorized: PathBuf,
}

impl FeatureDirectories {
    /// Creates the directories for `feature` under `storage_root`.
    ///
    /// Directories left by other schema versions are kept for a compatible
    /// version to pick up, unless nothing in them was touched within `retention`.
    pub fn create(storage_root: &Path, feature: &str, retention: Duration) -> Result<Self> {
        let feature_root = storage_root.join(feature);
        let root = feature_root.join(format!("v{}", SCHEMA_VERSION));
        let authorized = root.join(BatchDirectory::Authorized.dir_name());
        let unauthorized = root.join(BatchDirectory::Unauthorized.dir_name());

        fs::create_dir_all(&authorized)?;
        fs::create_dir_all(&unauthorized)?;

        remove_obsolete_versions(&feature_root, &root, retention);

        Ok(Self {
            root,
            authorized,
            unauthorized,
        })
    }

    pub fn path(&self, directory: BatchDirectory) -> &Path {
        match directory {
            BatchDirectory::Authorized => &self.authorized,
            BatchDirectory::Unauthorized => &self.unauthorized,
        }
    }
}

fn remove_obsolete_versions(feature_root: &Path, current: &Path, retention: Duration) {
    let Ok(entries) = fs::read_dir(feature_root) else {
        return;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path == current || !path.is_dir() {
            continue;
        }

        let is_version_dir = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with('v') && name[1..].parse::<u32>().is_ok());
        if !is_version_dir {
            continue;
        }

        let newest = newest_modification(&path);
        let expired = newest
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .is_none_or(|age| age > retention);

        if expired {
            match fs::remove_dir_all(&path) {
                Ok(()) => info!("Removed obsolete storage directory {}", path.display()),
                Err(e) => warn!("Failed to remove obsolete directory {}: {}", path.display(), e),
            }
        } else {
            debug!("Keeping storage directory {} of another schema version", path.display());
        }
    }
}

fn newest_modification(path: &Path) -> Option<SystemTime> {
    let own = fs::metadata(path).and_then(|m| m.modified()).ok();
    let nested = fs::read_dir(path)
        .ok()?
        .flatten()
        .filter_map(|entry| {
            let path = entry.path();
            if path.is_dir() {
                newest_modification(&path)
            } else {
                entry.metadata().and_then(|m| m.modified()).ok()
            }
        })
        .max();
    own.into_iter().chain(nested).max()
}

/// A file of length-prefixed records, named by its monotonic id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchFile {
    pub path: PathBuf,
    pub id: u64,
}

impl BatchFile {
    pub fn new(directory: &Path, id: u64) -> Self {
        Self {
            path: directory.join(id.to_string()),
            id,
        }
    }

    /// Parses a batch file from its path; `None` if the name is not an id.
    pub fn from_path(path: PathBuf) -> Option<Self> {
        let id = path.file_name()?.to_str()?.parse::<u64>().ok()?;
        Some(Self { path, id })
    }

    pub fn name(&self) -> String {
        self.id.to_string()
    }

    /// Creation date encoded in the id.
    pub fn created_at(&self) -> DateTime<Utc> {
        i64::try_from(self.id)
            .ok()
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or(DateTime::UNIX_EPOCH)
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at()).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    pub fn size(&self) -> Result<u64> {
        Ok(fs::metadata(&self.path)?.len())
    }

    pub(crate) fn create(&self) -> Result<()> {
        OpenOptions::new().write(true).create_new(true).open(&self.path)?;
        Ok(())
    }

    /// Appends one framed record. A failed append is cut back to the previous
    /// length so that a torn record never precedes later ones.
    pub(crate) fn append(&self, payload: &[u8]) -> Result<u64> {
        let record = tlv::encode_record(payload)?;
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        let length = file.metadata()?.len();
        if let Err(e) = file.write_all(&record) {
            if let Err(truncate) = file.set_len(length) {
                warn!(
                    "Failed to truncate torn record in {}: {}",
                    self.path.display(),
                    truncate
                );
            }
            return Err(e.into());
        }
        Ok(record.len() as u64)
    }

    /// Reads every decodable event of this file.
    pub fn read_batch(&self, max_object_size: u64) -> Result<Vec<Event>> {
        let bytes = fs::read(&self.path)?;
        Ok(self.decode(&bytes, max_object_size))
    }

    pub(crate) fn decode(&self, bytes: &[u8], max_object_size: u64) -> Vec<Event> {
        let decoded = tlv::decode_records(bytes, max_object_size);
        if decoded.skipped > 0 || decoded.truncated {
            warn!(
                "Batch {} is partially corrupted: {} records skipped, truncated: {}",
                self.path.display(),
                decoded.skipped,
                decoded.truncated
            );
        }
        decoded
            .payloads
            .into_iter()
            .map(|data| Event { data })
            .collect()
    }

    pub fn delete(&self) -> Result<()> {
        fs::remove_file(&self.path)?;
        Ok(())
    }
}

/// Lists the batch files of `directory` ordered oldest first, together with
/// entries whose names are not batch ids.
pub fn list_batch_files(directory: &Path) -> Result<(Vec<BatchFile>, Vec<PathBuf>)> {
    let mut files = Vec::new();
    let mut unknown = Vec::new();

    for entry in fs::read_dir(directory)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        match BatchFile::from_path(path.clone()) {
            Some(file) => files.push(file),
            None => unknown.push(path),
        }
    }

    files.sort_by_key(|file| file.id);
    Ok((files, unknown))
}

/// Hands out strictly increasing file ids that double as creation timestamps.
#[derive(Debug, Default)]
pub struct FileIdGenerator {
    last: AtomicU64,
}

impl FileIdGenerator {
    /// Seeds the generator past every id already present in `directories`.
    pub fn seeded(directories: &[&Path]) -> Self {
        let last = directories
            .iter()
            .filter_map(|dir| list_batch_files(dir).ok())
            .flat_map(|(files, _)| files.into_iter().map(|f| f.id))
            .max()
            .unwrap_or(0);
        Self {
            last: AtomicU64::new(last),
        }
    }

    pub fn next(&self, now: DateTime<Utc>) -> u64 {
        let now_ms = u64::try_from(now.timestamp_millis()).unwrap_or(0);
        let previous = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now_ms.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        now_ms.max(previous + 1)
    }
}
