//! Storage and upload tuning derived from batching preferences

use serde::{Deserialize, Serialize};
use std::time::Duration;

const KB: u64 = 1024;
const MB: u64 = 1024 * KB;

/// Preferred age of a batch before it is closed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchSize {
    Small,
    #[default]
    Medium,
    Large,
}

/// Preferred pace of upload ticks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadFrequency {
    Frequent,
    #[default]
    Average,
    Rare,
}

/// How many batches one upload tick may send.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchProcessingLevel {
    Low,
    #[default]
    Medium,
    High,
}

impl BatchProcessingLevel {
    pub fn max_batches_per_upload(&self) -> usize {
        match self {
            BatchProcessingLevel::Low => 1,
            BatchProcessingLevel::Medium => 10,
            BatchProcessingLevel::High => 100,
        }
    }
}

macro_rules! impl_parse {
    ($ty:ty { $($name:literal => $variant:expr),+ $(,)? }) => {
        impl TryFrom<&str> for $ty {
            type Error = String;

            fn try_from(s: &str) -> Result<Self, Self::Error> {
                match s.to_lowercase().as_str() {
                    $($name => Ok($variant),)+
                    other => Err(format!("unknown {} '{}'", stringify!($ty), other)),
                }
            }
        }
    };
}

impl_parse!(BatchSize { "small" => BatchSize::Small, "medium" => BatchSize::Medium, "large" => BatchSize::Large });
impl_parse!(UploadFrequency {
    "frequent" => UploadFrequency::Frequent,
    "average" => UploadFrequency::Average,
    "rare" => UploadFrequency::Rare,
});
impl_parse!(BatchProcessingLevel {
    "low" => BatchProcessingLevel::Low,
    "medium" => BatchProcessingLevel::Medium,
    "high" => BatchProcessingLevel::High,
});

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PerformancePreset {
    /// Maximum size of a single batch file, in bytes.
    pub max_file_size: u64,
    /// Maximum size of one feature directory. Oldest files are purged above it.
    pub max_directory_size: u64,
    /// A batch file younger than this may still receive writes.
    pub max_file_age_for_write: Duration,
    /// Files older than this are deleted without being uploaded.
    pub max_file_age_for_read: Duration,
    pub max_objects_in_file: u64,
    /// Events larger than this are rejected at write time.
    pub max_object_size: u64,

    pub initial_upload_delay: Duration,
    pub min_upload_delay: Duration,
    pub max_upload_delay: Duration,
    pub upload_delay_change_rate: f64,
    pub max_batches_per_upload: usize,
}

impl PerformancePreset {
    pub fn new(
        batch_size: BatchSize,
        upload_frequency: UploadFrequency,
        batch_processing_level: BatchProcessingLevel,
    ) -> Self {
        let mean_file_age = match batch_size {
            BatchSize::Small => 3.0,
            BatchSize::Medium => 10.0,
            BatchSize::Large => 35.0,
        };

        let base_upload_delay = match upload_frequency {
            UploadFrequency::Frequent => 0.5,
            UploadFrequency::Average => 2.0,
            UploadFrequency::Rare => 5.0,
        };

        Self {
            max_file_size: 4 * MB,
            max_directory_size: 512 * MB,
            max_file_age_for_write: Duration::from_secs_f64(mean_file_age * 0.95),
            max_file_age_for_read: Duration::from_secs(18 * 60 * 60),
            max_objects_in_file: 500,
            max_object_size: 512 * KB,
            initial_upload_delay: Duration::from_secs_f64(base_upload_delay * 5.0),
            min_upload_delay: Duration::from_secs_f64(base_upload_delay),
            max_upload_delay: Duration::from_secs_f64(base_upload_delay * 10.0),
            upload_delay_change_rate: 0.1,
            max_batches_per_upload: batch_processing_level.max_batches_per_upload(),
        }
    }

    /// Returns a copy with every field set in `overrides` replaced.
    pub fn updated(&self, overrides: &PerformancePresetOverride) -> Self {
        Self {
            max_file_size: overrides.max_file_size.unwrap_or(self.max_file_size),
            max_directory_size: self.max_directory_size,
            max_file_age_for_write: overrides
                .max_file_age_for_write
                .unwrap_or(self.max_file_age_for_write),
            max_file_age_for_read: overrides
                .max_file_age_for_read
                .unwrap_or(self.max_file_age_for_read),
            max_objects_in_file: self.max_objects_in_file,
            max_object_size: overrides.max_object_size.unwrap_or(self.max_object_size),
            initial_upload_delay: overrides
                .initial_upload_delay
                .unwrap_or(self.initial_upload_delay),
            min_upload_delay: overrides.min_upload_delay.unwrap_or(self.min_upload_delay),
            max_upload_delay: overrides.max_upload_delay.unwrap_or(self.max_upload_delay),
            upload_delay_change_rate: overrides
                .upload_delay_change_rate
                .unwrap_or(self.upload_delay_change_rate),
            max_batches_per_upload: self.max_batches_per_upload,
        }
    }
}

impl Default for PerformancePreset {
    fn default() -> Self {
        Self::new(BatchSize::default(), UploadFrequency::default(), BatchProcessingLevel::default())
    }
}

/// Feature-specific adjustments of the core preset.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformancePresetOverride {
    pub max_file_size: Option<u64>,
    pub max_object_size: Option<u64>,
    pub max_file_age_for_write: Option<Duration>,
    pub max_file_age_for_read: Option<Duration>,
    pub initial_upload_delay: Option<Duration>,
    pub min_upload_delay: Option<Duration>,
    pub max_upload_delay: Option<Duration>,
    pub upload_delay_change_rate: Option<f64>,
}
