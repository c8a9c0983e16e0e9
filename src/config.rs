//! Configuration management for the SDK core

use crate::consent::TrackingConsent;
use crate::performance::{BatchProcessingLevel, BatchSize, PerformancePreset, UploadFrequency};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Client token sent with every upload
    pub client_token: String,

    /// Name of the instrumented service
    pub service: String,

    /// Environment the application runs in
    pub env: String,

    /// Version of the instrumented application
    pub app_version: String,

    /// Datadog site receiving the data
    pub site: String,

    /// Root directory for batch files
    pub storage_dir: PathBuf,

    /// Consent applied until the host application sets another one
    pub tracking_consent: TrackingConsent,

    /// Preferred batch maturity
    pub batch_size: BatchSize,

    /// Preferred upload pace
    pub upload_frequency: UploadFrequency,

    /// Number of batches sent per upload tick
    pub batch_processing_level: BatchProcessingLevel,

    /// HTTP timeout for intake requests
    pub http_timeout: Duration,

    /// Keep uploading while the application is in background
    pub background_uploads_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client_token: String::new(),
            service: "unknown-service".to_string(),
            env: "production".to_string(),
            app_version: "0.0.0".to_string(),
            site: "datadoghq.com".to_string(),
            storage_dir: env::temp_dir().join("com.datadoghq"),
            tracking_consent: TrackingConsent::Pending,
            batch_size: BatchSize::Medium,
            upload_frequency: UploadFrequency::Average,
            batch_processing_level: BatchProcessingLevel::Medium,
            http_timeout: Duration::from_secs(10),
            background_uploads_enabled: false,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from any key lookup; unknown or unparseable values keep their defaults
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(client_token) = lookup("DD_CLIENT_TOKEN") {
            config.client_token = client_token;
        }

        if let Some(service) = lookup("DD_SERVICE") {
            config.service = service;
        }

        if let Some(env) = lookup("DD_ENV") {
            config.env = env;
        }

        if let Some(version) = lookup("DD_VERSION") {
            config.app_version = version;
        }

        if let Some(site) = lookup("DD_SITE") {
            config.site = site;
        }

        if let Some(storage_dir) = lookup("DD_STORAGE_DIR") {
            config.storage_dir = PathBuf::from(storage_dir);
        }

        if let Some(consent) = lookup("DD_TRACKING_CONSENT") {
            if let Ok(consent) = TrackingConsent::try_from(consent.as_str()) {
                config.tracking_consent = consent;
            }
        }

        if let Some(batch_size) = lookup("DD_BATCH_SIZE") {
            if let Ok(size) = BatchSize::try_from(batch_size.as_str()) {
                config.batch_size = size;
            }
        }

        if let Some(frequency) = lookup("DD_UPLOAD_FREQUENCY") {
            if let Ok(frequency) = UploadFrequency::try_from(frequency.as_str()) {
                config.upload_frequency = frequency;
            }
        }

        if let Some(level) = lookup("DD_BATCH_PROCESSING_LEVEL") {
            if let Ok(level) = BatchProcessingLevel::try_from(level.as_str()) {
                config.batch_processing_level = level;
            }
        }

        if let Some(timeout) = lookup("DD_HTTP_TIMEOUT_SECONDS") {
            if let Ok(seconds) = timeout.parse::<u64>() {
                config.http_timeout = Duration::from_secs(seconds);
            }
        }

        if let Some(background) = lookup("DD_BACKGROUND_UPLOADS") {
            config.background_uploads_enabled = background.to_lowercase() == "true";
        }

        config
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.service.is_empty() {
            return Err("service cannot be empty".to_string());
        }

        if self.env.is_empty() {
            return Err("env cannot be empty".to_string());
        }

        if self.site.is_empty() {
            return Err("site cannot be empty".to_string());
        }

        if self.storage_dir.as_os_str().is_empty() {
            return Err("storage_dir cannot be empty".to_string());
        }

        if self.http_timeout.is_zero() {
            return Err("http_timeout must be greater than 0".to_string());
        }

        Ok(())
    }

    /// Performance preset resulting from the batching preferences
    pub fn performance(&self) -> PerformancePreset {
        PerformancePreset::new(self.batch_size, self.upload_frequency, self.batch_processing_level)
    }

    /// Base URL of the intake for the configured site
    pub fn intake_url(&self) -> String {
        format!("https://browser-intake-{}", self.site)
    }
}
