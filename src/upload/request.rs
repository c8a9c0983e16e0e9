//! Turning a batch of events into an intake request

use crate::context::DatadogContext;
use crate::errors::{CoreError, Result};
use crate::storage::Event;
use crate::upload::transport::UploadRequest;
use uuid::Uuid;

/// Capability of a feature to package its events for the intake.
pub trait FeatureRequestBuilder: Send + Sync {
    fn request(&self, events: &[Event], context: &DatadogContext) -> Result<UploadRequest>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFormat {
    /// Events separated by `\n`.
    NewlineDelimited,
    /// Events joined by `,` inside `[` and `]`.
    JsonArray,
}

impl PayloadFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            PayloadFormat::NewlineDelimited => "text/plain;charset=UTF-8",
            PayloadFormat::JsonArray => "application/json",
        }
    }

    pub fn encode(&self, events: &[Event]) -> Vec<u8> {
        let (prefix, separator, suffix): (&[u8], &[u8], &[u8]) = match self {
            PayloadFormat::NewlineDelimited => (b"", b"\n", b""),
            PayloadFormat::JsonArray => (b"[", b",", b"]"),
        };

        let size = events.iter().map(|e| e.data.len() + separator.len()).sum::<usize>() + 2;
        let mut body = Vec::with_capacity(size);
        body.extend_from_slice(prefix);
        for (index, event) in events.iter().enumerate() {
            if index > 0 {
                body.extend_from_slice(separator);
            }
            body.extend_from_slice(&event.data);
        }
        body.extend_from_slice(suffix);
        body
    }
}

#[derive(Debug, Clone)]
enum Endpoint {
    /// Path on the intake of the context's site.
    Intake(String),
    Url(String),
}

/// Request builder producing the standard intake headers.
#[derive(Debug, Clone)]
pub struct BasicRequestBuilder {
    endpoint: Endpoint,
    format: PayloadFormat,
}

impl BasicRequestBuilder {
    pub fn new(intake_path: impl Into<String>, format: PayloadFormat) -> Self {
        Self {
            endpoint: Endpoint::Intake(intake_path.into()),
            format,
        }
    }

    /// Sends to `url` instead of the site intake.
    pub fn with_url(url: impl Into<String>, format: PayloadFormat) -> Self {
        Self {
            endpoint: Endpoint::Url(url.into()),
            format,
        }
    }

    fn url(&self, context: &DatadogContext) -> String {
        let base = match &self.endpoint {
            Endpoint::Intake(path) => format!("https://browser-intake-{}{}", context.site, path),
            Endpoint::Url(url) => url.clone(),
        };
        format!("{}?ddsource={}", base, context.source)
    }
}

impl FeatureRequestBuilder for BasicRequestBuilder {
    fn request(&self, events: &[Event], context: &DatadogContext) -> Result<UploadRequest> {
        if events.is_empty() {
            return Err(CoreError::RequestBuilder("no events to upload".to_string()));
        }

        Ok(UploadRequest::post(self.url(context), self.format.encode(events))
            .with_header("Content-Type", self.format.content_type())
            .with_header("DD-API-KEY", context.client_token.as_str())
            .with_header("DD-EVP-ORIGIN", context.source.as_str())
            .with_header("DD-EVP-ORIGIN-VERSION", context.sdk_version.as_str())
            .with_header("DD-REQUEST-ID", Uuid::new_v4().to_string()))
    }
}
