//! Delivery of authorized batches to the intake

pub mod conditions;
pub mod delay;
pub mod request;
pub mod status;
pub mod transport;
pub mod worker;

pub use conditions::{UploadBlocker, UploadConditions};
pub use delay::UploadDelay;
pub use request::{BasicRequestBuilder, FeatureRequestBuilder, PayloadFormat};
pub use status::{RetryReason, UploadStatus};
pub use transport::{HttpClient, HttpResponse, ReqwestClient, UploadMetricsSnapshot, UploadRequest};
pub use worker::{UploadDependencies, UploadReport, UploadWorker};
