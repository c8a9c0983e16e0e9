//! Transport core of a client-side telemetry SDK
//!
//! Features write encoded events through a [`FeatureScope`]; the core
//! stores them in consent-aware batch files, uploads closed batches with
//! retry and backoff, and shares a versioned context and a message bus
//! between features.

pub mod config;
pub mod consent;
pub mod context;
pub mod context_provider;
pub mod errors;
pub mod feature;
mod lane;
pub mod message_bus;
pub mod performance;
pub mod scope;
pub mod sdk;
pub mod storage;
pub mod telemetry;
pub mod upload;

pub use config::Config;
pub use consent::{ConsentController, TrackingConsent};
pub use context::{DatadogContext, FeatureBaggage, UserInfo};
pub use context_provider::ContextProvider;
pub use errors::{CoreError, Result, StorageError};
pub use feature::{EventSource, Feature};
pub use message_bus::{
    CombinedReceiver, FeatureMessage, FeatureMessageReceiver, FeaturePayload, MessageBus,
    NopReceiver, WebViewEvent, WebViewEventKind,
};
pub use performance::{PerformancePreset, PerformancePresetOverride};
pub use scope::{EventWriter, FeatureScope};
pub use sdk::{CoreHandle, CoreStats, DatadogCore};
pub use storage::{Batch, BatchDirectory, BatchFile, Event, EventStorage};
pub use telemetry::{Telemetry, TelemetryMessage};
pub use upload::{
    BasicRequestBuilder, FeatureRequestBuilder, HttpClient, HttpResponse, PayloadFormat,
    ReqwestClient, UploadReport, UploadRequest,
};
