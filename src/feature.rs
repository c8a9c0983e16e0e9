//! Registration contract of a feature

use crate::message_bus::{FeatureMessageReceiver, NopReceiver};
use crate::performance::PerformancePresetOverride;
use crate::scope::FeatureScope;
use crate::upload::FeatureRequestBuilder;
use std::sync::Arc;

/// An independent telemetry domain plugged into the core.
pub trait Feature: Send + Sync {
    /// Unique name, also used as the storage directory name.
    fn name(&self) -> &str;

    /// Builder for intake requests. Features without one store data but never upload it.
    fn request_builder(&self) -> Option<Arc<dyn FeatureRequestBuilder>>;

    fn message_receiver(&self) -> Arc<dyn FeatureMessageReceiver> {
        Arc::new(NopReceiver)
    }

    fn performance_override(&self) -> Option<PerformancePresetOverride> {
        None
    }
}

/// Producer of raw events, implemented by the platform instrumentation.
///
/// The core starts a source once its feature is registered and stops it on teardown.
pub trait EventSource: Send + Sync {
    fn start(&self, scope: FeatureScope);
    fn stop(&self);
}
