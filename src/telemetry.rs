//! SDK-internal telemetry: failures and metrics about the core itself

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TelemetryMessage {
    Debug {
        message: String,
        attributes: BTreeMap<String, serde_json::Value>,
    },
    Error {
        message: String,
        cause: Option<String>,
    },
    Metric {
        name: String,
        attributes: BTreeMap<String, serde_json::Value>,
    },
}

/// Destination of telemetry messages, usually the message bus.
pub trait TelemetrySink: Send + Sync {
    fn send(&self, message: TelemetryMessage);
}

/// Cheap handle used by core components to report on themselves.
#[derive(Clone, Default)]
pub struct Telemetry {
    sink: Option<Arc<dyn TelemetrySink>>,
}

impl Telemetry {
    pub fn new(sink: Arc<dyn TelemetrySink>) -> Self {
        Self { sink: Some(sink) }
    }

    /// Telemetry that only logs.
    pub fn noop() -> Self {
        Self { sink: None }
    }

    pub fn debug(&self, message: impl Into<String>) {
        let message = message.into();
        debug!("{}", message);
        self.send(TelemetryMessage::Debug {
            message,
            attributes: BTreeMap::new(),
        });
    }

    pub fn error(&self, message: impl Into<String>, cause: Option<&dyn std::error::Error>) {
        let message = message.into();
        match cause {
            Some(cause) => error!("{}: {}", message, cause),
            None => error!("{}", message),
        }
        self.send(TelemetryMessage::Error {
            message,
            cause: cause.map(|c| c.to_string()),
        });
    }

    pub fn metric(&self, name: impl Into<String>, attributes: BTreeMap<String, serde_json::Value>) {
        let name = name.into();
        debug!("Metric {}: {:?}", name, attributes);
        self.send(TelemetryMessage::Metric { name, attributes });
    }

    fn send(&self, message: TelemetryMessage) {
        if let Some(sink) = &self.sink {
            sink.send(message);
        }
    }
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry")
            .field("connected", &self.sink.is_some())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub(crate) messages: Mutex<Vec<TelemetryMessage>>,
    }

    impl TelemetrySink for RecordingSink {
        fn send(&self, message: TelemetryMessage) {
            self.messages.lock().unwrap().push(message);
        }
    }

    #[test]
    fn test_error_carries_cause() {
        let sink = Arc::new(RecordingSink::default());
        let telemetry = Telemetry::new(sink.clone());

        let cause = std::io::Error::other("disk full");
        telemetry.error("Failed to write event", Some(&cause));

        let messages = sink.messages.lock().unwrap();
        match &messages[0] {
            TelemetryMessage::Error { message, cause } => {
                assert_eq!(message, "Failed to write event");
                assert_eq!(cause.as_deref(), Some("disk full"));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_noop_does_not_panic() {
        let telemetry = Telemetry::noop();
        telemetry.debug("nothing to see");
        telemetry.metric("batch_deleted", BTreeMap::new());
    }
}
