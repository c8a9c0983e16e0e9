//! Typed messages exchanged between features through the core lane

use crate::context::DatadogContext;
use crate::sdk::CoreHandle;
use crate::telemetry::TelemetryMessage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::lane::panic_message;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{error, trace};

/// Cross-feature signals with a known shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeaturePayload {
    /// The view displayed most recently, for correlating events of other features.
    LastKnownView { view_id: String, name: String },
    /// The process may be killed by the watchdog while this view is active.
    WatchdogTerminationCandidate {
        view_id: Option<String>,
        date: DateTime<Utc>,
    },
    /// Feature-specific data, keyed by the producing feature's label.
    Custom { key: String, data: Vec<u8> },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebViewEventKind {
    Log,
    Rum,
    Record,
    Telemetry,
}

/// Event forwarded by the JavaScript bridge of an embedded web view.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WebViewEvent {
    pub kind: WebViewEventKind,
    pub event: serde_json::Map<String, serde_json::Value>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum FeatureMessage {
    Payload(FeaturePayload),
    WebView(WebViewEvent),
    /// Full snapshot published after every context write.
    Context(Arc<DatadogContext>),
    Telemetry(TelemetryMessage),
}

impl FeatureMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            FeatureMessage::Payload(_) => "payload",
            FeatureMessage::WebView(_) => "webview",
            FeatureMessage::Context(_) => "context",
            FeatureMessage::Telemetry(_) => "telemetry",
        }
    }
}

/// Capability of a feature to consume bus messages.
pub trait FeatureMessageReceiver: Send + Sync {
    /// Returns whether the message was consumed. Advisory only: the bus always
    /// delivers to every receiver.
    fn receive(&self, message: &FeatureMessage, core: &CoreHandle) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NopReceiver;

impl FeatureMessageReceiver for NopReceiver {
    fn receive(&self, _message: &FeatureMessage, _core: &CoreHandle) -> bool {
        false
    }
}

/// Tries its receivers in order and stops at the first one that consumes the message.
#[derive(Default, Clone)]
pub struct CombinedReceiver {
    receivers: Vec<Arc<dyn FeatureMessageReceiver>>,
}

impl CombinedReceiver {
    pub fn new(receivers: Vec<Arc<dyn FeatureMessageReceiver>>) -> Self {
        Self { receivers }
    }
}

impl FeatureMessageReceiver for CombinedReceiver {
    fn receive(&self, message: &FeatureMessage, core: &CoreHandle) -> bool {
        self.receivers
            .iter()
            .any(|receiver| receiver.receive(message, core))
    }
}

/// Fan-out of messages to every connected receiver, in connection order.
///
/// Owned by the core lane, which is the only caller of `deliver`.
#[derive(Default)]
pub struct MessageBus {
    receivers: Vec<(String, Arc<dyn FeatureMessageReceiver>)>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&mut self, name: impl Into<String>, receiver: Arc<dyn FeatureMessageReceiver>) {
        self.receivers.push((name.into(), receiver));
    }

    pub fn len(&self) -> usize {
        self.receivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receivers.is_empty()
    }

    /// Delivers `message` to all receivers and returns how many consumed it.
    ///
    /// A panicking receiver is logged and skipped. It is not reported through
    /// telemetry, which would deliver the report back to the same receiver.
    pub fn deliver(&self, message: &FeatureMessage, core: &CoreHandle) -> usize {
        let mut consumed = 0;
        for (name, receiver) in &self.receivers {
            match panic::catch_unwind(AssertUnwindSafe(|| receiver.receive(message, core))) {
                Ok(true) => {
                    trace!("{} message consumed by {}", message.kind(), name);
                    consumed += 1;
                }
                Ok(false) => {}
                Err(payload) => {
                    error!(
                        "{} receiver panicked on {} message: {}",
                        name,
                        message.kind(),
                        panic_message(payload.as_ref())
                    );
                }
            }
        }
        consumed
    }
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field(
                "receivers",
                &self.receivers.iter().map(|(name, _)| name).collect::<Vec<_>>(),
            )
            .finish()
    }
}
