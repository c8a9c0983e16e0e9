//! The core's serialized execution lane
//!
//! One named thread executes storage writes, consent migrations, bus
//! deliveries and barriers in exactly the order they were enqueued.

use crate::consent::{ConsentObserver, TrackingConsent};
use crate::context::DatadogContext;
use crate::context_provider::{ContextProvider, ContextPublisher};
use crate::sdk::CoreHandle;
use crate::errors::{CoreError, Result};
use crate::message_bus::{FeatureMessage, FeatureMessageReceiver, MessageBus};
use crate::scope::EventWriter;
use crate::storage::EventStorage;
use crate::telemetry::{Telemetry, TelemetryMessage, TelemetrySink};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

pub(crate) type WriteBlock = Box<dyn FnOnce(&DatadogContext, &mut EventWriter<'_>) + Send>;

pub(crate) enum LaneCommand {
    Write {
        feature: String,
        bypass_consent: bool,
        block: WriteBlock,
    },
    ConsentChanged {
        from: TrackingConsent,
        to: TrackingConsent,
    },
    Deliver(FeatureMessage),
    Connect {
        name: String,
        receiver: Arc<dyn FeatureMessageReceiver>,
    },
    CloseBatches,
    Barrier(oneshot::Sender<()>),
    Shutdown,
}

/// Enqueues work on the lane from any thread, without blocking.
#[derive(Clone, Debug)]
pub struct LaneSender {
    tx: mpsc::UnboundedSender<LaneCommand>,
}

impl LaneSender {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<LaneCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub(crate) fn enqueue(&self, command: LaneCommand) -> Result<()> {
        self.tx.send(command).map_err(|_| CoreError::LaneClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl ConsentObserver for LaneSender {
    fn consent_changed(&self, from: TrackingConsent, to: TrackingConsent) {
        if self.enqueue(LaneCommand::ConsentChanged { from, to }).is_err() {
            warn!("Consent change {} -> {} after the core stopped", from, to);
        }
    }
}

impl ContextPublisher for LaneSender {
    fn publish(&self, context: Arc<DatadogContext>) {
        let _ = self.enqueue(LaneCommand::Deliver(FeatureMessage::Context(context)));
    }
}

impl TelemetrySink for LaneSender {
    fn send(&self, message: TelemetryMessage) {
        let _ = self.enqueue(LaneCommand::Deliver(FeatureMessage::Telemetry(message)));
    }
}

struct Lane {
    storage: Arc<EventStorage>,
    context: Arc<ContextProvider>,
    bus: MessageBus,
    core: CoreHandle,
    telemetry: Telemetry,
}

impl Lane {
    fn run(mut self, mut rx: mpsc::UnboundedReceiver<LaneCommand>) {
        info!("Core lane started");

        while let Some(command) = rx.blocking_recv() {
            match command {
                LaneCommand::Write {
                    feature,
                    bypass_consent,
                    block,
                } => self.write(&feature, bypass_consent, block),
                LaneCommand::ConsentChanged { from, to } => self.change_consent(from, to),
                LaneCommand::Deliver(message) => {
                    self.bus.deliver(&message, &self.core);
                }
                LaneCommand::Connect { name, receiver } => {
                    debug!("Connected {} to the message bus", name);
                    self.bus.connect(name, receiver);
                }
                LaneCommand::CloseBatches => self.storage.close_batches(),
                LaneCommand::Barrier(done) => {
                    let _ = done.send(());
                }
                LaneCommand::Shutdown => break,
            }
        }

        rx.close();
        // Release callers still waiting on a barrier.
        while let Ok(command) = rx.try_recv() {
            drop(command);
        }
        info!("Core lane stopped");
    }

    fn write(&self, feature: &str, bypass_consent: bool, block: WriteBlock) {
        let storage = match self.storage.feature(feature) {
            Ok(storage) => storage,
            Err(e) => {
                error!("Dropping write: {}", e);
                return;
            }
        };

        // Consent is taken from the lane's own view of the context, which only
        // changes when a consent transition is processed below.
        let context = self.context.read();
        let mut writer = EventWriter::new(
            &storage,
            context.tracking_consent,
            bypass_consent,
            &self.telemetry,
        );
        let result = panic::catch_unwind(AssertUnwindSafe(|| block(&context, &mut writer)));
        if let Err(payload) = result {
            let message = panic_message(payload.as_ref());
            error!("{} write block panicked: {}", feature, message);
            self.telemetry.error(
                format!("{} write block panicked", feature),
                Some(&CoreError::Other(message)),
            );
        }
    }

    fn change_consent(&self, from: TrackingConsent, to: TrackingConsent) {
        self.context.write(|context| context.tracking_consent = to);
        self.storage.migrate(from, to);
    }
}

/// Text of a panic payload raised with a string message.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Starts the lane thread.
pub(crate) fn spawn(
    rx: mpsc::UnboundedReceiver<LaneCommand>,
    storage: Arc<EventStorage>,
    context: Arc<ContextProvider>,
    core: CoreHandle,
) -> Result<JoinHandle<()>> {
    let lane = Lane {
        storage,
        context,
        bus: MessageBus::new(),
        telemetry: core.telemetry().clone(),
        core,
    };

    std::thread::Builder::new()
        .name("datadog-core-lane".to_string())
        .spawn(move || lane.run(rx))
        .map_err(CoreError::Io)
}
