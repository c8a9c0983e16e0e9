//! The SDK core: owns context, consent, storage, uploads and the lane

use crate::config::Config;
use crate::consent::{ConsentController, TrackingConsent};
use crate::context::{DatadogContext, DeviceInfo, FeatureBaggage, UserInfo};
use crate::context_provider::ContextProvider;
use crate::errors::{CoreError, Result};
use crate::feature::{EventSource, Feature};
use crate::lane::{self, LaneCommand, LaneSender};
use crate::message_bus::FeatureMessage;
use crate::scope::FeatureScope;
use crate::storage::{BatchDirectory, BatchFile, EventStorage, FeatureStorage, SystemDateProvider};
use crate::telemetry::Telemetry;
use crate::upload::{
    HttpClient, ReqwestClient, UploadConditions, UploadDependencies, UploadMetricsSnapshot,
    UploadReport, UploadWorker,
};

use futures::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Cloneable access to the shared parts of the core.
///
/// Message receivers get one with every delivery; feature scopes wrap one.
#[derive(Clone, Debug)]
pub struct CoreHandle {
    lane: LaneSender,
    context: Arc<ContextProvider>,
    consent: Arc<ConsentController>,
    telemetry: Telemetry,
}

impl CoreHandle {
    pub(crate) fn lane(&self) -> &LaneSender {
        &self.lane
    }

    pub fn context(&self) -> Arc<DatadogContext> {
        self.context.read()
    }

    pub fn tracking_consent(&self) -> TrackingConsent {
        self.consent.current()
    }

    /// Sends `message` to every connected receiver.
    pub fn send(&self, message: FeatureMessage) {
        if self.lane.enqueue(LaneCommand::Deliver(message)).is_err() {
            debug!("Dropping bus message: core is stopped");
        }
    }

    /// Sets or removes the baggage published under `label`.
    pub fn set_baggage(&self, label: impl Into<String>, baggage: Option<FeatureBaggage>) {
        let label = label.into();
        self.context.write(|context| match baggage {
            Some(baggage) => {
                context.baggages.insert(label, baggage);
            }
            None => {
                context.baggages.remove(&label);
            }
        });
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    /// Resolves once every command enqueued before it has run.
    pub(crate) async fn barrier(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.lane.enqueue(LaneCommand::Barrier(tx))?;
        rx.await.map_err(|_| CoreError::LaneClosed)
    }
}

struct RegisteredFeature {
    scope: FeatureScope,
    storage: Arc<FeatureStorage>,
    worker: Option<Arc<UploadWorker>>,
    task: Option<JoinHandle<()>>,
}

/// Entry point of the SDK. Features register against an explicit instance.
pub struct DatadogCore {
    core_id: String,
    config: Config,
    handle: CoreHandle,
    storage: Arc<EventStorage>,
    client: Arc<dyn HttpClient>,
    upload_enabled: Arc<AtomicBool>,
    features: RwLock<HashMap<String, RegisteredFeature>>,
    sources: Mutex<Vec<Arc<dyn EventSource>>>,
    shutdown: watch::Sender<bool>,
    lane_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl DatadogCore {
    /// Creates the core and starts its lane.
    pub fn new(config: Config, client: Arc<dyn HttpClient>) -> Result<Self> {
        config.validate().map_err(CoreError::Config)?;

        let (lane_sender, lane_rx) = LaneSender::channel();
        let telemetry = Telemetry::new(Arc::new(lane_sender.clone()));

        let mut context = DatadogContext::new(
            config.service.clone(),
            config.env.clone(),
            config.app_version.clone(),
            config.tracking_consent,
        );
        context.site = config.site.clone();
        context.client_token = config.client_token.clone();
        context.device = DeviceInfo::current();

        let context = Arc::new(ContextProvider::new(context));
        context.set_publisher(Arc::new(lane_sender.clone()));

        let consent = Arc::new(ConsentController::new(
            config.tracking_consent,
            Some(Arc::new(lane_sender.clone())),
        ));

        let storage = Arc::new(EventStorage::new(
            config.storage_dir.clone(),
            Arc::new(SystemDateProvider),
            telemetry.clone(),
        )?);

        let handle = CoreHandle {
            lane: lane_sender,
            context: context.clone(),
            consent,
            telemetry,
        };

        let lane_thread = lane::spawn(lane_rx, storage.clone(), context, handle.clone())?;
        let (shutdown, _) = watch::channel(false);
        let core_id = Uuid::new_v4().to_string();

        info!(
            "Initialized core {} for service {} ({}) with consent {}",
            core_id, config.service, config.env, config.tracking_consent
        );

        Ok(Self {
            core_id,
            config,
            handle,
            storage,
            client,
            upload_enabled: Arc::new(AtomicBool::new(true)),
            features: RwLock::new(HashMap::new()),
            sources: Mutex::new(Vec::new()),
            shutdown,
            lane_thread: Mutex::new(Some(lane_thread)),
        })
    }

    /// Creates a core uploading through reqwest.
    pub fn with_reqwest(config: Config) -> Result<Self> {
        let client = ReqwestClient::new(config.http_timeout)?;
        Self::new(config, Arc::new(client))
    }

    pub fn handle(&self) -> &CoreHandle {
        &self.handle
    }

    /// Registers `feature` and returns its scope.
    ///
    /// The upload timer is only started when called inside a tokio runtime;
    /// otherwise uploads happen through [`DatadogCore::upload_tick`] only.
    pub fn register(&self, feature: &dyn Feature) -> Result<FeatureScope> {
        let name = feature.name().to_string();
        let mut features = self.features.write().unwrap_or_else(PoisonError::into_inner);
        if features.contains_key(&name) {
            return Err(CoreError::FeatureAlreadyRegistered(name));
        }

        let mut preset = self.config.performance();
        if let Some(overrides) = feature.performance_override() {
            preset = preset.updated(&overrides);
        }

        let storage = self.storage.register(&name, preset)?;
        self.handle.lane.enqueue(LaneCommand::Connect {
            name: name.clone(),
            receiver: feature.message_receiver(),
        })?;

        let worker = feature.request_builder().map(|builder| {
            Arc::new(UploadWorker::new(
                storage.clone(),
                builder,
                UploadDependencies {
                    client: self.client.clone(),
                    context: self.handle.context.clone(),
                    conditions: UploadConditions {
                        background_uploads_enabled: self.config.background_uploads_enabled,
                    },
                    upload_enabled: self.upload_enabled.clone(),
                    http_timeout: self.config.http_timeout,
                    telemetry: self.handle.telemetry.clone(),
                },
            ))
        });

        let task = match (&worker, tokio::runtime::Handle::try_current()) {
            (Some(worker), Ok(runtime)) => {
                Some(runtime.spawn(worker.clone().run(self.shutdown.subscribe())))
            }
            (Some(_), Err(_)) => {
                warn!("No tokio runtime: uploads of {} only run on demand", name);
                None
            }
            (None, _) => None,
        };

        let scope = FeatureScope::new(name.clone(), self.handle.clone());
        features.insert(
            name.clone(),
            RegisteredFeature {
                scope: scope.clone(),
                storage,
                worker,
                task,
            },
        );

        info!("Registered feature {}", name);
        Ok(scope)
    }

    pub fn scope(&self, feature: &str) -> Result<FeatureScope> {
        self.features
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(feature)
            .map(|registered| registered.scope.clone())
            .ok_or_else(|| CoreError::FeatureNotRegistered(feature.to_string()))
    }

    /// Starts `source` with the scope of `feature`; it is stopped on teardown.
    pub fn register_event_source(&self, feature: &str, source: Arc<dyn EventSource>) -> Result<()> {
        let scope = self.scope(feature)?;
        source.start(scope);
        self.sources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(source);
        Ok(())
    }

    pub fn tracking_consent(&self) -> TrackingConsent {
        self.handle.tracking_consent()
    }

    /// Changes consent. Writes enqueued before this call use the old value,
    /// writes enqueued after it use the new one.
    pub fn set_tracking_consent(&self, consent: TrackingConsent) {
        self.handle.consent.set(consent);
    }

    pub fn set_user_info(&self, user: UserInfo) {
        self.update_context(|context| context.user = user);
    }

    pub fn set_baggage(&self, label: impl Into<String>, baggage: Option<FeatureBaggage>) {
        self.handle.set_baggage(label, baggage);
    }

    /// Enables or disables uploads, e.g. following a host-app policy.
    pub fn set_upload_enabled(&self, enabled: bool) {
        self.upload_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Applies a platform update to the context. Tracking consent can only
    /// change through [`DatadogCore::set_tracking_consent`].
    pub fn update_context<F>(&self, mutation: F) -> Arc<DatadogContext>
    where
        F: FnOnce(&mut DatadogContext),
    {
        self.handle.context.write(|context| {
            let consent = context.tracking_consent;
            mutation(context);
            context.tracking_consent = consent;
        })
    }

    pub fn context(&self) -> Arc<DatadogContext> {
        self.handle.context()
    }

    pub fn send(&self, message: FeatureMessage) {
        self.handle.send(message);
    }

    /// Closes open batches and waits until all enqueued work reached disk.
    pub async fn flush(&self) -> Result<()> {
        self.handle.lane.enqueue(LaneCommand::CloseBatches)?;
        self.handle.barrier().await
    }

    /// Runs one upload pass for `feature` right away.
    pub async fn upload_tick(&self, feature: &str) -> Result<UploadReport> {
        let worker = self.worker(feature)?;
        Ok(worker.tick().await)
    }

    fn worker(&self, feature: &str) -> Result<Arc<UploadWorker>> {
        let features = self.features.read().unwrap_or_else(PoisonError::into_inner);
        let registered = features
            .get(feature)
            .ok_or_else(|| CoreError::FeatureNotRegistered(feature.to_string()))?;
        registered.worker.clone().ok_or_else(|| {
            CoreError::Other(format!("feature '{}' has no request builder", feature))
        })
    }

    fn workers(&self) -> Vec<Arc<UploadWorker>> {
        self.features
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter_map(|registered| registered.worker.clone())
            .collect()
    }

    /// Get core statistics
    pub async fn stats(&self) -> CoreStats {
        let files = self.storage.file_counts();
        let mut uploads = BTreeMap::new();
        for worker in self.workers() {
            uploads.insert(worker.feature().to_string(), worker.metrics().await);
        }

        let context = self.context();
        CoreStats {
            core_id: self.core_id.clone(),
            service: self.config.service.clone(),
            tracking_consent: self.tracking_consent(),
            context_version: context.snapshot_version,
            features: files.keys().cloned().collect(),
            authorized_files: files.iter().map(|(k, (a, _))| (k.clone(), *a)).collect(),
            unauthorized_files: files.iter().map(|(k, (_, u))| (k.clone(), *u)).collect(),
            uploads,
        }
    }

    /// Flushes everything, runs a last upload pass per feature and stops
    /// the upload tasks and the lane.
    #[instrument(skip(self), fields(core_id = %self.core_id))]
    pub async fn flush_and_tear_down(self) -> Result<()> {
        info!("Tearing down core");

        let sources = std::mem::take(&mut *self.sources.lock().unwrap_or_else(PoisonError::into_inner));
        for source in sources {
            source.stop();
        }

        self.flush().await?;

        let reports = join_all(self.workers().into_iter().map(|worker| async move {
            let report = worker.drain().await;
            (worker.feature().to_string(), report)
        }))
        .await;
        for (feature, report) in reports {
            if let Some(reason) = report.retry {
                warn!("{} batches kept on disk after teardown ({})", feature, reason);
            } else {
                debug!("Final {} upload: {} delivered", feature, report.delivered);
            }
        }

        let _ = self.shutdown.send(true);
        let tasks: Vec<JoinHandle<()>> = self
            .features
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .values_mut()
            .filter_map(|registered| registered.task.take())
            .collect();
        for result in join_all(tasks).await {
            if let Err(e) = result {
                error!("Upload task failed: {}", e);
            }
        }

        self.handle.lane.enqueue(LaneCommand::Shutdown)?;
        let lane_thread = self
            .lane_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(thread) = lane_thread {
            tokio::task::spawn_blocking(move || thread.join())
                .await
                .map_err(|e| CoreError::Other(format!("Failed to join core lane: {}", e)))?
                .map_err(|_| CoreError::Other("Core lane panicked".to_string()))?;
        }

        info!("Core teardown complete");
        Ok(())
    }

    /// Every batch file of `feature` in `directory`, oldest first.
    pub fn files(&self, feature: &str, directory: BatchDirectory) -> Result<Vec<BatchFile>> {
        self.feature_storage(feature)?.files(directory)
    }

    fn feature_storage(&self, feature: &str) -> Result<Arc<FeatureStorage>> {
        self.features
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(feature)
            .map(|registered| registered.storage.clone())
            .ok_or_else(|| CoreError::FeatureNotRegistered(feature.to_string()))
    }
}

impl Drop for DatadogCore {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.lane.enqueue(LaneCommand::Shutdown);
    }
}

/// Core statistics
#[derive(Debug, Clone)]
pub struct CoreStats {
    pub core_id: String,
    pub service: String,
    pub tracking_consent: TrackingConsent,
    pub context_version: u64,
    pub features: Vec<String>,
    pub authorized_files: BTreeMap<String, usize>,
    pub unauthorized_files: BTreeMap<String, usize>,
    pub uploads: BTreeMap<String, UploadMetricsSnapshot>,
}
