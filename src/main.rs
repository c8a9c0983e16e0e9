//! Demo binary: sends every stdin line as a log event

use clap::Parser;
use datadog_core::{
    BasicRequestBuilder, Config, DatadogCore, EventSource, Feature, FeatureRequestBuilder,
    FeatureScope, PayloadFormat, Result, TrackingConsent,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "datadog_core", version, about = "Store-and-forward log shipping demo")]
struct Cli {
    /// Name of the feature receiving the lines
    #[arg(long, default_value = "logs")]
    feature: String,

    /// Send batches to this URL instead of the site intake
    #[arg(long, env = "DD_INTAKE_URL")]
    intake_url: Option<String>,

    /// Tracking consent (granted, not_granted, pending)
    #[arg(long, value_parser = parse_consent)]
    consent: Option<TrackingConsent>,

    /// Root directory for batch files
    #[arg(long)]
    storage_dir: Option<PathBuf>,
}

fn parse_consent(value: &str) -> std::result::Result<TrackingConsent, String> {
    TrackingConsent::try_from(value)
}

struct LogsFeature {
    name: String,
    request_builder: Arc<BasicRequestBuilder>,
}

impl Feature for LogsFeature {
    fn name(&self) -> &str {
        &self.name
    }

    fn request_builder(&self) -> Option<Arc<dyn FeatureRequestBuilder>> {
        Some(self.request_builder.clone())
    }
}

/// Turns lines into log events while started.
#[derive(Default)]
struct LineSource {
    scope: Mutex<Option<FeatureScope>>,
}

impl LineSource {
    fn emit(&self, line: String) -> bool {
        let scope = self.scope.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(scope) = scope.as_ref() else {
            return false;
        };

        scope.event_write_context(false, move |context, writer| {
            writer.write_json(&json!({
                "message": line,
                "status": "info",
                "service": context.service,
                "ddtags": format!("env:{},version:{}", context.env, context.app_version),
                "date": context.server_date(chrono::Utc::now()).timestamp_millis(),
            }));
        });
        true
    }
}

impl EventSource for LineSource {
    fn start(&self, scope: FeatureScope) {
        *self.scope.lock().unwrap_or_else(PoisonError::into_inner) = Some(scope);
    }

    fn stop(&self) {
        self.scope.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    initialize_tracing();
    let cli = Cli::parse();

    info!("Starting datadog_core demo v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::from_env();
    if let Some(consent) = cli.consent {
        config.tracking_consent = consent;
    }
    if let Some(storage_dir) = cli.storage_dir {
        config.storage_dir = storage_dir;
    }

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        std::process::exit(1);
    }

    info!(
        "Core configuration - Service: {}, Env: {}, Site: {}, Storage: {}",
        config.service,
        config.env,
        config.site,
        config.storage_dir.display()
    );

    let request_builder = match cli.intake_url {
        Some(url) => BasicRequestBuilder::with_url(url, PayloadFormat::JsonArray),
        None => BasicRequestBuilder::new("/api/v2/logs", PayloadFormat::JsonArray),
    };

    let core = DatadogCore::with_reqwest(config)?;
    core.register(&LogsFeature {
        name: cli.feature.clone(),
        request_builder: Arc::new(request_builder),
    })?;

    let source = Arc::new(LineSource::default());
    core.register_event_source(&cli.feature, source.clone())?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut count = 0usize;
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        if source.emit(line) {
            count += 1;
        }
    }

    info!("Read {} lines, flushing", count);
    let stats = core.stats().await;
    info!(
        "Pending batches - authorized: {:?}, unauthorized: {:?}",
        stats.authorized_files, stats.unauthorized_files
    );

    core.flush_and_tear_down().await
}

/// Initialize structured logging
fn initialize_tracing() {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_names(true)
        .json();

    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&log_level))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}
