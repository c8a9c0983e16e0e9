//! End-to-end behaviour of the core: consent routing, migration and upload retries

use async_trait::async_trait;
use datadog_core::performance::UploadFrequency;
use datadog_core::{
    BasicRequestBuilder, BatchDirectory, Config, CoreError, DatadogCore, Feature,
    FeatureRequestBuilder, FeatureScope, HttpClient, HttpResponse, PayloadFormat, ReqwestClient,
    Result, TrackingConsent, UploadRequest,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use wiremock::matchers::{body_string, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[derive(Default)]
struct MockClient {
    statuses: Mutex<VecDeque<u16>>,
    requests: Mutex<Vec<UploadRequest>>,
}

impl MockClient {
    fn answering(statuses: &[u16]) -> Arc<Self> {
        Arc::new(Self {
            statuses: Mutex::new(statuses.iter().copied().collect()),
            requests: Mutex::default(),
        })
    }

    fn bodies(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| String::from_utf8(r.body.clone()).unwrap())
            .collect()
    }
}

#[async_trait]
impl HttpClient for MockClient {
    async fn send(&self, request: UploadRequest) -> Result<HttpResponse> {
        self.requests.lock().unwrap().push(request);
        let status = self.statuses.lock().unwrap().pop_front().unwrap_or(200);
        Ok(HttpResponse { status })
    }
}

struct LogsFeature {
    url: String,
}

impl Feature for LogsFeature {
    fn name(&self) -> &str {
        "logs"
    }

    fn request_builder(&self) -> Option<Arc<dyn FeatureRequestBuilder>> {
        Some(Arc::new(BasicRequestBuilder::with_url(
            self.url.clone(),
            PayloadFormat::NewlineDelimited,
        )))
    }
}

fn config(temp: &TempDir, consent: TrackingConsent) -> Config {
    Config {
        client_token: "token".to_string(),
        storage_dir: temp.path().to_path_buf(),
        tracking_consent: consent,
        upload_frequency: UploadFrequency::Rare,
        ..Config::default()
    }
}

fn start(temp: &TempDir, consent: TrackingConsent, client: Arc<MockClient>) -> (DatadogCore, FeatureScope) {
    let core = DatadogCore::new(config(temp, consent), client).unwrap();
    let scope = core
        .register(&LogsFeature {
            url: "http://intake.test/api/v2/logs".to_string(),
        })
        .unwrap();
    (core, scope)
}

fn write(scope: &FeatureScope, event: &str, bypass_consent: bool) {
    let event = event.to_string();
    scope.event_write_context(bypass_consent, move |_, writer| writer.write(event.as_bytes()));
}

fn stored_events(core: &DatadogCore, directory: BatchDirectory) -> Vec<String> {
    core.files("logs", directory)
        .unwrap()
        .iter()
        .flat_map(|file| file.read_batch(u64::MAX).unwrap())
        .map(|event| String::from_utf8(event.data).unwrap())
        .collect()
}

#[tokio::test]
async fn pending_events_are_uploaded_in_one_request_once_granted() {
    let temp = TempDir::new().unwrap();
    let client = MockClient::answering(&[200]);
    let (core, scope) = start(&temp, TrackingConsent::Pending, client.clone());

    for event in ["one", "two", "three"] {
        write(&scope, event, false);
    }
    core.set_tracking_consent(TrackingConsent::Granted);
    core.flush().await.unwrap();

    let report = core.upload_tick("logs").await.unwrap();

    assert_eq!(report.delivered, 1);
    assert_eq!(client.bodies(), vec!["one\ntwo\nthree"]);
    assert!(core.files("logs", BatchDirectory::Unauthorized).unwrap().is_empty());
    assert!(core.files("logs", BatchDirectory::Authorized).unwrap().is_empty());
    core.flush_and_tear_down().await.unwrap();
}

#[tokio::test]
async fn retryable_failure_keeps_file_until_delivered() {
    let temp = TempDir::new().unwrap();
    let client = MockClient::answering(&[503, 200]);
    let (core, scope) = start(&temp, TrackingConsent::Granted, client.clone());

    write(&scope, "event", false);
    core.flush().await.unwrap();

    let first = core.upload_tick("logs").await.unwrap();
    assert!(first.retry.is_some());
    let kept = core.files("logs", BatchDirectory::Authorized).unwrap();
    assert_eq!(kept.len(), 1);

    let second = core.upload_tick("logs").await.unwrap();
    assert_eq!(second.delivered, 1);
    assert!(!kept[0].exists());
    assert_eq!(client.bodies(), vec!["event", "event"]);

    core.upload_tick("logs").await.unwrap();
    assert_eq!(client.requests.lock().unwrap().len(), 2);
    core.flush_and_tear_down().await.unwrap();
}

#[tokio::test]
async fn bypass_write_under_not_granted_is_authorized() {
    let temp = TempDir::new().unwrap();
    let (core, scope) = start(&temp, TrackingConsent::NotGranted, MockClient::answering(&[]));

    write(&scope, "crash", true);
    write(&scope, "tracked", false);
    core.flush().await.unwrap();

    assert_eq!(stored_events(&core, BatchDirectory::Authorized), vec!["crash"]);
    assert!(stored_events(&core, BatchDirectory::Unauthorized).is_empty());
    core.flush_and_tear_down().await.unwrap();
}

#[tokio::test]
async fn revoking_pending_consent_purges_unauthorized_data() {
    let temp = TempDir::new().unwrap();
    let client = MockClient::answering(&[]);
    let (core, scope) = start(&temp, TrackingConsent::Pending, client.clone());

    write(&scope, "waiting", false);
    core.set_tracking_consent(TrackingConsent::NotGranted);
    write(&scope, "refused", false);
    core.flush().await.unwrap();

    assert!(core.files("logs", BatchDirectory::Unauthorized).unwrap().is_empty());
    assert!(core.files("logs", BatchDirectory::Authorized).unwrap().is_empty());

    core.set_tracking_consent(TrackingConsent::Granted);
    core.flush().await.unwrap();
    core.upload_tick("logs").await.unwrap();
    assert!(client.bodies().is_empty());
    core.flush_and_tear_down().await.unwrap();
}

#[tokio::test]
async fn granted_events_stay_authorized_after_revocation() {
    let temp = TempDir::new().unwrap();
    let (core, scope) = start(&temp, TrackingConsent::Granted, MockClient::answering(&[]));

    write(&scope, "approved", false);
    core.set_tracking_consent(TrackingConsent::NotGranted);
    write(&scope, "refused", false);
    core.flush().await.unwrap();

    assert_eq!(stored_events(&core, BatchDirectory::Authorized), vec!["approved"]);
    core.flush_and_tear_down().await.unwrap();
}

#[tokio::test]
async fn concurrent_writes_never_split_across_directories() {
    let temp = TempDir::new().unwrap();
    let (core, scope) = start(&temp, TrackingConsent::Pending, MockClient::answering(&[]));
    let consents: Arc<Mutex<HashMap<String, TrackingConsent>>> = Arc::default();

    let writers: Vec<_> = (0..4)
        .map(|thread| {
            let scope = scope.clone();
            let consents = consents.clone();
            std::thread::spawn(move || {
                for i in 0..50 {
                    let id = format!("{}-{}", thread, i);
                    let consents = consents.clone();
                    scope.event_write_context(false, move |_, writer| {
                        consents.lock().unwrap().insert(id.clone(), writer.consent());
                        writer.write(id.as_bytes());
                    });
                }
            })
        })
        .collect();

    for consent in [
        TrackingConsent::Granted,
        TrackingConsent::Pending,
        TrackingConsent::NotGranted,
        TrackingConsent::Pending,
        TrackingConsent::Granted,
    ] {
        core.set_tracking_consent(consent);
        tokio::task::yield_now().await;
    }
    for writer in writers {
        writer.join().unwrap();
    }
    core.flush().await.unwrap();

    let authorized = stored_events(&core, BatchDirectory::Authorized);
    let unauthorized = stored_events(&core, BatchDirectory::Unauthorized);
    let consents = consents.lock().unwrap();
    assert_eq!(consents.len(), 200);

    for event in &authorized {
        assert!(!unauthorized.contains(event), "{} stored twice", event);
        assert_ne!(consents[event], TrackingConsent::NotGranted, "{} leaked", event);
    }
    for (event, consent) in consents.iter() {
        if *consent == TrackingConsent::Granted {
            assert!(authorized.contains(event), "{} lost", event);
        }
    }
    core.flush_and_tear_down().await.unwrap();
}

#[tokio::test]
async fn uploads_through_reqwest_client() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v2/logs"))
        .and(header("DD-API-KEY", "token"))
        .and(body_string("first\nsecond"))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let temp = TempDir::new().unwrap();
    let config = config(&temp, TrackingConsent::Granted);
    let client = ReqwestClient::new(config.http_timeout).unwrap();
    let core = DatadogCore::new(config, Arc::new(client)).unwrap();
    let scope = core
        .register(&LogsFeature {
            url: format!("{}/api/v2/logs", server.uri()),
        })
        .unwrap();

    write(&scope, "first", false);
    write(&scope, "second", false);
    core.flush().await.unwrap();

    let report = core.upload_tick("logs").await.unwrap();
    assert_eq!(report.delivered, 1);
    assert!(core.files("logs", BatchDirectory::Authorized).unwrap().is_empty());
    core.flush_and_tear_down().await.unwrap();
}

#[tokio::test]
async fn teardown_uploads_remaining_batches() {
    let temp = TempDir::new().unwrap();
    let client = MockClient::answering(&[]);
    let (core, scope) = start(&temp, TrackingConsent::Granted, client.clone());

    write(&scope, "last words", false);
    core.flush_and_tear_down().await.unwrap();

    assert_eq!(client.bodies(), vec!["last words"]);
}

#[tokio::test]
async fn unknown_feature_is_reported() {
    let temp = TempDir::new().unwrap();
    let (core, _scope) = start(&temp, TrackingConsent::Granted, MockClient::answering(&[]));

    let result = core.upload_tick("rum").await;
    assert!(matches!(result, Err(CoreError::FeatureNotRegistered(name)) if name == "rum"));
    core.flush_and_tear_down().await.unwrap();
}
