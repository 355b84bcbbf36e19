use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use hmac::{Hmac, Mac};
use optic_agent::broker::{BrokerConfig, MessageBroker};
use optic_agent::clock::{Clock, ManualClock};
use optic_agent::delivery::{DeliveryConfig, DeliveryMetrics, DeliveryWorker, Detection};
use optic_agent::events::EventLogger;
use optic_agent::images::FsImageStore;
use optic_agent::location::Location;
use optic_agent::message::MessagePriority;
use optic_agent::portal::PortalClient;
use optic_agent::signer::HmacSigner;
use secrecy::SecretString;
use serde_json::{json, Value};
use sha2::Sha256;
use tempfile::TempDir;

const DEVICE_SECRET: &str = "test-device-secret";
const T0: f64 = 1_700_000_000.0;

#[derive(Debug, Clone)]
struct Received {
    body: Value,
    message_id: Option<String>,
    api_key: Option<String>,
    device_id: Option<String>,
    signature_valid: bool,
}

#[derive(Clone)]
struct PortalState {
    requests: Arc<Mutex<Vec<Received>>>,
    failures_remaining: Arc<Mutex<u32>>,
    reject_with_success_false: bool,
}

fn verify_signature(headers: &HeaderMap, body: &str) -> bool {
    let Some(timestamp) = headers.get("x-timestamp").and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let Some(signature) = headers.get("x-signature").and_then(|v| v.to_str().ok()) else {
        return false;
    };

    let mut mac =
        Hmac::<Sha256>::new_from_slice(DEVICE_SECRET.as_bytes()).expect("any key length");
    mac.update(format!("{timestamp}.{body}").as_bytes());
    hex::encode(mac.finalize().into_bytes()) == signature
}

async fn detections(
    State(state): State<PortalState>,
    headers: HeaderMap,
    body: String,
) -> (StatusCode, Json<Value>) {
    let received = Received {
        body: serde_json::from_str(&body).unwrap_or(Value::Null),
        message_id: headers
            .get("x-message-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        api_key: headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        device_id: headers
            .get("x-device-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        signature_valid: verify_signature(&headers, &body),
    };
    state.requests.lock().unwrap().push(received);

    {
        let mut failures = state.failures_remaining.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"success": false, "error": "maintenance"})),
            );
        }
    }

    if state.reject_with_success_false {
        return (
            StatusCode::OK,
            Json(json!({"success": false, "error": "bad payload"})),
        );
    }

    let ack = format!("s-{}", state.requests.lock().unwrap().len());
    (StatusCode::OK, Json(json!({"success": true, "ack_id": ack})))
}

async fn start_portal(failures: u32, reject_with_success_false: bool) -> (String, PortalState) {
    let state = PortalState {
        requests: Arc::new(Mutex::new(Vec::new())),
        failures_remaining: Arc::new(Mutex::new(failures)),
        reject_with_success_false,
    };

    let app = Router::new()
        .route("/devices/detections", post(detections))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{addr}/"), state)
}

struct TestRig {
    broker: Arc<MessageBroker>,
    worker: Arc<DeliveryWorker>,
    clock: Arc<ManualClock>,
    tmpdir: TempDir,
}

/// Reads every record written to the rig's event-log directory.
fn read_event_records(rig: &TestRig) -> Vec<Value> {
    let dir = rig.tmpdir.path().join("event_logs");
    let mut records = Vec::new();
    for entry in std::fs::read_dir(dir).unwrap().flatten() {
        let content = std::fs::read_to_string(entry.path()).unwrap();
        for line in content.lines() {
            records.push(serde_json::from_str(line).unwrap());
        }
    }
    records
}

fn attempts_of(records: &[Value], event_type: &str) -> Vec<i64> {
    let mut attempts: Vec<i64> = records
        .iter()
        .filter(|r| r["event_type"] == event_type)
        .map(|r| r["metadata"]["attempt"].as_i64().unwrap())
        .collect();
    attempts.sort_unstable();
    attempts
}

async fn setup(base_url: &str, tweak: impl FnOnce(&mut BrokerConfig)) -> TestRig {
    let tmpdir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(T0));

    let mut config = BrokerConfig {
        db_path: tmpdir.path().join("broker.db"),
        ..BrokerConfig::default()
    };
    tweak(&mut config);

    let broker = Arc::new(
        MessageBroker::connect(config, Arc::clone(&clock) as Arc<dyn Clock>)
            .await
            .unwrap(),
    );

    let portal = Arc::new(
        PortalClient::new(
            base_url.parse().unwrap(),
            "api-key-1".to_string(),
            "dev-1".to_string(),
            std::time::Duration::from_secs(5),
            Arc::new(HmacSigner::new(SecretString::new(DEVICE_SECRET.into()))),
            Arc::clone(&clock) as Arc<dyn Clock>,
        )
        .unwrap(),
    );

    let events = Arc::new(
        EventLogger::new(
            tmpdir.path().join("event_logs"),
            "dev-1",
            30,
            50,
            Arc::clone(&clock) as Arc<dyn Clock>,
        )
        .unwrap(),
    );

    let metrics = Arc::new(DeliveryMetrics::new(Arc::clone(&clock) as Arc<dyn Clock>));

    let worker = Arc::new(DeliveryWorker::new(
        Arc::clone(&broker),
        Some(portal),
        Arc::new(FsImageStore::new(tmpdir.path().join("captures"))),
        events,
        metrics,
        None,
        Arc::clone(&clock) as Arc<dyn Clock>,
        DeliveryConfig::default(),
        "dev-1",
        json!({"name": "ridge cam", "environment": "test"}),
        Location::configured("north ridge", 47.2, 8.5),
    ));

    TestRig {
        broker,
        worker,
        clock,
        tmpdir,
    }
}

#[tokio::test]
async fn delivers_and_acks_on_success() {
    let (base_url, portal) = start_portal(0, false).await;
    let rig = setup(&base_url, |_| {}).await;

    let id = rig
        .worker
        .queue_detection(Detection::new("deer", 3, 0.91, vec![10, 20, 110, 220], "cam-0"))
        .await
        .unwrap()
        .expect("queued");

    rig.worker.process_pending().await.unwrap();

    let requests = portal.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert!(request.signature_valid, "HMAC signature must verify");
    assert_eq!(request.message_id.as_deref(), Some(id.as_str()));
    assert_eq!(request.api_key.as_deref(), Some("api-key-1"));
    assert_eq!(request.device_id.as_deref(), Some("dev-1"));

    assert_eq!(request.body["event_id"], id.as_str());
    assert_eq!(request.body["device_id"], "dev-1");
    assert_eq!(request.body["class_name"], "deer");
    assert_eq!(request.body["class_id"], 3);
    assert_eq!(request.body["confidence"], 0.91);
    assert_eq!(request.body["bbox"], json!([10, 20, 110, 220]));
    assert_eq!(request.body["location"]["name"], "north ridge");
    assert_eq!(request.body["metadata"]["attempt"], 1);

    let stats = rig.broker.stats().await.unwrap();
    assert_eq!(stats.acknowledged, 1);
    assert_eq!(stats.queue_pending, 0);
    assert_eq!(stats.queue_in_flight, 0);
    assert_eq!(rig.broker.ack_log_count(&id).await.unwrap(), 1);

    let metrics = rig.worker.metrics().snapshot();
    assert_eq!(metrics.successful, 1);
    assert_eq!(metrics.consecutive_failures, 0);
}

#[tokio::test]
async fn retries_through_outage_then_delivers() {
    let (base_url, portal) = start_portal(2, false).await;
    // Zero backoff base so every pass sees the rescheduled message without
    // advancing far through the retry curve.
    let rig = setup(&base_url, |c| c.backoff_base = 0.0).await;

    let id = rig
        .worker
        .queue_detection(Detection::new("boar", 7, 0.84, vec![5, 5, 60, 80], "cam-0"))
        .await
        .unwrap()
        .unwrap();

    rig.worker.process_pending().await.unwrap();
    rig.worker.process_pending().await.unwrap();
    rig.worker.process_pending().await.unwrap();

    assert_eq!(portal.requests.lock().unwrap().len(), 3);

    let stats = rig.broker.stats().await.unwrap();
    assert_eq!(stats.acknowledged, 1);
    assert_eq!(stats.failed, 2);
    assert_eq!(stats.queue_pending, 0);
    assert_eq!(stats.dead_letter_queue, 0);

    // Two nacks and the final acknowledgment all hit the audit trail.
    assert_eq!(rig.broker.ack_log_count(&id).await.unwrap(), 3);

    let metrics = rig.worker.metrics().snapshot();
    assert_eq!(metrics.successful, 1);
    assert_eq!(metrics.failed, 2);
    assert_eq!(metrics.retried, 2);
}

#[tokio::test]
async fn persistent_failure_dead_letters_after_max_attempts() {
    let (base_url, portal) = start_portal(u32::MAX, false).await;
    let rig = setup(&base_url, |c| {
        c.backoff_base = 0.0;
        c.max_attempts = 3;
    })
    .await;

    rig.worker
        .queue_detection(Detection::new("lynx", 9, 0.77, vec![1, 2, 3, 4], "cam-0"))
        .await
        .unwrap()
        .unwrap();

    for _ in 0..3 {
        rig.worker.process_pending().await.unwrap();
    }

    assert_eq!(portal.requests.lock().unwrap().len(), 3);

    let stats = rig.broker.stats().await.unwrap();
    assert_eq!(stats.queue_pending, 0);
    assert_eq!(stats.queue_in_flight, 0);
    assert_eq!(stats.dead_letter_queue, 1);

    let dead = rig.broker.dead_letter_messages(None, 10).await.unwrap();
    assert_eq!(dead[0].attempts, 3);
    assert!(dead[0].last_error.as_deref().unwrap_or("").contains("503"));
}

#[tokio::test]
async fn event_log_attempts_match_the_ack_log() {
    let (base_url, _portal) = start_portal(u32::MAX, false).await;
    let rig = setup(&base_url, |c| {
        c.backoff_base = 0.0;
        c.max_attempts = 3;
    })
    .await;

    let id = rig
        .worker
        .queue_detection(Detection::new("wolf", 4, 0.88, vec![3, 3, 40, 40], "cam-0"))
        .await
        .unwrap()
        .unwrap();

    for _ in 0..3 {
        rig.worker.process_pending().await.unwrap();
    }

    let records = read_event_records(&rig);
    let started = attempts_of(&records, "upload_started");
    let failed = attempts_of(&records, "upload_failed");
    let retried = attempts_of(&records, "upload_retry");

    assert_eq!(started, vec![1, 2, 3]);
    assert_eq!(failed, vec![1, 2, 3]);
    // The dead-lettering attempt schedules no retry.
    assert_eq!(retried, vec![1, 2]);

    // Audit trails agree: the event log's final attempt number is the
    // attempt count stored on the dead-letter row, and every failed attempt
    // has a matching nack entry in the ack log.
    let dead = rig.broker.dead_letter_messages(None, 10).await.unwrap();
    assert_eq!(dead[0].attempts, *failed.last().unwrap());
    assert_eq!(
        rig.broker.ack_log_count(&id).await.unwrap(),
        failed.len() as i64
    );
}

#[tokio::test]
async fn server_rejection_is_nacked_for_retry() {
    let (base_url, portal) = start_portal(0, true).await;
    let rig = setup(&base_url, |_| {}).await;

    rig.worker
        .queue_detection(Detection::new("fox", 2, 0.66, vec![0, 0, 30, 30], "cam-1"))
        .await
        .unwrap()
        .unwrap();

    rig.worker.process_pending().await.unwrap();

    assert_eq!(portal.requests.lock().unwrap().len(), 1);

    let stats = rig.broker.stats().await.unwrap();
    assert_eq!(stats.acknowledged, 0);
    assert_eq!(stats.failed, 1);
    // Nacked back to pending with backoff, not dead-lettered.
    assert_eq!(stats.queue_pending, 1);
    assert_eq!(stats.dead_letter_queue, 0);

    let metrics = rig.worker.metrics().snapshot();
    assert_eq!(metrics.failed, 1);
    assert_eq!(metrics.consecutive_failures, 1);
}

#[tokio::test]
async fn missing_image_file_does_not_block_delivery() {
    let (base_url, portal) = start_portal(0, false).await;
    let rig = setup(&base_url, |_| {}).await;

    rig.worker
        .queue_detection(
            Detection::new("owl", 5, 0.59, vec![8, 8, 90, 90], "cam-0")
                .with_image_path("missing/frame.jpg"),
        )
        .await
        .unwrap()
        .unwrap();

    rig.worker.process_pending().await.unwrap();

    let requests = portal.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].body["image_base64"], Value::Null);

    let stats = rig.broker.stats().await.unwrap();
    assert_eq!(stats.acknowledged, 1);
}

#[tokio::test]
async fn inline_image_bytes_are_delivered_base64() {
    let (base_url, portal) = start_portal(0, false).await;
    let rig = setup(&base_url, |_| {}).await;

    rig.worker
        .queue_detection(
            Detection::new("bear", 1, 0.95, vec![12, 14, 200, 230], "cam-0")
                .with_priority(MessagePriority::Critical)
                .with_image_data(b"jpegbytes".to_vec()),
        )
        .await
        .unwrap()
        .unwrap();

    rig.worker.process_pending().await.unwrap();

    let requests = portal.requests.lock().unwrap().clone();
    assert_eq!(requests[0].body["image_base64"], "anBlZ2J5dGVz");
}

#[tokio::test]
async fn consecutive_queue_detections_get_distinct_event_ids() {
    let (base_url, _portal) = start_portal(0, false).await;
    let rig = setup(&base_url, |_| {}).await;

    let first = rig
        .worker
        .queue_detection(Detection::new("deer", 3, 0.91, vec![1, 1, 2, 2], "cam-0"))
        .await
        .unwrap()
        .unwrap();
    rig.clock.advance(0.5);
    let second = rig
        .worker
        .queue_detection(Detection::new("deer", 3, 0.92, vec![1, 1, 2, 2], "cam-0"))
        .await
        .unwrap()
        .unwrap();

    assert_ne!(first, second);
    assert!(first.starts_with("det_dev-1_"));
    assert_eq!(rig.broker.stats().await.unwrap().queue_pending, 2);
}
