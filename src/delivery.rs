//! Delivery worker: drains the broker into the portal.
//!
//! Three cooperative loops share a cancellation token. The delivery loop
//! consumes a batch of `detections` messages each tick, POSTs each one with
//! signed headers, and acks or nacks based on the tagged transport result.
//! The cleanup loop trims expired messages, old ack-log rows, and stale event
//! logs hourly. The heartbeat loop reports device status and telemetry.
//!
//! The worker owns no durable state; it only holds ack tokens for the batch
//! currently in hand. A crash mid-batch is repaired by the broker's
//! visibility-timeout reclaim.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::broker::{MessageBroker, PublishOptions};
use crate::clock::Clock;
use crate::error::Error;
use crate::events::EventLogger;
use crate::health::HealthReporter;
use crate::images::ImageLoader;
use crate::location::Location;
use crate::message::{payload_checksum, Message, MessagePriority};
use crate::portal::{ApiResponse, PortalClient, TransportError};

pub const TOPIC_DETECTIONS: &str = "detections";
pub const TOPIC_HEARTBEAT: &str = "heartbeat";
pub const TOPIC_ALERTS: &str = "alerts";

#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    pub delivery_interval: Duration,
    pub batch_size: usize,
    pub max_image_size_kb: u64,
    pub cleanup_interval: Duration,
    pub heartbeat_interval: Duration,
    pub ack_log_retention_days: i64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            delivery_interval: Duration::from_secs(5),
            batch_size: 10,
            max_image_size_kb: 500,
            cleanup_interval: Duration::from_secs(3600),
            heartbeat_interval: Duration::from_secs(60),
            ack_log_retention_days: 7,
        }
    }
}

/// A detection event as handed over by the inference side.
#[derive(Debug, Clone)]
pub struct Detection {
    pub class_name: String,
    pub class_id: i64,
    pub confidence: f64,
    pub bbox: Vec<i64>,
    pub camera_id: String,
    pub timestamp: Option<f64>,
    pub image_path: Option<String>,
    pub image_data: Option<Vec<u8>>,
    pub priority: MessagePriority,
    pub metadata: Value,
}

impl Detection {
    pub fn new(
        class_name: impl Into<String>,
        class_id: i64,
        confidence: f64,
        bbox: Vec<i64>,
        camera_id: impl Into<String>,
    ) -> Self {
        Self {
            class_name: class_name.into(),
            class_id,
            confidence,
            bbox,
            camera_id: camera_id.into(),
            timestamp: None,
            image_path: None,
            image_data: None,
            priority: MessagePriority::Normal,
            metadata: json!({}),
        }
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_image_data(mut self, data: Vec<u8>) -> Self {
        self.image_data = Some(data);
        self
    }

    pub fn with_image_path(mut self, path: impl Into<String>) -> Self {
        self.image_path = Some(path.into());
        self
    }
}

#[derive(Debug, Default)]
struct MetricsInner {
    total_attempts: u64,
    successful: u64,
    failed: u64,
    retried: u64,
    total_latency_ms: f64,
    last_success_time: Option<f64>,
    last_failure_time: Option<f64>,
    consecutive_failures: u64,
    queue_pending: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeliveryMetricsSnapshot {
    pub total_attempts: u64,
    pub successful: u64,
    pub failed: u64,
    pub retried: u64,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub last_success_time: Option<f64>,
    pub last_failure_time: Option<f64>,
    pub consecutive_failures: u64,
    pub queue_pending: i64,
}

pub struct DeliveryMetrics {
    clock: Arc<dyn Clock>,
    inner: Mutex<MetricsInner>,
}

impl DeliveryMetrics {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            inner: Mutex::new(MetricsInner::default()),
        }
    }

    pub fn record_success(&self, latency_ms: f64) {
        let mut inner = self.inner.lock().expect("metrics lock");
        inner.total_attempts += 1;
        inner.successful += 1;
        inner.total_latency_ms += latency_ms;
        inner.last_success_time = Some(self.clock.now());
        inner.consecutive_failures = 0;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("metrics lock");
        inner.total_attempts += 1;
        inner.failed += 1;
        inner.last_failure_time = Some(self.clock.now());
        inner.consecutive_failures += 1;
    }

    pub fn record_retry(&self) {
        self.inner.lock().expect("metrics lock").retried += 1;
    }

    pub fn set_queue_pending(&self, pending: i64) {
        self.inner.lock().expect("metrics lock").queue_pending = pending;
    }

    pub fn snapshot(&self) -> DeliveryMetricsSnapshot {
        let inner = self.inner.lock().expect("metrics lock");
        let success_rate = if inner.total_attempts == 0 {
            100.0
        } else {
            inner.successful as f64 / inner.total_attempts as f64 * 100.0
        };
        let avg_latency_ms = if inner.successful == 0 {
            0.0
        } else {
            inner.total_latency_ms / inner.successful as f64
        };
        DeliveryMetricsSnapshot {
            total_attempts: inner.total_attempts,
            successful: inner.successful,
            failed: inner.failed,
            retried: inner.retried,
            success_rate,
            avg_latency_ms,
            last_success_time: inner.last_success_time,
            last_failure_time: inner.last_failure_time,
            consecutive_failures: inner.consecutive_failures,
            queue_pending: inner.queue_pending,
        }
    }
}

pub struct DeliveryWorker {
    broker: Arc<MessageBroker>,
    portal: Option<Arc<PortalClient>>,
    images: Arc<dyn ImageLoader>,
    events: Arc<EventLogger>,
    metrics: Arc<DeliveryMetrics>,
    reporter: Option<Arc<dyn HealthReporter>>,
    clock: Arc<dyn Clock>,
    config: DeliveryConfig,
    device_id: String,
    device_info: Value,
    location: std::sync::RwLock<Location>,
    detection_seq: AtomicU64,
    detection_count: AtomicU64,
    start_time: f64,
}

impl DeliveryWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        broker: Arc<MessageBroker>,
        portal: Option<Arc<PortalClient>>,
        images: Arc<dyn ImageLoader>,
        events: Arc<EventLogger>,
        metrics: Arc<DeliveryMetrics>,
        reporter: Option<Arc<dyn HealthReporter>>,
        clock: Arc<dyn Clock>,
        config: DeliveryConfig,
        device_id: impl Into<String>,
        device_info: Value,
        location: Location,
    ) -> Self {
        let start_time = clock.now();
        Self {
            broker,
            portal,
            images,
            events,
            metrics,
            reporter,
            clock,
            config,
            device_id: device_id.into(),
            device_info,
            location: std::sync::RwLock::new(location),
            detection_seq: AtomicU64::new(0),
            detection_count: AtomicU64::new(0),
            start_time,
        }
    }

    pub fn is_online(&self) -> bool {
        self.portal.is_some()
    }

    pub fn metrics(&self) -> &Arc<DeliveryMetrics> {
        &self.metrics
    }

    pub fn set_location(&self, location: Location) {
        *self.location.write().expect("location lock") = location;
    }

    pub fn location(&self) -> Location {
        self.location.read().expect("location lock").clone()
    }

    /// Queues a detection for guaranteed delivery and writes the audit record.
    /// The idempotency key doubles as the server-side `event_id`.
    pub async fn queue_detection(&self, detection: Detection) -> Result<Option<String>, Error> {
        let now = self.clock.now();
        let seq = self.detection_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let event_id = format!("det_{}_{}_{}", self.device_id, (now * 1000.0) as i64, seq);

        let image_base64 = detection.image_data.as_deref().map(|d| STANDARD.encode(d));
        let location = self.location().to_value();

        let payload = json!({
            "detection_id": seq,
            "class_name": detection.class_name,
            "class_id": detection.class_id,
            "confidence": detection.confidence,
            "bbox": detection.bbox,
            "camera_id": detection.camera_id,
            "timestamp": detection.timestamp.unwrap_or(now),
            "image_path": detection.image_path,
            "image_base64": image_base64,
            "location": location,
            "metadata": detection.metadata,
        });

        let queued = self
            .broker
            .publish(
                TOPIC_DETECTIONS,
                &payload,
                PublishOptions {
                    priority: detection.priority,
                    idempotency_key: Some(event_id.clone()),
                    metadata: Some(json!({
                        "device_id": self.device_id,
                        "class_name": detection.class_name,
                        "queued_at": now,
                    })),
                    ..PublishOptions::default()
                },
            )
            .await?;

        if let Some(id) = &queued {
            self.detection_count.fetch_add(1, Ordering::Relaxed);
            self.events.log_detection(
                id,
                &detection.class_name,
                detection.confidence,
                &detection.bbox,
                &detection.camera_id,
                detection.image_path.as_deref(),
                Some(self.location().to_value()),
                detection.metadata.clone(),
            );
            tracing::debug!(%id, class_name = %detection.class_name, "queued detection");
        }

        Ok(queued)
    }

    /// One delivery pass: consume a batch and settle every message.
    pub async fn process_pending(&self) -> Result<(), Error> {
        let Some(portal) = self.portal.clone() else {
            return Ok(());
        };

        let messages = self
            .broker
            .consume(TOPIC_DETECTIONS, self.config.batch_size)
            .await?;

        for message in messages {
            let Some(token) = message.ack_token.clone() else {
                continue;
            };

            // A payload that no longer matches its stored checksum is corrupt;
            // retrying cannot fix it.
            let intact = payload_checksum(&message.payload)
                .map(|sum| sum == message.checksum)
                .unwrap_or(false);
            if !intact {
                let error = "payload checksum mismatch";
                self.broker.nack(&message.id, &token, error, false).await?;
                self.events.log_system_error("delivery", error);
                tracing::error!(message_id = %message.id, "corrupt payload dead-lettered");
                continue;
            }

            let attempt = message.attempts + 1;
            self.events.log_upload_started(&message.id, attempt);

            let started = Instant::now();
            let outcome = self.deliver_detection(&portal, &message).await;
            let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

            match outcome {
                Ok(response) => {
                    let value = response.to_value();
                    self.broker.ack(&message.id, &token, Some(&value)).await?;
                    self.metrics.record_success(latency_ms);
                    self.events.log_upload_success(&message.id, Some(value));
                    tracing::info!(
                        message_id = %message.id,
                        attempt,
                        latency_ms = latency_ms as i64,
                        "detection delivered"
                    );
                }
                Err(error) => {
                    let error = error.to_string();
                    // The broker increments attempts by exactly one on nack,
                    // so `attempt` matches what lands in the store.
                    let will_retry = attempt < message.max_attempts;
                    self.broker.nack(&message.id, &token, &error, true).await?;
                    self.metrics.record_failure();
                    self.metrics.record_retry();
                    self.events.log_upload_failed(&message.id, &error, attempt);
                    if will_retry {
                        self.events.log_upload_retry(
                            &message.id,
                            attempt,
                            self.broker.retry_backoff(attempt),
                        );
                    }
                    tracing::warn!(message_id = %message.id, %error, "detection delivery failed");
                }
            }
        }

        if let Ok(stats) = self.broker.stats().await {
            self.metrics.set_queue_pending(stats.queue_pending);
        }
        Ok(())
    }

    async fn deliver_detection(
        &self,
        portal: &PortalClient,
        message: &Message,
    ) -> Result<ApiResponse, TransportError> {
        let payload = message.payload.as_object().cloned().unwrap_or_default();

        let mut image_base64 = payload
            .get("image_base64")
            .and_then(Value::as_str)
            .map(str::to_string);
        if image_base64.is_none() {
            if let Some(path) = payload.get("image_path").and_then(Value::as_str) {
                match self
                    .images
                    .load_base64(path, self.config.max_image_size_kb)
                    .await
                {
                    Ok(encoded) => image_base64 = Some(encoded),
                    Err(e) => {
                        tracing::warn!(
                            message_id = %message.id,
                            path,
                            error = %e,
                            "delivering detection without image"
                        );
                    }
                }
            }
        }

        let mut metadata = payload
            .get("metadata")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        metadata.insert("device_info".into(), self.device_info.clone());
        metadata.insert("delivery_timestamp".into(), json!(self.clock.now()));
        metadata.insert("attempt".into(), json!(message.attempts + 1));
        metadata.insert("message_checksum".into(), json!(message.checksum));

        let body = json!({
            "event_id": message.id,
            "device_id": self.device_id,
            "camera_id": payload.get("camera_id").cloned().unwrap_or(json!("")),
            "timestamp": payload.get("timestamp").cloned().unwrap_or(json!(self.clock.now())),
            "class_name": payload.get("class_name").cloned().unwrap_or(json!("")),
            "class_id": payload.get("class_id").cloned().unwrap_or(json!(0)),
            "confidence": payload.get("confidence").cloned().unwrap_or(json!(0.0)),
            "bbox": payload.get("bbox").cloned().unwrap_or(json!([])),
            "image_base64": image_base64,
            "location": self.location().to_value(),
            "metadata": metadata,
        });

        portal.send_detection(&message.id, &body).await
    }

    pub fn spawn_delivery(self: &Arc<Self>, token: CancellationToken) -> tokio::task::JoinHandle<()> {
        let worker = Arc::clone(self);
        tokio::spawn(async move {
            tracing::info!("delivery loop started");
            loop {
                if let Err(e) = worker.process_pending().await {
                    tracing::error!(error = %e, "delivery loop error");
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(worker.config.delivery_interval) => {}
                }
            }
            tracing::info!("delivery loop stopped");
        })
    }

    pub fn spawn_cleanup(self: &Arc<Self>, token: CancellationToken) -> tokio::task::JoinHandle<()> {
        let worker = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(worker.config.cleanup_interval) => {}
                }
                if let Err(e) = worker.broker.cleanup_expired().await {
                    tracing::error!(error = %e, "expired-message cleanup failed");
                }
                if let Err(e) = worker
                    .broker
                    .cleanup_ack_logs(worker.config.ack_log_retention_days)
                    .await
                {
                    tracing::error!(error = %e, "ack-log cleanup failed");
                }
                worker.events.cleanup_old_logs();
            }
        })
    }

    pub fn spawn_heartbeat(self: &Arc<Self>, token: CancellationToken) -> tokio::task::JoinHandle<()> {
        let worker = Arc::clone(self);
        tokio::spawn(async move {
            let Some(portal) = worker.portal.clone() else {
                return;
            };
            loop {
                match portal.send_heartbeat(&worker.heartbeat_body().await).await {
                    Ok(_) => tracing::debug!("heartbeat sent"),
                    Err(e) => tracing::debug!(error = %e, "heartbeat failed"),
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(worker.config.heartbeat_interval) => {}
                }
            }
        })
    }

    async fn heartbeat_body(&self) -> Value {
        let now = self.clock.now();
        let queue = match self.broker.stats().await {
            Ok(stats) => json!({
                "pending": stats.queue_pending,
                "in_flight": stats.queue_in_flight,
                "dead_letter": stats.dead_letter_queue,
            }),
            Err(_) => json!({}),
        };
        let health = self.reporter.as_ref().map(|r| {
            let report = r.report();
            json!({
                "overall_status": report.overall_status,
                "system": report.gauges,
                "active_alerts": report.active_alerts,
            })
        });

        json!({
            "device_id": self.device_id,
            "timestamp": now,
            "status": "online",
            "info": self.device_info,
            "location": self.location().to_value(),
            "stats": {
                "uptime_seconds": now - self.start_time,
                "detection_count": self.detection_count.load(Ordering::Relaxed),
                "delivery": self.metrics.snapshot(),
                "queue": queue,
                "health": health,
            },
        })
    }
}
