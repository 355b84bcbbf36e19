//! Edge wildlife-detection agent with guaranteed event delivery.
//!
//! Producers hand detection events to the [`delivery::DeliveryWorker`], which
//! queues them in the durable [`broker::MessageBroker`] and drains them to the
//! portal over signed HTTP. The [`health::HealthMonitor`] watches the whole
//! pipeline and the host. [`Agent`] is the wiring step: it builds each
//! component with only the capabilities it needs (a clock, a signer, an image
//! loader, a health reporter) and owns the background-loop lifecycle.

use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use tokio_util::sync::CancellationToken;

pub mod broker;
pub mod circuit;
pub mod clock;
pub mod config;
pub mod delivery;
pub mod error;
pub mod events;
pub mod health;
pub mod images;
pub mod location;
pub mod message;
pub mod portal;
pub mod signer;

pub use config::Config;
pub use error::Error;

use broker::MessageBroker;
use clock::{Clock, SystemClock};
use delivery::{DeliveryMetrics, DeliveryWorker};
use events::EventLogger;
use health::{HealthMonitor, HealthReporter};
use images::FsImageStore;
use location::Location;
use portal::PortalClient;
use signer::HmacSigner;

const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Agent {
    broker: Arc<MessageBroker>,
    worker: Arc<DeliveryWorker>,
    health: Arc<HealthMonitor>,
    portal: Option<Arc<PortalClient>>,
    device_info: serde_json::Value,
    token: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Agent {
    /// Builds the component graph from an immutable config snapshot. Nothing
    /// starts running until [`Agent::start`].
    pub async fn bootstrap(config: Config) -> Result<Self, Error> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let device_id = config.device_id().to_string();

        let broker = Arc::new(
            MessageBroker::connect(config.broker_config(), Arc::clone(&clock)).await?,
        );

        let events = Arc::new(
            EventLogger::new(
                config.event_log_dir(),
                &device_id,
                config
                    .event_retention_days
                    .unwrap_or(config::defaults::EVENT_RETENTION_DAYS),
                config
                    .event_max_file_mb
                    .unwrap_or(config::defaults::EVENT_MAX_FILE_MB),
                Arc::clone(&clock),
            )
            .map_err(|e| Error::io(config.event_log_dir().display().to_string(), e))?,
        );

        let location = Location::load_cached(&config.location_cache_path()).unwrap_or_else(|| {
            Location::configured(
                config.location_name(),
                config.latitude.unwrap_or(0.0),
                config.longitude.unwrap_or(0.0),
            )
        });

        let portal = match (&config.api_url, &config.api_key) {
            (Some(url), Some(key)) => {
                let secret = config
                    .device_secret
                    .clone()
                    .unwrap_or_else(|| SecretString::new(String::new()));
                if secret.expose_secret().is_empty() {
                    tracing::warn!("no device secret configured, request signing disabled");
                }
                Some(Arc::new(PortalClient::new(
                    url.clone(),
                    key.clone(),
                    device_id.clone(),
                    config.request_timeout(),
                    Arc::new(HmacSigner::new(secret)),
                    Arc::clone(&clock),
                )?))
            }
            _ => {
                tracing::warn!("portal not configured, running in offline mode");
                None
            }
        };

        let metrics = Arc::new(DeliveryMetrics::new(Arc::clone(&clock)));

        let health = Arc::new(HealthMonitor::new(
            config.health_config(),
            &device_id,
            config.data_dir(),
            Arc::clone(&clock),
        ));
        health.register_check("delivery", health::delivery_check(Arc::clone(&metrics)));

        let device_info = json!({
            "name": config.device_name(),
            "environment": config.environment(),
            "version": env!("CARGO_PKG_VERSION"),
            "location": location.to_value(),
        });

        let worker = Arc::new(DeliveryWorker::new(
            Arc::clone(&broker),
            portal.clone(),
            Arc::new(FsImageStore::new(config.data_dir().join("captures"))),
            events,
            metrics,
            Some(Arc::clone(&health) as Arc<dyn HealthReporter>),
            Arc::clone(&clock),
            config.delivery_config(),
            &device_id,
            device_info.clone(),
            location,
        ));

        Ok(Self {
            broker,
            worker,
            health,
            portal,
            device_info,
            token: CancellationToken::new(),
            tasks: Vec::new(),
        })
    }

    /// Spawns the background loops. Delivery and heartbeat only run with a
    /// configured portal; the broker keeps accepting publishes either way.
    pub fn start(&mut self) {
        self.tasks
            .push(Arc::clone(&self.health).spawn(self.token.child_token()));
        self.tasks
            .push(self.worker.spawn_cleanup(self.token.child_token()));

        if let Some(portal) = &self.portal {
            let portal = Arc::clone(portal);
            let info = self.device_info.clone();
            tokio::spawn(async move {
                match portal.register_device(&info).await {
                    Ok(_) => tracing::info!("device registered with portal"),
                    Err(e) => tracing::warn!(error = %e, "device registration failed"),
                }
            });

            self.tasks
                .push(self.worker.spawn_delivery(self.token.child_token()));
            self.tasks
                .push(self.worker.spawn_heartbeat(self.token.child_token()));
        }

        tracing::info!("agent started");
    }

    /// Cancels every loop and waits up to the stop deadline for them to
    /// drain. A request in flight is allowed to finish or time out; its
    /// message returns via the visibility-timeout reclaim if unsettled.
    pub async fn stop(self) {
        self.token.cancel();

        let join_all = async {
            for task in self.tasks {
                let _ = task.await;
            }
        };
        if tokio::time::timeout(STOP_JOIN_TIMEOUT, join_all).await.is_err() {
            tracing::warn!("background loops did not stop within the deadline");
        }

        tracing::info!("agent stopped");
    }

    pub fn broker(&self) -> &Arc<MessageBroker> {
        &self.broker
    }

    pub fn delivery(&self) -> &Arc<DeliveryWorker> {
        &self.worker
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }
}
