//! Agent configuration.
//!
//! Loaded once from `OPTIC_`-prefixed environment variables and passed into
//! component constructors as an immutable value. Accessors fall back to the
//! `defaults` module so a bare environment still yields a runnable agent
//! (offline mode when the portal URL or API key is missing).

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;
use url::Url;

use crate::broker::BrokerConfig;
use crate::delivery::DeliveryConfig;
use crate::health::HealthConfig;

pub mod defaults {
    pub const DEVICE_ID: &str = "optic-dev";
    pub const DEVICE_NAME: &str = "OPTIC device";
    pub const DATA_DIR: &str = "data";
    pub const LOCATION_NAME: &str = "unknown";

    pub const MAX_QUEUE_SIZE: i64 = 50_000;
    pub const MAX_IN_FLIGHT: i64 = 100;
    pub const VISIBILITY_TIMEOUT_SECS: f64 = 300.0;
    pub const DEDUP_WINDOW_SECS: f64 = 300.0;
    pub const MAX_ATTEMPTS: i64 = 10;
    pub const BACKOFF_BASE_SECS: f64 = 30.0;
    pub const BACKOFF_MAX_SECS: f64 = 3600.0;
    pub const MESSAGE_TTL_SECS: f64 = 86_400.0 * 7.0;

    pub const DELIVERY_INTERVAL_SECS: u64 = 5;
    pub const BATCH_SIZE: usize = 10;
    pub const MAX_IMAGE_SIZE_KB: u64 = 500;
    pub const REQUEST_TIMEOUT_SECS: u64 = 60;
    pub const CLEANUP_INTERVAL_SECS: u64 = 3600;
    pub const HEARTBEAT_INTERVAL_SECS: u64 = 60;
    pub const ACK_LOG_RETENTION_DAYS: i64 = 7;

    pub const HEALTH_CHECK_INTERVAL_SECS: u64 = 30;
    pub const ALERT_COOLDOWN_SECS: f64 = 300.0;

    pub const EVENT_RETENTION_DAYS: u64 = 30;
    pub const EVENT_MAX_FILE_MB: u64 = 50;

    pub const MAX_RESTART_ATTEMPTS: u32 = 5;
    pub const RESTART_DELAY_SECS: u64 = 10;
}

#[derive(Clone, Deserialize, Default)]
pub struct Config {
    pub api_url: Option<Url>,
    pub api_key: Option<String>,
    pub device_id: Option<String>,
    pub device_name: Option<String>,
    pub device_secret: Option<SecretString>,
    pub env: Option<String>,
    // Read as a raw string: the convention is OPTIC_DEBUG=1.
    pub debug: Option<String>,
    pub data_dir: Option<PathBuf>,

    pub location_name: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,

    pub max_queue_size: Option<i64>,
    pub max_in_flight: Option<i64>,
    pub visibility_timeout_secs: Option<f64>,
    pub disable_dedup: Option<bool>,
    pub dedup_window_secs: Option<f64>,
    pub max_attempts: Option<i64>,
    pub backoff_base_secs: Option<f64>,
    pub backoff_max_secs: Option<f64>,
    pub message_ttl_secs: Option<f64>,

    pub delivery_interval_secs: Option<u64>,
    pub batch_size: Option<usize>,
    pub max_image_size_kb: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    pub heartbeat_interval_secs: Option<u64>,

    pub health_check_interval_secs: Option<u64>,
    pub alert_cooldown_secs: Option<f64>,

    pub event_retention_days: Option<u64>,
    pub event_max_file_mb: Option<u64>,

    pub max_restart_attempts: Option<u32>,
    pub restart_delay_secs: Option<u64>,
}

impl Config {
    pub fn load() -> eyre::Result<Self> {
        Ok(envy::prefixed("OPTIC_").from_env::<Self>()?)
    }

    pub fn device_id(&self) -> &str {
        self.device_id.as_deref().unwrap_or(defaults::DEVICE_ID)
    }

    pub fn device_name(&self) -> &str {
        self.device_name.as_deref().unwrap_or(defaults::DEVICE_NAME)
    }

    pub fn environment(&self) -> &str {
        self.env.as_deref().unwrap_or("production")
    }

    pub fn debug(&self) -> bool {
        matches!(self.debug.as_deref(), Some("1") | Some("true"))
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(defaults::DATA_DIR))
    }

    pub fn broker_db_path(&self) -> PathBuf {
        self.data_dir().join("message_broker.db")
    }

    pub fn event_log_dir(&self) -> PathBuf {
        self.data_dir().join("event_logs")
    }

    pub fn location_cache_path(&self) -> PathBuf {
        self.data_dir().join("location_cache.json")
    }

    pub fn location_name(&self) -> &str {
        self.location_name
            .as_deref()
            .unwrap_or(defaults::LOCATION_NAME)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(
            self.request_timeout_secs
                .unwrap_or(defaults::REQUEST_TIMEOUT_SECS),
        )
    }

    pub fn max_restart_attempts(&self) -> u32 {
        self.max_restart_attempts
            .unwrap_or(defaults::MAX_RESTART_ATTEMPTS)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay_secs.unwrap_or(defaults::RESTART_DELAY_SECS))
    }

    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            db_path: self.broker_db_path(),
            max_queue_size: self.max_queue_size.unwrap_or(defaults::MAX_QUEUE_SIZE),
            max_in_flight: self.max_in_flight.unwrap_or(defaults::MAX_IN_FLIGHT),
            visibility_timeout: self
                .visibility_timeout_secs
                .unwrap_or(defaults::VISIBILITY_TIMEOUT_SECS),
            enable_dedup: !self.disable_dedup.unwrap_or(false),
            dedup_window: self
                .dedup_window_secs
                .unwrap_or(defaults::DEDUP_WINDOW_SECS),
            max_attempts: self.max_attempts.unwrap_or(defaults::MAX_ATTEMPTS),
            backoff_base: self
                .backoff_base_secs
                .unwrap_or(defaults::BACKOFF_BASE_SECS),
            backoff_max: self.backoff_max_secs.unwrap_or(defaults::BACKOFF_MAX_SECS),
            default_ttl: self.message_ttl_secs.unwrap_or(defaults::MESSAGE_TTL_SECS),
        }
    }

    pub fn delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig {
            delivery_interval: Duration::from_secs(
                self.delivery_interval_secs
                    .unwrap_or(defaults::DELIVERY_INTERVAL_SECS),
            ),
            batch_size: self.batch_size.unwrap_or(defaults::BATCH_SIZE),
            max_image_size_kb: self
                .max_image_size_kb
                .unwrap_or(defaults::MAX_IMAGE_SIZE_KB),
            cleanup_interval: Duration::from_secs(defaults::CLEANUP_INTERVAL_SECS),
            heartbeat_interval: Duration::from_secs(
                self.heartbeat_interval_secs
                    .unwrap_or(defaults::HEARTBEAT_INTERVAL_SECS),
            ),
            ack_log_retention_days: defaults::ACK_LOG_RETENTION_DAYS,
        }
    }

    pub fn health_config(&self) -> HealthConfig {
        HealthConfig {
            check_interval: Duration::from_secs(
                self.health_check_interval_secs
                    .unwrap_or(defaults::HEALTH_CHECK_INTERVAL_SECS),
            ),
            alert_cooldown: self
                .alert_cooldown_secs
                .unwrap_or(defaults::ALERT_COOLDOWN_SECS),
            max_alerts: 100,
        }
    }
}
