//! Health monitoring, alerting, and self-healing.
//!
//! A periodic loop runs registered component checks and samples system
//! resources (CPU from `/proc/stat` deltas, memory from `/proc/meminfo`, disk
//! through `fs2`, temperature from `/sys/class/thermal`). Unhealthy results
//! raise rate-limited alerts into a bounded ring buffer and out to registered
//! callbacks; Critical results additionally invoke any registered recovery
//! action. Alert callbacks run on the monitor's task and must stay cheap.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::delivery::DeliveryMetrics;

const RECOVERY_HISTORY_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Critical,
}

impl HealthStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
            Self::Critical => "critical",
        }
    }

    const fn rank(self) -> u8 {
        match self {
            Self::Healthy => 0,
            Self::Degraded => 1,
            Self::Unhealthy => 2,
            Self::Critical => 3,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub component: String,
    pub status: HealthStatus,
    pub message: String,
    pub latency_ms: f64,
    pub timestamp: f64,
    pub metadata: Value,
}

impl HealthCheck {
    pub fn new(component: impl Into<String>, status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status,
            message: message.into(),
            latency_ms: 0.0,
            timestamp: 0.0,
            metadata: json!({}),
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertSeverity {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: String,
    pub severity: AlertSeverity,
    pub component: String,
    pub message: String,
    pub timestamp: f64,
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryAttempt {
    pub component: String,
    pub error: String,
    pub success: bool,
    pub timestamp: f64,
}

pub type CheckFn = Box<dyn Fn() -> HealthCheck + Send + Sync>;
pub type AlertCallback = Box<dyn Fn(&Alert) + Send + Sync>;
pub type RecoveryFn = Box<dyn Fn() -> bool + Send + Sync>;

/// Component-name -> recovery-action registry with a bounded attempt history.
pub struct SelfHealer {
    actions: Mutex<HashMap<String, RecoveryFn>>,
    history: Mutex<VecDeque<RecoveryAttempt>>,
}

impl SelfHealer {
    fn new() -> Self {
        Self {
            actions: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::with_capacity(RECOVERY_HISTORY_CAPACITY)),
        }
    }

    pub fn register(&self, component: impl Into<String>, action: RecoveryFn) {
        self.actions
            .lock()
            .expect("healer lock")
            .insert(component.into(), action);
    }

    pub fn attempt_recovery(&self, component: &str, error: &str, now: f64) -> bool {
        let actions = self.actions.lock().expect("healer lock");
        let Some(action) = actions.get(component) else {
            tracing::warn!(component, "no recovery action registered");
            return false;
        };

        tracing::info!(component, error, "attempting recovery");
        let success = action();

        let mut history = self.history.lock().expect("healer lock");
        if history.len() >= RECOVERY_HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(RecoveryAttempt {
            component: component.to_string(),
            error: error.to_string(),
            success,
            timestamp: now,
        });

        if success {
            tracing::info!(component, "recovery successful");
        } else {
            tracing::warn!(component, "recovery failed");
        }
        success
    }

    pub fn history(&self) -> Vec<RecoveryAttempt> {
        self.history.lock().expect("healer lock").iter().cloned().collect()
    }
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub check_interval: Duration,
    pub alert_cooldown: f64,
    pub max_alerts: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            alert_cooldown: 300.0,
            max_alerts: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub device_id: String,
    pub timestamp: f64,
    pub uptime_seconds: f64,
    pub overall_status: HealthStatus,
    pub components: HashMap<String, HealthCheck>,
    pub active_alerts: usize,
    pub gauges: HashMap<String, f64>,
    pub counters: HashMap<String, u64>,
    pub recovery_history: Vec<RecoveryAttempt>,
}

/// Consumed by the heartbeat loop; keeps the delivery side decoupled from the
/// monitor itself.
pub trait HealthReporter: Send + Sync + 'static {
    fn report(&self) -> HealthReport;
}

#[derive(Debug, Clone, Copy)]
struct CpuSample {
    active: u64,
    total: u64,
}

pub struct HealthMonitor {
    config: HealthConfig,
    clock: Arc<dyn Clock>,
    device_id: String,
    data_dir: PathBuf,
    start_time: f64,
    checks: Mutex<HashMap<String, CheckFn>>,
    component_status: Mutex<HashMap<String, HealthCheck>>,
    alerts: Mutex<VecDeque<Alert>>,
    alert_times: Mutex<HashMap<String, f64>>,
    callbacks: Mutex<Vec<AlertCallback>>,
    gauges: Mutex<HashMap<String, f64>>,
    counters: Mutex<HashMap<String, u64>>,
    cpu_prev: Mutex<Option<CpuSample>>,
    pub healer: SelfHealer,
}

impl HealthMonitor {
    pub fn new(
        config: HealthConfig,
        device_id: impl Into<String>,
        data_dir: impl Into<PathBuf>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let start_time = clock.now();
        Self {
            config,
            clock,
            device_id: device_id.into(),
            data_dir: data_dir.into(),
            start_time,
            checks: Mutex::new(HashMap::new()),
            component_status: Mutex::new(HashMap::new()),
            alerts: Mutex::new(VecDeque::new()),
            alert_times: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(Vec::new()),
            gauges: Mutex::new(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
            cpu_prev: Mutex::new(None),
            healer: SelfHealer::new(),
        }
    }

    pub fn register_check(&self, component: impl Into<String>, check: CheckFn) {
        self.checks
            .lock()
            .expect("health lock")
            .insert(component.into(), check);
    }

    pub fn register_alert_callback(&self, callback: AlertCallback) {
        self.callbacks.lock().expect("health lock").push(callback);
    }

    pub fn set_gauge(&self, name: impl Into<String>, value: f64) {
        self.gauges.lock().expect("health lock").insert(name.into(), value);
    }

    pub fn gauge(&self, name: &str) -> Option<f64> {
        self.gauges.lock().expect("health lock").get(name).copied()
    }

    fn increment_counter(&self, name: &str) {
        *self
            .counters
            .lock()
            .expect("health lock")
            .entry(name.to_string())
            .or_insert(0) += 1;
    }

    pub fn spawn(self: Arc<Self>, token: CancellationToken) -> tokio::task::JoinHandle<()> {
        let interval = self.config.check_interval;
        tokio::spawn(async move {
            tracing::info!("health monitor started");
            loop {
                self.tick();
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            tracing::info!("health monitor stopped");
        })
    }

    /// One monitoring pass: registered checks first, then system resources.
    pub fn tick(&self) {
        self.run_checks();
        self.sample_system_resources();
    }

    fn run_checks(&self) {
        let now = self.clock.now();
        let checks = self.checks.lock().expect("health lock");

        for (component, check) in checks.iter() {
            let started = std::time::Instant::now();
            let mut result = check();
            result.latency_ms = started.elapsed().as_secs_f64() * 1000.0;
            result.timestamp = now;

            let status = result.status;
            let message = result.message.clone();

            self.set_gauge(
                format!("health_check_{component}"),
                if status == HealthStatus::Healthy { 1.0 } else { 0.0 },
            );

            self.component_status
                .lock()
                .expect("health lock")
                .insert(component.clone(), result);

            if matches!(status, HealthStatus::Unhealthy | HealthStatus::Critical) {
                let severity = if status == HealthStatus::Critical {
                    AlertSeverity::Critical
                } else {
                    AlertSeverity::Error
                };
                self.create_alert(severity, component, &message, json!({}));

                if status == HealthStatus::Critical {
                    self.healer.attempt_recovery(component, &message, now);
                }
            }
        }
    }

    fn sample_system_resources(&self) {
        if let Some(cpu) = self.sample_cpu() {
            self.set_gauge("cpu_percent", cpu);
            if cpu > 90.0 {
                self.create_alert(
                    AlertSeverity::Warning,
                    "cpu",
                    &format!("High CPU usage: {cpu:.0}%"),
                    json!({}),
                );
            }
        }

        if let Some((percent, available_mb)) = sample_memory() {
            self.set_gauge("memory_percent", percent);
            self.set_gauge("memory_available_mb", available_mb);
            if percent > 90.0 {
                self.create_alert(
                    AlertSeverity::Warning,
                    "memory",
                    &format!("High memory usage: {percent:.0}%"),
                    json!({}),
                );
            }
        }

        if let Some((percent, free_gb)) = self.sample_disk() {
            self.set_gauge("disk_percent", percent);
            self.set_gauge("disk_free_gb", free_gb);
            if percent > 90.0 {
                self.create_alert(
                    AlertSeverity::Warning,
                    "storage",
                    &format!("Low disk space: {percent:.0}% used"),
                    json!({}),
                );
            }
        }

        if let Some(temp) = sample_temperature() {
            self.set_gauge("temperature_celsius", temp);
            if temp > 80.0 {
                self.create_alert(
                    AlertSeverity::Warning,
                    "temperature",
                    &format!("High temperature: {temp:.1}\u{b0}C"),
                    json!({}),
                );
            }
        }
    }

    /// CPU busy percentage from consecutive `/proc/stat` samples. The first
    /// call only seeds the baseline.
    fn sample_cpu(&self) -> Option<f64> {
        let stat = std::fs::read_to_string("/proc/stat").ok()?;
        let line = stat.lines().next()?;
        let fields: Vec<u64> = line
            .split_whitespace()
            .skip(1)
            .filter_map(|s| s.parse().ok())
            .collect();
        if fields.len() < 5 {
            return None;
        }

        let total: u64 = fields.iter().sum();
        let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
        let current = CpuSample {
            active: total - idle,
            total,
        };

        let mut prev = self.cpu_prev.lock().expect("health lock");
        let result = prev.and_then(|p| {
            let dt = current.total.checked_sub(p.total)?;
            if dt == 0 {
                return None;
            }
            let da = current.active.saturating_sub(p.active);
            Some(da as f64 / dt as f64 * 100.0)
        });
        *prev = Some(current);
        result
    }

    fn sample_disk(&self) -> Option<(f64, f64)> {
        let probe = if self.data_dir.exists() {
            self.data_dir.clone()
        } else {
            PathBuf::from(".")
        };
        let total = fs2::total_space(&probe).ok()? as f64;
        let available = fs2::available_space(&probe).ok()? as f64;
        if total <= 0.0 {
            return None;
        }
        let used_percent = (total - available) / total * 100.0;
        Some((used_percent, available / (1024.0 * 1024.0 * 1024.0)))
    }

    pub fn create_alert(
        &self,
        severity: AlertSeverity,
        component: &str,
        message: &str,
        metadata: Value,
    ) {
        let now = self.clock.now();
        let key = format!("{component}:{message}");

        {
            let mut times = self.alert_times.lock().expect("health lock");
            if let Some(&last) = times.get(&key) {
                if now - last < self.config.alert_cooldown {
                    return;
                }
            }
            times.insert(key, now);
        }

        let alert = Alert {
            id: format!("alert_{}_{}", self.device_id, (now * 1000.0) as i64),
            severity,
            component: component.to_string(),
            message: message.to_string(),
            timestamp: now,
            metadata,
        };

        {
            let mut alerts = self.alerts.lock().expect("health lock");
            if alerts.len() >= self.config.max_alerts {
                alerts.pop_front();
            }
            alerts.push_back(alert.clone());
        }

        let callbacks = self.callbacks.lock().expect("health lock");
        for callback in callbacks.iter() {
            callback(&alert);
        }

        tracing::warn!(
            severity = severity.as_str(),
            component,
            message,
            "alert raised"
        );
        self.increment_counter(&format!("alerts_{}", severity.as_str()));
    }

    pub fn overall_status(&self) -> HealthStatus {
        let status = self.component_status.lock().expect("health lock");
        status
            .values()
            .map(|c| c.status)
            .max_by_key(|s| s.rank())
            .unwrap_or(HealthStatus::Healthy)
    }

    pub fn component_status(&self, component: &str) -> Option<HealthCheck> {
        self.component_status
            .lock()
            .expect("health lock")
            .get(component)
            .cloned()
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        self.alerts.lock().expect("health lock").iter().cloned().collect()
    }
}

impl HealthReporter for HealthMonitor {
    fn report(&self) -> HealthReport {
        let now = self.clock.now();
        let components = self.component_status.lock().expect("health lock").clone();
        let recovery = self.healer.history();
        let tail = recovery.len().saturating_sub(10);

        HealthReport {
            device_id: self.device_id.clone(),
            timestamp: now,
            uptime_seconds: now - self.start_time,
            overall_status: self.overall_status(),
            components,
            active_alerts: self.alerts.lock().expect("health lock").len(),
            gauges: self.gauges.lock().expect("health lock").clone(),
            counters: self.counters.lock().expect("health lock").clone(),
            recovery_history: recovery[tail..].to_vec(),
        }
    }
}

fn sample_memory() -> Option<(f64, f64)> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    let mut total_kb = 0u64;
    let mut available_kb = 0u64;
    for line in meminfo.lines() {
        if line.starts_with("MemTotal:") {
            total_kb = parse_meminfo_value(line);
        } else if line.starts_with("MemAvailable:") {
            available_kb = parse_meminfo_value(line);
        }
    }
    if total_kb == 0 {
        return None;
    }
    let used = total_kb.saturating_sub(available_kb);
    Some((
        used as f64 / total_kb as f64 * 100.0,
        available_kb as f64 / 1024.0,
    ))
}

fn parse_meminfo_value(line: &str) -> u64 {
    line.split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

/// Hottest thermal zone in Celsius, if the platform exposes any.
fn sample_temperature() -> Option<f64> {
    let entries = std::fs::read_dir("/sys/class/thermal").ok()?;
    let mut hottest: Option<f64> = None;
    for entry in entries.flatten() {
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with("thermal_zone") {
            continue;
        }
        let raw = std::fs::read_to_string(entry.path().join("temp")).ok();
        if let Some(milli) = raw.and_then(|s| s.trim().parse::<f64>().ok()) {
            let celsius = milli / 1000.0;
            hottest = Some(hottest.map_or(celsius, |h: f64| h.max(celsius)));
        }
    }
    hottest
}

/// Health check over the delivery pipeline's metrics snapshot.
pub fn delivery_check(metrics: Arc<DeliveryMetrics>) -> CheckFn {
    Box::new(move || {
        let snapshot = metrics.snapshot();
        let metadata = serde_json::to_value(&snapshot).unwrap_or_else(|_| json!({}));

        if snapshot.consecutive_failures > 10 {
            return HealthCheck::new(
                "delivery",
                HealthStatus::Critical,
                format!(
                    "High consecutive failures: {}",
                    snapshot.consecutive_failures
                ),
            )
            .with_metadata(metadata);
        }

        if snapshot.total_attempts > 0 && snapshot.success_rate < 50.0 {
            return HealthCheck::new(
                "delivery",
                HealthStatus::Unhealthy,
                format!("Low success rate: {:.1}%", snapshot.success_rate),
            )
            .with_metadata(metadata);
        }

        if snapshot.total_attempts > 0 && snapshot.success_rate < 90.0 {
            return HealthCheck::new(
                "delivery",
                HealthStatus::Degraded,
                format!("Degraded success rate: {:.1}%", snapshot.success_rate),
            )
            .with_metadata(metadata);
        }

        if snapshot.queue_pending > 1000 {
            return HealthCheck::new(
                "delivery",
                HealthStatus::Degraded,
                format!("Large queue backlog: {} pending", snapshot.queue_pending),
            )
            .with_metadata(metadata);
        }

        HealthCheck::new(
            "delivery",
            HealthStatus::Healthy,
            format!("Delivery operational ({:.1}% success)", snapshot.success_rate),
        )
        .with_metadata(metadata)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn monitor(clock: Arc<ManualClock>) -> HealthMonitor {
        HealthMonitor::new(
            HealthConfig::default(),
            "dev-1",
            std::env::temp_dir(),
            clock as Arc<dyn Clock>,
        )
    }

    #[test]
    fn alert_cooldown_suppresses_repeats() {
        let clock = Arc::new(ManualClock::new(1_000.0));
        let monitor = monitor(Arc::clone(&clock));

        monitor.create_alert(AlertSeverity::Warning, "cpu", "High CPU usage", json!({}));
        monitor.create_alert(AlertSeverity::Warning, "cpu", "High CPU usage", json!({}));
        assert_eq!(monitor.active_alerts().len(), 1);

        clock.advance(301.0);
        monitor.create_alert(AlertSeverity::Warning, "cpu", "High CPU usage", json!({}));
        assert_eq!(monitor.active_alerts().len(), 2);
    }

    #[test]
    fn distinct_messages_alert_independently() {
        let clock = Arc::new(ManualClock::new(1_000.0));
        let monitor = monitor(clock);

        monitor.create_alert(AlertSeverity::Warning, "cpu", "High CPU usage: 95%", json!({}));
        monitor.create_alert(AlertSeverity::Warning, "memory", "High memory usage", json!({}));
        assert_eq!(monitor.active_alerts().len(), 2);
    }

    #[test]
    fn critical_check_triggers_recovery() {
        let clock = Arc::new(ManualClock::new(1_000.0));
        let monitor = monitor(clock);

        let recovered = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Arc::clone(&recovered);
        monitor.healer.register(
            "camera",
            Box::new(move || {
                flag.store(true, std::sync::atomic::Ordering::SeqCst);
                true
            }),
        );
        monitor.register_check(
            "camera",
            Box::new(|| HealthCheck::new("camera", HealthStatus::Critical, "Camera stalled")),
        );

        monitor.run_checks();

        assert!(recovered.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(monitor.overall_status(), HealthStatus::Critical);
        let history = monitor.healer.history();
        assert_eq!(history.len(), 1);
        assert!(history[0].success);
    }

    #[test]
    fn overall_status_is_worst_component() {
        let clock = Arc::new(ManualClock::new(1_000.0));
        let monitor = monitor(clock);

        monitor.register_check(
            "camera",
            Box::new(|| HealthCheck::new("camera", HealthStatus::Healthy, "ok")),
        );
        monitor.register_check(
            "detector",
            Box::new(|| HealthCheck::new("detector", HealthStatus::Degraded, "slow inference")),
        );
        monitor.run_checks();

        assert_eq!(monitor.overall_status(), HealthStatus::Degraded);
        assert_eq!(
            monitor.component_status("camera").unwrap().status,
            HealthStatus::Healthy
        );
    }

    #[test]
    fn delivery_check_thresholds() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(1_000.0));
        let metrics = Arc::new(DeliveryMetrics::new(clock));

        let check = delivery_check(Arc::clone(&metrics));
        assert_eq!(check().status, HealthStatus::Healthy);

        for _ in 0..11 {
            metrics.record_failure();
        }
        assert_eq!(check().status, HealthStatus::Critical);
    }
}
