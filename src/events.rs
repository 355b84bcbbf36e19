//! Structured event log.
//!
//! Line-delimited JSON under `data/event_logs/`, one file per day
//! (`events_YYYY-MM-DD.jsonl`) rolling to a `_N` suffix past the size cap.
//! Write failures are logged and swallowed so the audit trail can never stall
//! the delivery pipeline.

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex;

use serde::Serialize;
use serde_json::Value;

use crate::clock::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Detection,
    UploadStarted,
    UploadSuccess,
    UploadFailed,
    UploadRetry,
    SystemError,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub event_id: String,
    pub event_type: EventKind,
    pub timestamp: f64,
    pub device_id: String,
    pub camera_id: Option<String>,
    pub class_name: Option<String>,
    pub confidence: Option<f64>,
    pub bbox: Option<Vec<i64>>,
    pub image_path: Option<String>,
    pub location: Option<Value>,
    pub metadata: Value,
}

struct LogState {
    date: String,
    file: PathBuf,
}

pub struct EventLogger {
    dir: PathBuf,
    device_id: String,
    retention_days: u64,
    max_file_bytes: u64,
    clock: Arc<dyn Clock>,
    state: Mutex<Option<LogState>>,
    written: AtomicU64,
}

impl EventLogger {
    pub fn new(
        dir: impl Into<PathBuf>,
        device_id: impl Into<String>,
        retention_days: u64,
        max_file_mb: u64,
        clock: Arc<dyn Clock>,
    ) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            device_id: device_id.into(),
            retention_days,
            max_file_bytes: max_file_mb * 1024 * 1024,
            clock,
            state: Mutex::new(None),
            written: AtomicU64::new(0),
        })
    }

    fn record(&self, event_id: String, kind: EventKind, metadata: Value) -> EventRecord {
        EventRecord {
            event_id,
            event_type: kind,
            timestamp: self.clock.now(),
            device_id: self.device_id.clone(),
            camera_id: None,
            class_name: None,
            confidence: None,
            bbox: None,
            image_path: None,
            location: None,
            metadata,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn log_detection(
        &self,
        event_id: &str,
        class_name: &str,
        confidence: f64,
        bbox: &[i64],
        camera_id: &str,
        image_path: Option<&str>,
        location: Option<Value>,
        metadata: Value,
    ) {
        let mut record = self.record(event_id.to_string(), EventKind::Detection, metadata);
        record.camera_id = Some(camera_id.to_string());
        record.class_name = Some(class_name.to_string());
        record.confidence = Some(confidence);
        record.bbox = Some(bbox.to_vec());
        record.image_path = image_path.map(str::to_string);
        record.location = location;
        self.write(&record);
    }

    pub fn log_upload_started(&self, event_id: &str, attempt: i64) {
        let record = self.record(
            event_id.to_string(),
            EventKind::UploadStarted,
            serde_json::json!({ "attempt": attempt }),
        );
        self.write(&record);
    }

    pub fn log_upload_success(&self, event_id: &str, response: Option<Value>) {
        let metadata = match response {
            Some(response) => serde_json::json!({ "response": response }),
            None => serde_json::json!({}),
        };
        let record = self.record(event_id.to_string(), EventKind::UploadSuccess, metadata);
        self.write(&record);
    }

    pub fn log_upload_failed(&self, event_id: &str, error: &str, attempt: i64) {
        let record = self.record(
            event_id.to_string(),
            EventKind::UploadFailed,
            serde_json::json!({ "error": error, "attempt": attempt }),
        );
        self.write(&record);
    }

    pub fn log_upload_retry(&self, event_id: &str, attempt: i64, next_retry_seconds: f64) {
        let record = self.record(
            event_id.to_string(),
            EventKind::UploadRetry,
            serde_json::json!({
                "attempt": attempt,
                "next_retry_seconds": next_retry_seconds,
            }),
        );
        self.write(&record);
    }

    pub fn log_system_error(&self, component: &str, error: &str) {
        let event_id = format!("error_{}", (self.clock.now() * 1000.0) as i64);
        let record = self.record(
            event_id,
            EventKind::SystemError,
            serde_json::json!({ "component": component, "error": error }),
        );
        self.write(&record);
    }

    fn write(&self, record: &EventRecord) {
        let line = match serde_json::to_string(record) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize event record");
                return;
            }
        };

        let mut state = self.state.lock().expect("event log lock");
        let file = self.current_file(&mut state);

        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&file)
            .and_then(|mut f| writeln!(f, "{line}"));

        match result {
            Ok(()) => {
                self.written.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => tracing::error!(path = %file.display(), error = %e, "failed to write event log"),
        }
    }

    /// Calendar date (UTC) for the injected clock's epoch seconds.
    fn date_for(&self, now: f64) -> String {
        chrono::DateTime::from_timestamp(now as i64, 0)
            .map(|dt| dt.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| "1970-01-01".to_string())
    }

    fn current_file(&self, state: &mut Option<LogState>) -> PathBuf {
        let today = self.date_for(self.clock.now());

        let stale = !matches!(state, Some(s) if s.date == today);
        if stale {
            *state = Some(LogState {
                date: today.clone(),
                file: self.dir.join(format!("events_{today}.jsonl")),
            });
        }

        let current = state.as_mut().expect("state set above");
        if let Ok(meta) = std::fs::metadata(&current.file) {
            if meta.len() >= self.max_file_bytes {
                let mut n = 1;
                loop {
                    let rotated = self.dir.join(format!("events_{today}_{n}.jsonl"));
                    if !rotated.exists() {
                        current.file = rotated;
                        break;
                    }
                    n += 1;
                }
            }
        }

        current.file.clone()
    }

    /// Deletes event-log files older than the retention window, by mtime
    /// measured against the injected clock.
    pub fn cleanup_old_logs(&self) -> usize {
        let cutoff = self.clock.now() - self.retention_days as f64 * 86_400.0;

        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return 0;
        };

        let mut deleted = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with("events_") || !name.ends_with(".jsonl") {
                continue;
            }
            let old = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|mtime| mtime.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|age| age.as_secs_f64() < cutoff)
                .unwrap_or(false);
            if old && std::fs::remove_file(entry.path()).is_ok() {
                deleted += 1;
            }
        }

        if deleted > 0 {
            tracing::info!(deleted, "cleaned up old event log files");
        }
        deleted
    }

    pub fn events_written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn logger(dir: &std::path::Path, max_file_mb: u64) -> EventLogger {
        EventLogger::new(
            dir,
            "dev-1",
            30,
            max_file_mb,
            Arc::new(ManualClock::new(1_700_000_000.0)),
        )
        .unwrap()
    }

    #[test]
    fn writes_one_json_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let logger = logger(dir.path(), 50);

        logger.log_detection(
            "det-1",
            "deer",
            0.91,
            &[10, 20, 110, 220],
            "cam-0",
            None,
            None,
            serde_json::json!({}),
        );
        logger.log_upload_success("det-1", None);

        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().flatten().collect();
        assert_eq!(files.len(), 1);

        let content = std::fs::read_to_string(files[0].path()).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event_type"], "detection");
        assert_eq!(first["class_name"], "deer");
        assert_eq!(first["device_id"], "dev-1");

        let second: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["event_type"], "upload_success");
        assert_eq!(logger.events_written(), 2);
    }

    #[test]
    fn rolls_to_a_new_file_on_day_change() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(1_700_000_000.0));
        let logger =
            EventLogger::new(dir.path(), "dev-1", 30, 50, Arc::clone(&clock) as Arc<dyn crate::clock::Clock>)
                .unwrap();

        logger.log_upload_started("det-1", 1);
        clock.advance(86_400.0);
        logger.log_upload_started("det-2", 1);

        let mut names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names.len(), 2);
        assert_ne!(names[0], names[1]);
        assert!(names.iter().all(|n| n.starts_with("events_") && n.ends_with(".jsonl")));
    }

    #[test]
    fn retention_sweep_follows_the_injected_clock() {
        let dir = tempfile::tempdir().unwrap();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs_f64();
        let clock = Arc::new(ManualClock::new(now));
        let logger =
            EventLogger::new(dir.path(), "dev-1", 30, 50, Arc::clone(&clock) as Arc<dyn crate::clock::Clock>)
                .unwrap();

        logger.log_upload_started("det-1", 1);
        assert_eq!(logger.cleanup_old_logs(), 0);

        // A month later the file's real mtime falls outside the window.
        clock.advance(31.0 * 86_400.0);
        assert_eq!(logger.cleanup_old_logs(), 1);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn rotates_past_size_cap() {
        let dir = tempfile::tempdir().unwrap();
        // 0 MB cap forces a rotation on every write after the first file exists.
        let logger = logger(dir.path(), 0);

        logger.log_upload_failed("det-1", "HTTP 503", 1);
        logger.log_upload_failed("det-2", "HTTP 503", 1);

        let mut names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names.len(), 2);
        assert!(names[1].contains("_1.jsonl"), "expected rotated file, got {names:?}");
    }
}
