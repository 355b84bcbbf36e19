//! Guaranteed-delivery message broker.
//!
//! SQLite-backed persistent queue with acknowledgment-based delivery, a
//! dead-letter table for exhausted messages, checksum deduplication, priority
//! ordering, TTL expiry, and a circuit breaker gating consumption. The broker
//! exclusively owns the durable tables; other components only see this API.
//!
//! Consumed messages carry a one-time ack token. Acknowledging with the token
//! deletes the row; negative acknowledgment reschedules with exponential
//! backoff or dead-letters once attempts are exhausted. In-flight rows whose
//! worker died are reclaimed on startup by the visibility-timeout pass.

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use rand::Rng;
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::circuit::{CircuitBreaker, CircuitStats};
use crate::clock::Clock;
use crate::error::Error;
use crate::message::{
    payload_checksum, DeadLetterMessage, DeadLetterRow, Message, MessagePriority, MessageRow,
};

const DEDUP_CACHE_CAPACITY: usize = 10_000;
const EVICTION_BATCH: i64 = 100;

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub db_path: PathBuf,
    pub max_queue_size: i64,
    pub max_in_flight: i64,
    pub visibility_timeout: f64,
    pub enable_dedup: bool,
    pub dedup_window: f64,
    pub max_attempts: i64,
    pub backoff_base: f64,
    pub backoff_max: f64,
    pub default_ttl: f64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/message_broker.db"),
            max_queue_size: 50_000,
            max_in_flight: 100,
            visibility_timeout: 300.0,
            enable_dedup: true,
            dedup_window: 300.0,
            max_attempts: 10,
            backoff_base: 30.0,
            backoff_max: 3600.0,
            default_ttl: 86_400.0 * 7.0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub priority: MessagePriority,
    pub delay: f64,
    pub ttl: Option<f64>,
    pub metadata: Option<Value>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    acknowledged: AtomicU64,
    failed: AtomicU64,
    dead_lettered: AtomicU64,
    duplicates_rejected: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BrokerStats {
    pub enqueued: u64,
    pub acknowledged: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    pub duplicates_rejected: u64,
    pub queue_pending: i64,
    pub queue_in_flight: i64,
    pub dead_letter_queue: i64,
    pub circuit_breaker: CircuitStats,
}

/// Recently published checksums, guarded by the broker mutex together with
/// every store mutation so concurrent publishers serialize.
struct DedupIndex {
    recent: LruCache<String, f64>,
}

pub struct MessageBroker {
    pool: SqlitePool,
    config: BrokerConfig,
    clock: Arc<dyn Clock>,
    breaker: CircuitBreaker,
    dedup: Mutex<DedupIndex>,
    counters: Counters,
}

impl MessageBroker {
    pub async fn connect(config: BrokerConfig, clock: Arc<dyn Clock>) -> Result<Self, Error> {
        if let Some(parent) = config.db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::io(parent.display().to_string(), e))?;
        }

        let opts = SqliteConnectOptions::new()
            .filename(&config.db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new().connect_with(opts).await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        let broker = Self {
            pool,
            breaker: CircuitBreaker::new(Arc::clone(&clock)),
            dedup: Mutex::new(DedupIndex {
                recent: LruCache::new(
                    NonZeroUsize::new(DEDUP_CACHE_CAPACITY).expect("nonzero capacity"),
                ),
            }),
            counters: Counters::default(),
            config,
            clock,
        };

        broker.recover_in_flight().await?;

        tracing::info!(path = %broker.config.db_path.display(), "message broker initialized");
        Ok(broker)
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Reverts in-flight rows whose `updated_at` is older than the visibility
    /// timeout. Fresher rows stay in-flight for the next pass.
    async fn recover_in_flight(&self) -> Result<(), Error> {
        let now = self.clock.now();
        let cutoff = now - self.config.visibility_timeout;

        let result = sqlx::query(
            "
            UPDATE messages
            SET status = 'pending', updated_at = $1
            WHERE status = 'in_flight' AND updated_at < $2
            ",
        )
        .bind(now)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            tracing::info!(count = result.rows_affected(), "recovered in-flight messages");
        }
        Ok(())
    }

    /// Publishes a message. Returns `Ok(None)` when the payload was rejected
    /// as a duplicate within the dedup window; store failures surface as
    /// errors and leave nothing enqueued.
    pub async fn publish(
        &self,
        topic: &str,
        payload: &Value,
        opts: PublishOptions,
    ) -> Result<Option<String>, Error> {
        let now = self.clock.now();
        let checksum = payload_checksum(payload)?;

        let mut dedup = self.dedup.lock().await;

        if self.config.enable_dedup {
            if let Some(&seen_at) = dedup.recent.peek(&checksum) {
                if now - seen_at < self.config.dedup_window {
                    self.counters.duplicates_rejected.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(%checksum, "duplicate message rejected");
                    return Ok(None);
                }
                dedup.recent.pop(&checksum);
            }
        }

        let id = opts
            .idempotency_key
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let metadata = opts.metadata.unwrap_or_else(|| json!({}));

        let mut tx = self.pool.begin().await?;

        let live: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages WHERE status IN ('pending', 'in_flight')",
        )
        .fetch_one(&mut *tx)
        .await?;

        if live >= self.config.max_queue_size {
            self.evict_oldest(&mut tx).await?;
        }

        sqlx::query(
            "
            INSERT OR REPLACE INTO messages
                (id, topic, payload, priority, status, attempts, max_attempts,
                 created_at, updated_at, scheduled_at, expires_at, checksum, metadata)
            VALUES ($1, $2, $3, $4, 'pending', 0, $5, $6, $6, $7, $8, $9, $10)
            ",
        )
        .bind(&id)
        .bind(topic)
        .bind(serde_json::to_string(payload)?)
        .bind(opts.priority.value())
        .bind(self.config.max_attempts)
        .bind(now)
        .bind(now + opts.delay)
        .bind(now + opts.ttl.unwrap_or(self.config.default_ttl))
        .bind(&checksum)
        .bind(serde_json::to_string(&metadata)?)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        dedup.recent.put(checksum, now);
        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(%id, topic, "published message");
        Ok(Some(id))
    }

    /// Evicts the oldest pending rows of priority <= normal to make room.
    async fn evict_oldest(&self, tx: &mut Transaction<'_, Sqlite>) -> Result<(), Error> {
        sqlx::query(
            "
            DELETE FROM messages
            WHERE id IN (
                SELECT id FROM messages
                WHERE status = 'pending' AND priority <= $1
                ORDER BY created_at ASC
                LIMIT $2
            )
            ",
        )
        .bind(MessagePriority::Normal.value())
        .bind(EVICTION_BATCH)
        .execute(&mut **tx)
        .await?;

        tracing::warn!("queue full, evicted oldest low-priority messages");
        Ok(())
    }

    /// Moves up to `batch_size` visible pending messages of `topic` to
    /// in-flight and returns them with fresh ack tokens. Empty while the
    /// circuit breaker is open or the in-flight cap is reached.
    pub async fn consume(&self, topic: &str, batch_size: usize) -> Result<Vec<Message>, Error> {
        if !self.breaker.is_available() {
            tracing::debug!("circuit breaker open, skipping consume");
            return Ok(Vec::new());
        }

        let now = self.clock.now();
        let _guard = self.dedup.lock().await;
        let mut tx = self.pool.begin().await?;

        let in_flight: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE status = 'in_flight'")
                .fetch_one(&mut *tx)
                .await?;

        let headroom = self.config.max_in_flight - in_flight;
        if headroom <= 0 {
            return Ok(Vec::new());
        }
        let limit = (batch_size as i64).min(headroom);

        let rows: Vec<MessageRow> = sqlx::query_as(
            "
            SELECT * FROM messages
            WHERE topic = $1
              AND status = 'pending'
              AND scheduled_at <= $2
              AND (expires_at IS NULL OR expires_at > $2)
            ORDER BY priority DESC, scheduled_at ASC, created_at ASC, id ASC
            LIMIT $3
            ",
        )
        .bind(topic)
        .bind(now)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            let ack_token = Uuid::new_v4().to_string();

            sqlx::query(
                "
                UPDATE messages
                SET status = 'in_flight', ack_token = $1, updated_at = $2
                WHERE id = $3
                ",
            )
            .bind(&ack_token)
            .bind(now)
            .bind(&row.id)
            .execute(&mut *tx)
            .await?;

            let mut message = Message::try_from(row)?;
            message.status = crate::message::MessageStatus::InFlight;
            message.ack_token = Some(ack_token);
            message.updated_at = now;
            messages.push(message);
        }

        tx.commit().await?;
        Ok(messages)
    }

    /// Acknowledges successful processing. A missing row or a token mismatch
    /// is a no-op returning `false`; duplicate acks fall into the same arm
    /// because the first one deleted the row.
    pub async fn ack(
        &self,
        message_id: &str,
        ack_token: &str,
        response: Option<&Value>,
    ) -> Result<bool, Error> {
        let now = self.clock.now();
        let _guard = self.dedup.lock().await;
        let mut tx = self.pool.begin().await?;

        let stored: Option<Option<String>> = sqlx::query_scalar(
            "SELECT ack_token FROM messages WHERE id = $1 AND status = 'in_flight'",
        )
        .bind(message_id)
        .fetch_optional(&mut *tx)
        .await?;

        if stored.flatten().as_deref() != Some(ack_token) {
            tracing::warn!(message_id, "invalid ack token");
            return Ok(false);
        }

        sqlx::query("DELETE FROM messages WHERE id = $1")
            .bind(message_id)
            .execute(&mut *tx)
            .await?;

        let response_text = match response {
            Some(value) => serde_json::to_string(value)?,
            None => "{}".to_string(),
        };
        sqlx::query(
            "
            INSERT INTO ack_log (message_id, ack_token, status, response, timestamp)
            VALUES ($1, $2, 'acknowledged', $3, $4)
            ",
        )
        .bind(message_id)
        .bind(ack_token)
        .bind(response_text)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        self.counters.acknowledged.fetch_add(1, Ordering::Relaxed);
        self.breaker.record_success();
        tracing::debug!(message_id, "message acknowledged");
        Ok(true)
    }

    /// Negative acknowledgment. Reschedules with exponential backoff, or on
    /// `retry = false` / attempts exhaustion moves the row to the dead-letter
    /// table. Returns `false` on a missing row or token mismatch.
    pub async fn nack(
        &self,
        message_id: &str,
        ack_token: &str,
        error: &str,
        retry: bool,
    ) -> Result<bool, Error> {
        let now = self.clock.now();
        let _guard = self.dedup.lock().await;
        let mut tx = self.pool.begin().await?;

        let row: Option<MessageRow> =
            sqlx::query_as("SELECT * FROM messages WHERE id = $1 AND status = 'in_flight'")
                .bind(message_id)
                .fetch_optional(&mut *tx)
                .await?;

        let Some(row) = row else {
            return Ok(false);
        };
        if row.ack_token.as_deref() != Some(ack_token) {
            return Ok(false);
        }

        let attempts = row.attempts + 1;

        if !retry || attempts >= row.max_attempts {
            self.move_to_dead_letter(&mut tx, &row, attempts, error, now)
                .await?;
            self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
        } else {
            let backoff = self.backoff_for(attempts);
            sqlx::query(
                "
                UPDATE messages
                SET status = 'pending',
                    attempts = $1,
                    scheduled_at = $2,
                    last_error = $3,
                    updated_at = $4,
                    ack_token = NULL
                WHERE id = $5
                ",
            )
            .bind(attempts)
            .bind(now + backoff)
            .bind(error)
            .bind(now)
            .bind(message_id)
            .execute(&mut *tx)
            .await?;

            tracing::debug!(message_id, backoff_secs = backoff, "message scheduled for retry");
        }

        sqlx::query(
            "
            INSERT INTO ack_log (message_id, ack_token, status, response, timestamp)
            VALUES ($1, $2, 'nack', $3, $4)
            ",
        )
        .bind(message_id)
        .bind(ack_token)
        .bind(error)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        self.breaker.record_failure(error);
        Ok(true)
    }

    /// Nominal retry delay for the given attempt count. The actual scheduled
    /// delay adds up to 10% jitter on top.
    pub fn retry_backoff(&self, attempts: i64) -> f64 {
        let exponent = (attempts - 1).clamp(0, 20) as i32;
        (self.config.backoff_base * 2f64.powi(exponent)).min(self.config.backoff_max)
    }

    fn backoff_for(&self, attempts: i64) -> f64 {
        let backoff = self.retry_backoff(attempts);
        let jitter = if backoff > 0.0 {
            rand::thread_rng().gen_range(0.0..backoff * 0.1)
        } else {
            0.0
        };
        backoff + jitter
    }

    async fn move_to_dead_letter(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        row: &MessageRow,
        attempts: i64,
        error: &str,
        now: f64,
    ) -> Result<(), Error> {
        let dlq_id = format!("dlq_{}_{}", row.id, now as i64);

        sqlx::query(
            "
            INSERT INTO dead_letter_queue
                (id, original_id, topic, payload, attempts, last_error,
                 created_at, dead_lettered_at, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ",
        )
        .bind(&dlq_id)
        .bind(&row.id)
        .bind(&row.topic)
        .bind(&row.payload)
        .bind(attempts)
        .bind(error)
        .bind(row.created_at)
        .bind(now)
        .bind(&row.metadata)
        .execute(&mut **tx)
        .await?;

        sqlx::query("DELETE FROM messages WHERE id = $1")
            .bind(&row.id)
            .execute(&mut **tx)
            .await?;

        tracing::warn!(
            message_id = %row.id,
            attempts,
            "message moved to dead-letter queue"
        );
        Ok(())
    }

    pub async fn dead_letter_messages(
        &self,
        topic: Option<&str>,
        limit: i64,
    ) -> Result<Vec<DeadLetterMessage>, Error> {
        let rows: Vec<DeadLetterRow> = match topic {
            Some(topic) => {
                sqlx::query_as(
                    "
                    SELECT * FROM dead_letter_queue
                    WHERE topic = $1
                    ORDER BY dead_lettered_at DESC
                    LIMIT $2
                    ",
                )
                .bind(topic)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    "SELECT * FROM dead_letter_queue ORDER BY dead_lettered_at DESC LIMIT $1",
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(DeadLetterMessage::try_from).collect()
    }

    /// Replays a dead-letter row back onto the live queue under a fresh id.
    /// The dead-letter row is removed only once the republish succeeded; a
    /// dedup rejection leaves it in place.
    pub async fn replay_dead_letter(&self, dlq_id: &str) -> Result<Option<String>, Error> {
        let row: Option<DeadLetterRow> =
            sqlx::query_as("SELECT * FROM dead_letter_queue WHERE id = $1")
                .bind(dlq_id)
                .fetch_optional(&self.pool)
                .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let payload: Value = serde_json::from_str(&row.payload)?;
        let mut metadata: Value = serde_json::from_str(&row.metadata)?;
        if let Some(map) = metadata.as_object_mut() {
            map.insert("replayed_from".into(), json!(dlq_id));
            map.insert("original_id".into(), json!(row.original_id));
        }

        let new_id = self
            .publish(
                &row.topic,
                &payload,
                PublishOptions {
                    metadata: Some(metadata),
                    ..PublishOptions::default()
                },
            )
            .await?;

        if let Some(new_id) = &new_id {
            sqlx::query("DELETE FROM dead_letter_queue WHERE id = $1")
                .bind(dlq_id)
                .execute(&self.pool)
                .await?;
            tracing::info!(dlq_id, %new_id, "replayed dead-letter message");
        }

        Ok(new_id)
    }

    /// Deletes messages whose TTL elapsed. Expired rows are dropped without
    /// delivery, which is one of the sanctioned silent-drop paths.
    pub async fn cleanup_expired(&self) -> Result<u64, Error> {
        let now = self.clock.now();
        let result =
            sqlx::query("DELETE FROM messages WHERE expires_at IS NOT NULL AND expires_at < $1")
                .bind(now)
                .execute(&self.pool)
                .await?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            tracing::info!(deleted, "cleaned up expired messages");
        }
        Ok(deleted)
    }

    /// Trims the ack-log audit trail to the retention window.
    pub async fn cleanup_ack_logs(&self, days: i64) -> Result<u64, Error> {
        let cutoff = self.clock.now() - (days as f64) * 86_400.0;
        let result = sqlx::query("DELETE FROM ack_log WHERE timestamp < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn ack_log_count(&self, message_id: &str) -> Result<i64, Error> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM ack_log WHERE message_id = $1")
                .bind(message_id)
                .fetch_one(&self.pool)
                .await?,
        )
    }

    pub async fn stats(&self) -> Result<BrokerStats, Error> {
        let queue_pending: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await?;
        let queue_in_flight: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE status = 'in_flight'")
                .fetch_one(&self.pool)
                .await?;
        let dead_letter_queue: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dead_letter_queue")
            .fetch_one(&self.pool)
            .await?;

        Ok(BrokerStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            acknowledged: self.counters.acknowledged.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dead_lettered: self.counters.dead_lettered.load(Ordering::Relaxed),
            duplicates_rejected: self.counters.duplicates_rejected.load(Ordering::Relaxed),
            queue_pending,
            queue_in_flight,
            dead_letter_queue,
            circuit_breaker: self.breaker.stats(),
        })
    }
}
