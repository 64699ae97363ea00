//! Data Access Layer
//!
//! PostgreSQL implementation of the core's `CallStore`. Queries are built at
//! runtime so the crate compiles without a live database.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use callbridge_core::{
    events::IntentEvent,
    store::{CallRecord, CallSessionUpdate, CallStore, NewAgentInteraction, NewCallSession},
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use tracing::warn;
use uuid::Uuid;

#[derive(FromRow)]
struct CallSessionRow {
    id: Uuid,
    call_sid: String,
    caller_number: Option<String>,
    status: String,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    duration: Option<i32>,
    transcript: Option<String>,
    metadata: Option<Value>,
}

impl TryFrom<CallSessionRow> for CallRecord {
    type Error = anyhow::Error;

    fn try_from(row: CallSessionRow) -> Result<Self> {
        Ok(CallRecord {
            id: row.id,
            call_sid: row.call_sid,
            caller_number: row.caller_number,
            status: row.status.parse()?,
            start_time: row.start_time,
            end_time: row.end_time,
            duration_secs: row.duration.map(i64::from),
            transcript: row.transcript,
            metadata: row.metadata.unwrap_or(Value::Null),
        })
    }
}

/// The `duration` column is an `INTEGER`. Durations that do not fit are
/// left unset rather than wrapped.
fn duration_column(secs: Option<i64>) -> Option<i32> {
    secs.and_then(|secs| match i32::try_from(secs) {
        Ok(secs) => Some(secs),
        Err(_) => {
            warn!(secs, "call duration out of range; not storing it");
            None
        }
    })
}

/// A wrapper around the `PgPool` to provide a clear data access interface.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Creates a new `Db` instance.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Runs all pending `sqlx` migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl CallStore for Db {
    async fn create_call_session(&self, record: NewCallSession) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO call_sessions (id, call_sid, caller_number, status, start_time, metadata)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(record.id)
        .bind(&record.call_sid)
        .bind(&record.caller_number)
        .bind(record.status.as_str())
        .bind(record.start_time)
        .bind(&record.metadata)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Applies the fields present in `update`. A transcript fragment is
    /// appended to the stored transcript on its own line.
    async fn update_call_session(&self, id: Uuid, update: CallSessionUpdate) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE call_sessions
            SET transcript = CASE
                    WHEN $2::text IS NULL THEN transcript
                    WHEN transcript IS NULL THEN $2
                    ELSE transcript || E'\n' || $2
                END,
                status = COALESCE($3, status),
                end_time = COALESCE($4, end_time),
                duration = COALESCE($5, duration)
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&update.transcript)
        .bind(update.status.map(|s| s.as_str()))
        .bind(update.end_time)
        .bind(duration_column(update.duration_secs))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(anyhow!("call session {} not found", id));
        }
        Ok(())
    }

    async fn create_intent_event(&self, event: IntentEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO intent_events (id, call_session_id, intent, confidence, extracted_data, timestamp)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(event.call_session_id)
        .bind(&event.intent)
        .bind(i32::from(event.confidence))
        .bind(Value::Object(event.extracted_data))
        .bind(event.detected_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_agent_interaction(&self, interaction: NewAgentInteraction) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO agent_interactions (id, call_session_id, type, content, timestamp)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(interaction.call_session_id)
        .bind(interaction.kind.as_str())
        .bind(&interaction.content)
        .bind(interaction.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_call_sessions(&self) -> Result<Vec<CallRecord>> {
        let rows = sqlx::query_as::<_, CallSessionRow>(
            r#"
            SELECT id, call_sid, caller_number, status, start_time, end_time, duration, transcript, metadata
            FROM call_sessions
            ORDER BY start_time DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(CallRecord::try_from).collect()
    }
}
