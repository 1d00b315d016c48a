use chrono::{DateTime, Utc};
use parley_common::{Call, CallId, CallStatus, MessageId, SignalingMessage};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

/// Create the gateway tables if they do not exist yet.
pub async fn init_schema(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS calls (
            id TEXT PRIMARY KEY,
            caller_id TEXT NOT NULL,
            receiver_id TEXT NOT NULL,
            media_kind TEXT NOT NULL,
            status TEXT NOT NULL,
            started_at DATETIME,
            ended_at DATETIME,
            created_at DATETIME NOT NULL,
            updated_at DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS signal_log (
            id TEXT PRIMARY KEY,
            call_id TEXT NOT NULL,
            from_user_id TEXT NOT NULL,
            to_user_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            body TEXT NOT NULL,
            processed BOOLEAN NOT NULL DEFAULT 0,
            sent_at DATETIME NOT NULL,
            logged_at DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_signal_log_logged_at ON signal_log(logged_at)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_signal_log_call ON signal_log(call_id)")
        .execute(pool)
        .await?;
    Ok(())
}

#[derive(Debug, sqlx::FromRow)]
struct CallRow {
    id: String,
    caller_id: String,
    receiver_id: String,
    media_kind: String,
    status: String,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
}

impl CallRow {
    fn into_call(self) -> anyhow::Result<Call> {
        Ok(Call {
            id: self.id.parse()?,
            caller_id: self.caller_id,
            receiver_id: self.receiver_id,
            media_kind: self.media_kind.parse()?,
            status: self.status.parse()?,
            started_at: self.started_at,
            ended_at: self.ended_at,
        })
    }
}

#[derive(Debug, Serialize, Deserialize, sqlx::FromRow)]
pub struct SignalLogRow {
    pub id: String,
    pub call_id: String,
    pub from_user_id: String,
    pub to_user_id: String,
    pub kind: String,
    pub body: String,
    pub processed: bool,
    pub sent_at: DateTime<Utc>,
    pub logged_at: DateTime<Utc>,
}

// Call records

pub async fn insert_call(pool: &SqlitePool, call: &Call) -> anyhow::Result<()> {
    let now = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO calls (id, caller_id, receiver_id, media_kind, status, started_at, ended_at, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(call.id.to_string())
    .bind(&call.caller_id)
    .bind(&call.receiver_id)
    .bind(call.media_kind.as_str())
    .bind(call.status.as_str())
    .bind(call.started_at)
    .bind(call.ended_at)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_call(pool: &SqlitePool, id: CallId) -> anyhow::Result<Option<Call>> {
    let row = sqlx::query_as::<_, CallRow>(
        "SELECT id, caller_id, receiver_id, media_kind, status, started_at, ended_at FROM calls WHERE id = ?",
    )
    .bind(id.to_string())
    .fetch_optional(pool)
    .await?;
    row.map(CallRow::into_call).transpose()
}

/// Write `call`'s status and timestamps if the stored status is still
/// `expected`. Returns false when another writer got there first.
pub async fn update_call_status(
    pool: &SqlitePool,
    call: &Call,
    expected: CallStatus,
) -> anyhow::Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE calls SET status = ?, started_at = ?, ended_at = ?, updated_at = ?
        WHERE id = ? AND status = ?
        "#,
    )
    .bind(call.status.as_str())
    .bind(call.started_at)
    .bind(call.ended_at)
    .bind(Utc::now())
    .bind(call.id.to_string())
    .bind(expected.as_str())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn count_calls_with_status(pool: &SqlitePool, status: CallStatus) -> anyhow::Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM calls WHERE status = ?")
        .bind(status.as_str())
        .fetch_one(pool)
        .await?;
    Ok(count)
}

// Signaling log

pub async fn log_signal(pool: &SqlitePool, message: &SignalingMessage) -> anyhow::Result<()> {
    let body = serde_json::to_string(message)?;
    sqlx::query(
        r#"
        INSERT OR IGNORE INTO signal_log (id, call_id, from_user_id, to_user_id, kind, body, processed, sent_at, logged_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(message.id.to_string())
    .bind(message.call_id.to_string())
    .bind(&message.from_user_id)
    .bind(&message.to_user_id)
    .bind(message.kind().as_str())
    .bind(body)
    .bind(message.processed)
    .bind(message.sent_at)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_processed(pool: &SqlitePool, id: MessageId) -> anyhow::Result<()> {
    sqlx::query("UPDATE signal_log SET processed = 1 WHERE id = ?")
        .bind(id.to_string())
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn signals_for_call(pool: &SqlitePool, call_id: CallId) -> anyhow::Result<Vec<SignalLogRow>> {
    let rows = sqlx::query_as::<_, SignalLogRow>(
        "SELECT * FROM signal_log WHERE call_id = ? ORDER BY logged_at ASC",
    )
    .bind(call_id.to_string())
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Drop log entries logged before `cutoff`.
pub async fn purge_signals(pool: &SqlitePool, cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
    let result = sqlx::query("DELETE FROM signal_log WHERE logged_at < ?")
        .bind(cutoff)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
