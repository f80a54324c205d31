//! SQLite persistence for sessions, messages, metrics, and buffers
//!
//! Uses a small r2d2 connection pool; each public operation checks out one
//! connection, runs a single statement (or one grouped transaction), and
//! commits before returning. There is no multi-operation transaction across
//! tracker calls: the metrics/buffer caches may lag the message log by one
//! recompute, and concurrent writers race last-writer-wins on those rows.
//!
//! # Schema
//!
//! ```text
//! sessions(id PK, user_id, status, created_at, updated_at,
//!          active_risk_tier, metadata JSON)
//! messages(id PK AUTOINCREMENT, session_id FK, sender, content,
//!          sentiment_score, risk_tier, risk_score,
//!          flagged_keywords JSON, created_at)
//! session_metrics(session_id PK FK, ... aggregate columns, JSON counts)
//! buffers(session_id PK FK, serialized_buffer JSON, capacity)
//! ```

use crate::models::{
    utc_now, BufferSnapshot, MessageRecord, RiskTier, SenderRole, SessionMetrics, SessionRecord,
    SessionStatus,
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, params_from_iter, Row};
use std::path::Path;

/// SQLite-backed persistence layer for the session tracking engine.
pub struct SessionStorage {
    pool: Pool<SqliteConnectionManager>,
}

impl SessionStorage {
    /// Open (or create) the database at `db_path` and ensure the schema.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).context("Failed to create database directory")?;
            }
        }

        let manager = SqliteConnectionManager::file(db_path);
        let pool = Pool::builder().max_size(4).build(manager)?;
        let storage = Self { pool };
        storage.init_schema()?;
        Ok(storage)
    }

    /// In-memory database for tests. A single pooled connection keeps every
    /// operation on the same `:memory:` instance.
    pub fn in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder().max_size(1).build(manager)?;
        let storage = Self { pool };
        storage.init_schema()?;
        Ok(storage)
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA busy_timeout=5000;

            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                active_risk_tier TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}'
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);
            CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);

            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                sender TEXT NOT NULL,
                content TEXT NOT NULL,
                sentiment_score REAL NOT NULL,
                risk_tier TEXT NOT NULL,
                risk_score REAL NOT NULL,
                flagged_keywords TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (session_id) REFERENCES sessions(id)
            );
            CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id);

            CREATE TABLE IF NOT EXISTS session_metrics (
                session_id TEXT PRIMARY KEY,
                message_count INTEGER NOT NULL,
                user_turns INTEGER NOT NULL,
                assistant_turns INTEGER NOT NULL,
                avg_sentiment REAL NOT NULL,
                max_risk_tier TEXT NOT NULL,
                tier_counts TEXT NOT NULL,
                band_counts TEXT NOT NULL,
                trend_notes TEXT NOT NULL,
                suggested_resources TEXT NOT NULL,
                FOREIGN KEY (session_id) REFERENCES sessions(id)
            );

            CREATE TABLE IF NOT EXISTS buffers (
                session_id TEXT PRIMARY KEY,
                serialized_buffer TEXT NOT NULL,
                capacity INTEGER NOT NULL,
                FOREIGN KEY (session_id) REFERENCES sessions(id)
            );
            "#,
        )
        .context("Failed to initialize schema")?;
        Ok(())
    }

    // Session operations -----------------------------------------------------

    pub fn create_session(&self, session: &SessionRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sessions (id, user_id, status, created_at, updated_at, active_risk_tier, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                session.id,
                session.user_id,
                session.status.as_str(),
                session.created_at.to_rfc3339(),
                session.updated_at.to_rfc3339(),
                session.active_risk_tier.as_str(),
                serde_json::to_string(&session.metadata)?,
            ],
        )?;
        Ok(())
    }

    /// Partial update. Always bumps `updated_at`, even with no other fields.
    pub fn update_session(
        &self,
        session_id: &str,
        status: Option<SessionStatus>,
        active_risk_tier: Option<RiskTier>,
        metadata: Option<&serde_json::Map<String, serde_json::Value>>,
    ) -> Result<()> {
        let mut updates: Vec<&str> = Vec::new();
        let mut values: Vec<String> = Vec::new();

        if let Some(status) = status {
            updates.push("status = ?");
            values.push(status.as_str().to_string());
        }
        if let Some(tier) = active_risk_tier {
            updates.push("active_risk_tier = ?");
            values.push(tier.as_str().to_string());
        }
        if let Some(metadata) = metadata {
            updates.push("metadata = ?");
            values.push(serde_json::to_string(metadata)?);
        }
        updates.push("updated_at = ?");
        values.push(utc_now().to_rfc3339());
        values.push(session_id.to_string());

        let sql = format!("UPDATE sessions SET {} WHERE id = ?", updates.join(", "));
        let conn = self.conn()?;
        conn.execute(&sql, params_from_iter(values.iter()))?;
        Ok(())
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT * FROM sessions WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![session_id], row_to_session)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub fn list_sessions(
        &self,
        user_id: Option<&str>,
        status: Option<SessionStatus>,
    ) -> Result<Vec<SessionRecord>> {
        let mut sql = String::from("SELECT * FROM sessions");
        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<String> = Vec::new();

        if let Some(user_id) = user_id {
            clauses.push("user_id = ?");
            values.push(user_id.to_string());
        }
        if let Some(status) = status {
            clauses.push("status = ?");
            values.push(status.as_str().to_string());
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY datetime(created_at) DESC");

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), row_to_session)?;
        rows.map(|r| r.map_err(Into::into)).collect()
    }

    // Message operations -----------------------------------------------------

    /// Append-only insert; returns the record with the store-assigned id.
    pub fn insert_message(&self, message: &MessageRecord) -> Result<MessageRecord> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO messages (
                session_id, sender, content, sentiment_score,
                risk_tier, risk_score, flagged_keywords, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                message.session_id,
                message.sender.as_str(),
                message.content,
                message.sentiment_score,
                message.risk_tier.as_str(),
                message.risk_score,
                serde_json::to_string(&message.flagged_keywords)?,
                message.created_at.to_rfc3339(),
            ],
        )?;
        let mut stored = message.clone();
        stored.id = Some(conn.last_insert_rowid());
        Ok(stored)
    }

    pub fn list_messages(&self, session_id: &str) -> Result<Vec<MessageRecord>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT * FROM messages WHERE session_id = ?1 ORDER BY id ASC")?;
        let rows = stmt.query_map(params![session_id], row_to_message)?;
        rows.map(|r| r.map_err(Into::into)).collect()
    }

    /// Last `limit` messages by id, returned oldest-first.
    pub fn recent_messages(&self, session_id: &str, limit: usize) -> Result<Vec<MessageRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM (
                SELECT * FROM messages WHERE session_id = ?1 ORDER BY id DESC LIMIT ?2
             ) sub ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![session_id, limit as i64], row_to_message)?;
        rows.map(|r| r.map_err(Into::into)).collect()
    }

    // Metrics ----------------------------------------------------------------

    pub fn upsert_metrics(&self, metrics: &SessionMetrics) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO session_metrics (
                session_id, message_count, user_turns, assistant_turns,
                avg_sentiment, max_risk_tier, tier_counts, band_counts,
                trend_notes, suggested_resources
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(session_id) DO UPDATE SET
                message_count=excluded.message_count,
                user_turns=excluded.user_turns,
                assistant_turns=excluded.assistant_turns,
                avg_sentiment=excluded.avg_sentiment,
                max_risk_tier=excluded.max_risk_tier,
                tier_counts=excluded.tier_counts,
                band_counts=excluded.band_counts,
                trend_notes=excluded.trend_notes,
                suggested_resources=excluded.suggested_resources",
            params![
                metrics.session_id,
                metrics.message_count as i64,
                metrics.user_turns as i64,
                metrics.assistant_turns as i64,
                metrics.avg_sentiment,
                metrics.max_risk_tier.as_str(),
                serde_json::to_string(&metrics.tier_counts)?,
                serde_json::to_string(&metrics.band_counts)?,
                serde_json::to_string(&metrics.trend_notes)?,
                serde_json::to_string(&metrics.suggested_resources)?,
            ],
        )?;
        Ok(())
    }

    pub fn get_metrics(&self, session_id: &str) -> Result<Option<SessionMetrics>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT * FROM session_metrics WHERE session_id = ?1")?;
        let mut rows = stmt.query_map(params![session_id], row_to_metrics)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    // Buffer -----------------------------------------------------------------

    pub fn save_buffer(&self, snapshot: &BufferSnapshot) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO buffers (session_id, serialized_buffer, capacity)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(session_id) DO UPDATE SET
                serialized_buffer=excluded.serialized_buffer,
                capacity=excluded.capacity",
            params![
                snapshot.session_id,
                serde_json::to_string(&snapshot.messages)?,
                snapshot.capacity as i64,
            ],
        )?;
        Ok(())
    }

    pub fn load_buffer(&self, session_id: &str) -> Result<Option<BufferSnapshot>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT serialized_buffer, capacity FROM buffers WHERE session_id = ?1")?;
        let mut rows = stmt.query_map(params![session_id], |row| {
            let serialized: String = row.get(0)?;
            let capacity: i64 = row.get(1)?;
            Ok((serialized, capacity))
        })?;
        let Some(row) = rows.next() else {
            return Ok(None);
        };
        let (serialized, capacity) = row?;
        let messages: Vec<MessageRecord> =
            serde_json::from_str(&serialized).context("Failed to decode buffer snapshot")?;
        Ok(Some(BufferSnapshot {
            session_id: session_id.to_string(),
            messages,
            capacity: capacity as usize,
        }))
    }
}

// Row conversion helpers -----------------------------------------------------

fn parse_ts(value: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<SessionRecord> {
    let status: String = row.get("status")?;
    let tier: String = row.get("active_risk_tier")?;
    let metadata: String = row.get("metadata")?;
    Ok(SessionRecord {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        status: SessionStatus::parse(&status).unwrap_or(SessionStatus::Active),
        created_at: parse_ts(row.get("created_at")?)?,
        updated_at: parse_ts(row.get("updated_at")?)?,
        active_risk_tier: RiskTier::parse_lenient(&tier),
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
    })
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<MessageRecord> {
    let sender: String = row.get("sender")?;
    let tier: String = row.get("risk_tier")?;
    let flagged: String = row.get("flagged_keywords")?;
    Ok(MessageRecord {
        id: Some(row.get("id")?),
        session_id: row.get("session_id")?,
        sender: SenderRole::parse(&sender).unwrap_or(SenderRole::System),
        content: row.get("content")?,
        sentiment_score: row.get("sentiment_score")?,
        risk_tier: RiskTier::parse_lenient(&tier),
        risk_score: row.get("risk_score")?,
        flagged_keywords: serde_json::from_str(&flagged).unwrap_or_default(),
        created_at: parse_ts(row.get("created_at")?)?,
    })
}

fn row_to_metrics(row: &Row<'_>) -> rusqlite::Result<SessionMetrics> {
    let tier: String = row.get("max_risk_tier")?;
    let tier_counts: String = row.get("tier_counts")?;
    let band_counts: String = row.get("band_counts")?;
    let trend_notes: String = row.get("trend_notes")?;
    let resources: String = row.get("suggested_resources")?;
    Ok(SessionMetrics {
        session_id: row.get("session_id")?,
        message_count: row.get::<_, i64>("message_count")? as usize,
        user_turns: row.get::<_, i64>("user_turns")? as usize,
        assistant_turns: row.get::<_, i64>("assistant_turns")? as usize,
        avg_sentiment: row.get("avg_sentiment")?,
        max_risk_tier: RiskTier::parse_lenient(&tier),
        tier_counts: serde_json::from_str(&tier_counts).unwrap_or_default(),
        band_counts: serde_json::from_str(&band_counts).unwrap_or_default(),
        trend_notes: serde_json::from_str(&trend_notes).unwrap_or_default(),
        suggested_resources: serde_json::from_str(&resources).unwrap_or_default(),
    })
}
