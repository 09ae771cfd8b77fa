//! SQLite store.
//!
//! One database file with five tables:
//! - `conversations` — conversation settings
//! - `conversation_messages` — ordered message ids per conversation
//! - `messages` — message rows
//! - `tool_calls` — tool calls with their current status
//! - `system_prompts`, `event_log`
//!
//! Appends, insert-if-absent message writes and tool-call completion are
//! single statements, so concurrent workers never interleave a
//! read-modify-write.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};
use turnflow_core::error::StoreError;
use turnflow_core::message::{Conversation, ConversationId, Message, Role, SystemPrompt};
use turnflow_core::store::{AppendOutcome, EventRecord, InsertOutcome, Store};
use turnflow_core::tool::{ToolCall, ToolCallStatus};

/// A SQLite-backed store.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open a store from a SQLite URL or path.
    ///
    /// Pass `"sqlite::memory:"` for an ephemeral database; it is limited to
    /// one connection so every query sees the same data.
    pub async fn new(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| StoreError::Storage(format!("Invalid SQLite path: {e}")))?;
        let max = if url.contains(":memory:") { 1 } else { 4 };
        Self::connect(options, max, url).await
    }

    /// Open (or create) a database file.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Storage(format!("Create {}: {e}", parent.display())))?;
            }
        }
        let options = SqliteConnectOptions::new().filename(path);
        Self::connect(options, 4, &path.display().to_string()).await
    }

    async fn connect(
        options: SqliteConnectOptions,
        max_connections: u32,
        label: &str,
    ) -> Result<Self, StoreError> {
        let options = options
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to open SQLite: {e}")))?;

        let store = Self { pool };
        store.run_migrations().await?;
        info!("SQLite store initialized at {label}");
        Ok(store)
    }

    /// Create from an existing pool (useful for testing).
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        let statements: [(&str, &str); 8] = [
            (
                "conversations table",
                r#"
                CREATE TABLE IF NOT EXISTS conversations (
                    id               TEXT PRIMARY KEY,
                    title            TEXT NOT NULL DEFAULT '',
                    system_prompt_id TEXT NOT NULL,
                    model            TEXT,
                    created_at       TEXT NOT NULL,
                    updated_at       TEXT NOT NULL
                )
                "#,
            ),
            (
                "conversation_messages table",
                r#"
                CREATE TABLE IF NOT EXISTS conversation_messages (
                    conversation_id TEXT NOT NULL,
                    message_id      TEXT NOT NULL,
                    position        INTEGER NOT NULL,
                    PRIMARY KEY (conversation_id, message_id)
                )
                "#,
            ),
            (
                "conversation_messages index",
                "CREATE INDEX IF NOT EXISTS idx_conv_messages_position \
                 ON conversation_messages(conversation_id, position)",
            ),
            (
                "messages table",
                r#"
                CREATE TABLE IF NOT EXISTS messages (
                    id              TEXT PRIMARY KEY,
                    conversation_id TEXT NOT NULL,
                    role            TEXT NOT NULL,
                    content         TEXT NOT NULL,
                    parent_id       TEXT,
                    token_count     INTEGER NOT NULL DEFAULT 0,
                    model           TEXT,
                    created_at      TEXT NOT NULL
                )
                "#,
            ),
            (
                "tool_calls table",
                r#"
                CREATE TABLE IF NOT EXISTS tool_calls (
                    id          TEXT PRIMARY KEY,
                    message_id  TEXT NOT NULL,
                    position    INTEGER NOT NULL,
                    name        TEXT NOT NULL,
                    arguments   TEXT NOT NULL,
                    status      TEXT NOT NULL,
                    status_json TEXT NOT NULL,
                    created_at  TEXT NOT NULL
                )
                "#,
            ),
            (
                "tool_calls index",
                "CREATE INDEX IF NOT EXISTS idx_tool_calls_message ON tool_calls(message_id, position)",
            ),
            (
                "system_prompts table",
                r#"
                CREATE TABLE IF NOT EXISTS system_prompts (
                    id          TEXT PRIMARY KEY,
                    name        TEXT NOT NULL,
                    content     TEXT NOT NULL,
                    token_count INTEGER NOT NULL DEFAULT 0
                )
                "#,
            ),
            (
                "event_log table",
                r#"
                CREATE TABLE IF NOT EXISTS event_log (
                    seq             INTEGER PRIMARY KEY AUTOINCREMENT,
                    id              TEXT UNIQUE NOT NULL,
                    kind            TEXT NOT NULL,
                    conversation_id TEXT,
                    message_id      TEXT,
                    payload         TEXT NOT NULL,
                    recorded_at     TEXT NOT NULL
                )
                "#,
            ),
        ];

        for (label, sql) in statements {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::MigrationFailed(format!("{label}: {e}")))?;
        }

        debug!("SQLite migrations complete");
        Ok(())
    }

    /// Write a message row with `statement`, then its tool calls. Returns
    /// `false` (and writes nothing else) when the row was left untouched.
    async fn write_message(&self, message: &Message, statement: &str) -> Result<bool, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(query_failed("begin transaction"))?;

        let written = sqlx::query(statement)
            .bind(&message.id)
            .bind(message.conversation_id.as_str())
            .bind(message.role.as_str())
            .bind(&message.content)
            .bind(&message.parent_id)
            .bind(i64::from(message.token_count))
            .bind(&message.model)
            .bind(message.created_at.to_rfc3339())
            .execute(&mut *tx)
            .await
            .map_err(query_failed("write message"))?
            .rows_affected();
        if written == 0 {
            tx.rollback().await.map_err(query_failed("rollback"))?;
            return Ok(false);
        }

        for (position, call) in message.tool_calls.iter().enumerate() {
            let arguments = serde_json::to_string(&call.arguments)
                .map_err(|e| StoreError::Storage(format!("Arguments serialization: {e}")))?;
            sqlx::query(
                r#"
                INSERT INTO tool_calls (id, message_id, position, name, arguments, status, status_json, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(id) DO NOTHING
                "#,
            )
            .bind(&call.id)
            .bind(&call.message_id)
            .bind(position as i64)
            .bind(&call.name)
            .bind(arguments)
            .bind(call.status.name())
            .bind(encode_status(call)?)
            .bind(call.created_at.to_rfc3339())
            .execute(&mut *tx)
            .await
            .map_err(query_failed("insert tool call"))?;
        }

        tx.commit().await.map_err(query_failed("commit"))?;
        Ok(true)
    }

    async fn message_ids(&self, id: &ConversationId) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            "SELECT message_id FROM conversation_messages \
             WHERE conversation_id = ?1 ORDER BY position ASC",
        )
        .bind(id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed("load message ids"))?;

        rows.iter()
            .map(|r| {
                r.try_get::<String, _>("message_id")
                    .map_err(query_failed("message_id column"))
            })
            .collect()
    }

    async fn tool_calls_for(&self, message_id: &str) -> Result<Vec<ToolCall>, StoreError> {
        let rows = sqlx::query("SELECT * FROM tool_calls WHERE message_id = ?1 ORDER BY position ASC")
            .bind(message_id)
            .fetch_all(&self.pool)
            .await
            .map_err(query_failed("load tool calls"))?;
        rows.iter().map(row_to_tool_call).collect()
    }
}

fn query_failed(context: &'static str) -> impl Fn(sqlx::Error) -> StoreError {
    move |e| StoreError::QueryFailed(format!("{context}: {e}"))
}

fn parse_time(id: &str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            id: id.to_string(),
            reason: format!("timestamp '{raw}': {e}"),
        })
}

fn to_u32(v: i64) -> u32 {
    u32::try_from(v.max(0)).unwrap_or(u32::MAX)
}

fn row_to_conversation(row: &SqliteRow, message_ids: Vec<String>) -> Result<Conversation, StoreError> {
    let id: String = row.try_get("id").map_err(query_failed("id column"))?;
    let created_at: String = row
        .try_get("created_at")
        .map_err(query_failed("created_at column"))?;
    let updated_at: String = row
        .try_get("updated_at")
        .map_err(query_failed("updated_at column"))?;

    Ok(Conversation {
        title: row.try_get("title").map_err(query_failed("title column"))?,
        system_prompt_id: row
            .try_get("system_prompt_id")
            .map_err(query_failed("system_prompt_id column"))?,
        model: row.try_get("model").map_err(query_failed("model column"))?,
        message_ids,
        created_at: parse_time(&id, &created_at)?,
        updated_at: parse_time(&id, &updated_at)?,
        id: ConversationId(id),
    })
}

fn row_to_message(row: &SqliteRow, tool_calls: Vec<ToolCall>) -> Result<Message, StoreError> {
    let id: String = row.try_get("id").map_err(query_failed("id column"))?;
    let role_raw: String = row.try_get("role").map_err(query_failed("role column"))?;
    let role = Role::parse(&role_raw).ok_or_else(|| StoreError::Corrupt {
        id: id.clone(),
        reason: format!("unknown role '{role_raw}'"),
    })?;
    let conversation_id: String = row
        .try_get("conversation_id")
        .map_err(query_failed("conversation_id column"))?;
    let token_count: i64 = row
        .try_get("token_count")
        .map_err(query_failed("token_count column"))?;
    let created_at: String = row
        .try_get("created_at")
        .map_err(query_failed("created_at column"))?;

    Ok(Message {
        conversation_id: ConversationId(conversation_id),
        role,
        content: row.try_get("content").map_err(query_failed("content column"))?,
        parent_id: row
            .try_get("parent_id")
            .map_err(query_failed("parent_id column"))?,
        token_count: to_u32(token_count),
        model: row.try_get("model").map_err(query_failed("model column"))?,
        tool_calls,
        created_at: parse_time(&id, &created_at)?,
        id,
    })
}

fn row_to_tool_call(row: &SqliteRow) -> Result<ToolCall, StoreError> {
    let id: String = row.try_get("id").map_err(query_failed("id column"))?;
    let arguments: String = row
        .try_get("arguments")
        .map_err(query_failed("arguments column"))?;
    let status_json: String = row
        .try_get("status_json")
        .map_err(query_failed("status_json column"))?;
    let created_at: String = row
        .try_get("created_at")
        .map_err(query_failed("created_at column"))?;

    let corrupt = |what: &str, e: serde_json::Error| StoreError::Corrupt {
        id: id.clone(),
        reason: format!("{what}: {e}"),
    };
    let arguments = serde_json::from_str(&arguments).map_err(|e| corrupt("arguments", e))?;
    let status: ToolCallStatus =
        serde_json::from_str(&status_json).map_err(|e| corrupt("status", e))?;

    Ok(ToolCall {
        message_id: row
            .try_get("message_id")
            .map_err(query_failed("message_id column"))?,
        name: row.try_get("name").map_err(query_failed("name column"))?,
        arguments,
        created_at: parse_time(&id, &created_at)?,
        status,
        id,
    })
}

fn row_to_event(row: &SqliteRow) -> Result<EventRecord, StoreError> {
    let id: String = row.try_get("id").map_err(query_failed("id column"))?;
    let payload: String = row
        .try_get("payload")
        .map_err(query_failed("payload column"))?;
    let recorded_at: String = row
        .try_get("recorded_at")
        .map_err(query_failed("recorded_at column"))?;
    let conversation_id: Option<String> = row
        .try_get("conversation_id")
        .map_err(query_failed("conversation_id column"))?;

    Ok(EventRecord {
        kind: row.try_get("kind").map_err(query_failed("kind column"))?,
        conversation_id: conversation_id.map(ConversationId),
        message_id: row
            .try_get("message_id")
            .map_err(query_failed("message_id column"))?,
        payload: serde_json::from_str(&payload).map_err(|e| StoreError::Corrupt {
            id: id.clone(),
            reason: format!("payload: {e}"),
        })?,
        recorded_at: parse_time(&id, &recorded_at)?,
        id,
    })
}

fn encode_status(call: &ToolCall) -> Result<String, StoreError> {
    serde_json::to_string(&call.status)
        .map_err(|e| StoreError::Storage(format!("Status serialization: {e}")))
}

#[async_trait]
impl Store for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn get_conversation(
        &self,
        id: &ConversationId,
    ) -> Result<Option<Conversation>, StoreError> {
        let row = sqlx::query("SELECT * FROM conversations WHERE id = ?1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(query_failed("get conversation"))?;

        match row {
            Some(row) => {
                let ids = self.message_ids(id).await?;
                Ok(Some(row_to_conversation(&row, ids)?))
            }
            None => Ok(None),
        }
    }

    async fn save_conversation(&self, conversation: &Conversation) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(query_failed("begin transaction"))?;

        sqlx::query(
            r#"
            INSERT INTO conversations (id, title, system_prompt_id, model, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                system_prompt_id = excluded.system_prompt_id,
                model = excluded.model,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(conversation.id.as_str())
        .bind(&conversation.title)
        .bind(&conversation.system_prompt_id)
        .bind(&conversation.model)
        .bind(conversation.created_at.to_rfc3339())
        .bind(conversation.updated_at.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(query_failed("upsert conversation"))?;

        for message_id in &conversation.message_ids {
            sqlx::query(APPEND_SQL)
                .bind(conversation.id.as_str())
                .bind(message_id)
                .execute(&mut *tx)
                .await
                .map_err(query_failed("save message ids"))?;
        }

        tx.commit().await.map_err(query_failed("commit"))?;
        Ok(())
    }

    async fn append_message_id(
        &self,
        conversation_id: &ConversationId,
        message_id: &str,
    ) -> Result<AppendOutcome, StoreError> {
        let exists = sqlx::query("SELECT 1 FROM conversations WHERE id = ?1")
            .bind(conversation_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(query_failed("check conversation"))?;
        if exists.is_none() {
            return Ok(AppendOutcome::MissingConversation);
        }

        let result = sqlx::query(APPEND_SQL)
            .bind(conversation_id.as_str())
            .bind(message_id)
            .execute(&self.pool)
            .await
            .map_err(query_failed("append message id"))?;

        if result.rows_affected() == 0 {
            return Ok(AppendOutcome::AlreadyPresent);
        }

        sqlx::query("UPDATE conversations SET updated_at = ?2 WHERE id = ?1")
            .bind(conversation_id.as_str())
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(query_failed("touch conversation"))?;

        Ok(AppendOutcome::Appended)
    }

    async fn get_message(&self, id: &str) -> Result<Option<Message>, StoreError> {
        let row = sqlx::query("SELECT * FROM messages WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_failed("get message"))?;

        match row {
            Some(row) => {
                let calls = self.tool_calls_for(id).await?;
                Ok(Some(row_to_message(&row, calls)?))
            }
            None => Ok(None),
        }
    }

    async fn get_messages(&self, ids: &[String]) -> Result<Vec<Message>, StoreError> {
        let mut messages = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(message) = self.get_message(id).await? {
                messages.push(message);
            }
        }
        Ok(messages)
    }

    async fn save_message(&self, message: &Message) -> Result<(), StoreError> {
        self.write_message(message, UPSERT_MESSAGE).await?;
        Ok(())
    }

    async fn insert_message_if_absent(&self, message: &Message) -> Result<InsertOutcome, StoreError> {
        if self.write_message(message, INSERT_MESSAGE_IF_ABSENT).await? {
            return Ok(InsertOutcome::Inserted);
        }
        self.get_message(&message.id)
            .await?
            .map(InsertOutcome::Existing)
            .ok_or_else(|| StoreError::Corrupt {
                id: message.id.clone(),
                reason: "message row vanished after a conflicting insert".into(),
            })
    }

    async fn get_system_prompt(&self, id: &str) -> Result<Option<SystemPrompt>, StoreError> {
        let row = sqlx::query("SELECT * FROM system_prompts WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_failed("get system prompt"))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let token_count: i64 = row
            .try_get("token_count")
            .map_err(query_failed("token_count column"))?;
        Ok(Some(SystemPrompt {
            id: row.try_get("id").map_err(query_failed("id column"))?,
            name: row.try_get("name").map_err(query_failed("name column"))?,
            content: row.try_get("content").map_err(query_failed("content column"))?,
            token_count: to_u32(token_count),
        }))
    }

    async fn save_system_prompt(&self, prompt: &SystemPrompt) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO system_prompts (id, name, content, token_count)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                content = excluded.content,
                token_count = excluded.token_count
            "#,
        )
        .bind(&prompt.id)
        .bind(&prompt.name)
        .bind(&prompt.content)
        .bind(i64::from(prompt.token_count))
        .execute(&self.pool)
        .await
        .map_err(query_failed("upsert system prompt"))?;
        Ok(())
    }

    async fn get_tool_call(&self, id: &str) -> Result<Option<ToolCall>, StoreError> {
        let row = sqlx::query("SELECT * FROM tool_calls WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_failed("get tool call"))?;
        row.as_ref().map(row_to_tool_call).transpose()
    }

    async fn complete_tool_call(&self, call: &ToolCall) -> Result<bool, StoreError> {
        if !call.status.is_terminal() {
            return Ok(false);
        }
        let result = sqlx::query(
            "UPDATE tool_calls SET status = ?2, status_json = ?3 \
             WHERE id = ?1 AND status = 'pending'",
        )
        .bind(&call.id)
        .bind(call.status.name())
        .bind(encode_status(call)?)
        .execute(&self.pool)
        .await
        .map_err(query_failed("complete tool call"))?;

        Ok(result.rows_affected() == 1)
    }

    async fn append_event(&self, record: EventRecord) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&record.payload)
            .map_err(|e| StoreError::Storage(format!("Payload serialization: {e}")))?;
        sqlx::query(
            r#"
            INSERT INTO event_log (id, kind, conversation_id, message_id, payload, recorded_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&record.id)
        .bind(&record.kind)
        .bind(record.conversation_id.as_ref().map(|c| c.as_str()))
        .bind(&record.message_id)
        .bind(payload)
        .bind(record.recorded_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(query_failed("append event"))?;
        Ok(())
    }

    async fn recent_events(&self, limit: usize) -> Result<Vec<EventRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM event_log ORDER BY seq DESC LIMIT ?1")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(query_failed("recent events"))?;
        rows.iter().map(row_to_event).collect()
    }
}

/// Appends at the next position; a repeated id is ignored.
const APPEND_SQL: &str = r#"
    INSERT INTO conversation_messages (conversation_id, message_id, position)
    SELECT ?1, ?2, COALESCE(MAX(position), -1) + 1
    FROM conversation_messages WHERE conversation_id = ?1
    ON CONFLICT(conversation_id, message_id) DO NOTHING
"#;

const UPSERT_MESSAGE: &str = r#"
    INSERT INTO messages (id, conversation_id, role, content, parent_id, token_count, model, created_at)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
    ON CONFLICT(id) DO UPDATE SET
        content = excluded.content,
        token_count = excluded.token_count,
        model = excluded.model
"#;

const INSERT_MESSAGE_IF_ABSENT: &str = r#"
    INSERT INTO messages (id, conversation_id, role, content, parent_id, token_count, model, created_at)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
    ON CONFLICT(id) DO NOTHING
"#;
