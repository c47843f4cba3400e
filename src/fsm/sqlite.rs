//! SQLite 持久化存储
//!
//! 会话与状态机定义落盘，服务重启后可恢复。会话表带 `version` 列，
//! `update` 以 `WHERE session_id = ? AND version = ?` 实现乐观并发。

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use super::store::{DefinitionStore, SessionStore};
use super::types::{AgentSession, StateMachineDefinition};
use crate::core::EngineError;

/// SQLite 存储（同时实现会话存储与定义存储）
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// 打开（不存在则创建）数据库文件
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self, sqlx::Error> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        let store = Self { pool };
        store.init_tables().await?;
        Ok(store)
    }

    /// 内存数据库（单连接，连接即数据库）
    pub async fn in_memory() -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let store = Self { pool };
        store.init_tables().await?;
        Ok(store)
    }

    async fn init_tables(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS state_machine_definitions (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                initial_phase TEXT NOT NULL,
                terminal_phases TEXT NOT NULL,
                transitions TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS agent_sessions (
                session_id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL,
                fsm_id TEXT NOT NULL,
                phase TEXT NOT NULL,
                task_id TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                metadata TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_agent_sessions_fsm ON agent_sessions(fsm_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, EngineError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| EngineError::Storage(format!("bad timestamp '{}': {}", raw, e)))
}

fn row_to_session(row: &SqliteRow) -> Result<AgentSession, EngineError> {
    let metadata: String = row.try_get("metadata")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    let retry_count: i64 = row.try_get("retry_count")?;
    let version: i64 = row.try_get("version")?;

    Ok(AgentSession {
        session_id: row.try_get("session_id")?,
        agent_id: row.try_get("agent_id")?,
        fsm_id: row.try_get("fsm_id")?,
        phase: row.try_get("phase")?,
        task_id: row.try_get("task_id")?,
        retry_count: retry_count as u32,
        metadata: serde_json::from_str(&metadata)?,
        version: version as u64,
        created_at: parse_time(&created_at)?,
        updated_at: parse_time(&updated_at)?,
    })
}

fn row_to_definition(row: &SqliteRow) -> Result<StateMachineDefinition, EngineError> {
    let terminal_phases: String = row.try_get("terminal_phases")?;
    let transitions: String = row.try_get("transitions")?;

    Ok(StateMachineDefinition {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        initial_phase: row.try_get("initial_phase")?,
        terminal_phases: serde_json::from_str(&terminal_phases)?,
        transitions: serde_json::from_str(&transitions)?,
    })
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => db.is_unique_violation(),
        _ => false,
    }
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn find_by_id(&self, session_id: &str) -> Result<Option<AgentSession>, EngineError> {
        let row = sqlx::query("SELECT * FROM agent_sessions WHERE session_id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_session).transpose()
    }

    async fn create(&self, session: AgentSession) -> Result<AgentSession, EngineError> {
        let result = sqlx::query(
            "INSERT INTO agent_sessions
                (session_id, agent_id, fsm_id, phase, task_id, retry_count, metadata,
                 version, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&session.session_id)
        .bind(&session.agent_id)
        .bind(&session.fsm_id)
        .bind(&session.phase)
        .bind(&session.task_id)
        .bind(session.retry_count as i64)
        .bind(serde_json::to_string(&session.metadata)?)
        .bind(session.version as i64)
        .bind(session.created_at.to_rfc3339())
        .bind(session.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(session),
            Err(e) if is_unique_violation(&e) => {
                Err(EngineError::AlreadyExists(session.session_id))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, session: AgentSession) -> Result<AgentSession, EngineError> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE agent_sessions
             SET agent_id = ?, fsm_id = ?, phase = ?, task_id = ?, retry_count = ?,
                 metadata = ?, version = version + 1, updated_at = ?
             WHERE session_id = ? AND version = ?",
        )
        .bind(&session.agent_id)
        .bind(&session.fsm_id)
        .bind(&session.phase)
        .bind(&session.task_id)
        .bind(session.retry_count as i64)
        .bind(serde_json::to_string(&session.metadata)?)
        .bind(now.to_rfc3339())
        .bind(&session.session_id)
        .bind(session.version as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let current: Option<i64> =
                sqlx::query_scalar("SELECT version FROM agent_sessions WHERE session_id = ?")
                    .bind(&session.session_id)
                    .fetch_optional(&self.pool)
                    .await?;

            return Err(match current {
                None => EngineError::SessionNotFound {
                    session_id: session.session_id,
                },
                Some(actual) => EngineError::VersionConflict {
                    session_id: session.session_id,
                    expected: session.version,
                    actual: actual as u64,
                },
            });
        }

        Ok(AgentSession {
            version: session.version + 1,
            updated_at: now,
            ..session
        })
    }

    async fn delete(&self, session_id: &str) -> Result<bool, EngineError> {
        let result = sqlx::query("DELETE FROM agent_sessions WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl DefinitionStore for SqliteStore {
    async fn find_by_id(
        &self,
        fsm_id: &str,
    ) -> Result<Option<StateMachineDefinition>, EngineError> {
        let row = sqlx::query("SELECT * FROM state_machine_definitions WHERE id = ?")
            .bind(fsm_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_definition).transpose()
    }

    async fn create(
        &self,
        definition: StateMachineDefinition,
    ) -> Result<StateMachineDefinition, EngineError> {
        definition.validate()?;
        let result = sqlx::query(
            "INSERT INTO state_machine_definitions
                (id, name, initial_phase, terminal_phases, transitions)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&definition.id)
        .bind(&definition.name)
        .bind(&definition.initial_phase)
        .bind(serde_json::to_string(&definition.terminal_phases)?)
        .bind(serde_json::to_string(&definition.transitions)?)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(definition),
            Err(e) if is_unique_violation(&e) => Err(EngineError::AlreadyExists(definition.id)),
            Err(e) => Err(e.into()),
        }
    }

    async fn update(
        &self,
        definition: StateMachineDefinition,
    ) -> Result<StateMachineDefinition, EngineError> {
        definition.validate()?;
        let result = sqlx::query(
            "UPDATE state_machine_definitions
             SET name = ?, initial_phase = ?, terminal_phases = ?, transitions = ?
             WHERE id = ?",
        )
        .bind(&definition.name)
        .bind(&definition.initial_phase)
        .bind(serde_json::to_string(&definition.terminal_phases)?)
        .bind(serde_json::to_string(&definition.transitions)?)
        .bind(&definition.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::DefinitionNotFound {
                fsm_id: definition.id,
            });
        }
        Ok(definition)
    }

    async fn delete(&self, fsm_id: &str) -> Result<bool, EngineError> {
        let result = sqlx::query("DELETE FROM state_machine_definitions WHERE id = ?")
            .bind(fsm_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
