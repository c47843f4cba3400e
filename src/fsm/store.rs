//! 存储抽象层
//!
//! 会话存储与状态机定义存储的读写契约，支持内存和持久化（SQLite）两种实现。
//! `update` 必须在记录不存在时报错（不做隐式 upsert），并校验乐观并发版本号。

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::core::EngineError;
use crate::fsm::types::{AgentSession, StateMachineDefinition};

/// 会话存储接口
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn find_by_id(&self, session_id: &str) -> Result<Option<AgentSession>, EngineError>;

    /// 创建会话；id 已存在时返回 AlreadyExists
    async fn create(&self, session: AgentSession) -> Result<AgentSession, EngineError>;

    /// 更新会话
    ///
    /// 记录不存在 → SessionNotFound；存储版本 != `session.version` → VersionConflict。
    /// 成功时返回版本 +1、`updated_at` 刷新后的会话。
    async fn update(&self, session: AgentSession) -> Result<AgentSession, EngineError>;

    /// 删除会话，返回是否确实删除
    async fn delete(&self, session_id: &str) -> Result<bool, EngineError>;
}

/// 状态机定义存储接口
#[async_trait]
pub trait DefinitionStore: Send + Sync {
    async fn find_by_id(&self, fsm_id: &str) -> Result<Option<StateMachineDefinition>, EngineError>;

    /// 创建定义（先校验）；id 已存在时返回 AlreadyExists
    async fn create(
        &self,
        definition: StateMachineDefinition,
    ) -> Result<StateMachineDefinition, EngineError>;

    async fn update(
        &self,
        definition: StateMachineDefinition,
    ) -> Result<StateMachineDefinition, EngineError>;

    async fn delete(&self, fsm_id: &str) -> Result<bool, EngineError>;
}

/// 内存会话存储
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, AgentSession>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn find_by_id(&self, session_id: &str) -> Result<Option<AgentSession>, EngineError> {
        Ok(self.sessions.read().await.get(session_id).cloned())
    }

    async fn create(&self, session: AgentSession) -> Result<AgentSession, EngineError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.session_id) {
            return Err(EngineError::AlreadyExists(session.session_id));
        }
        sessions.insert(session.session_id.clone(), session.clone());
        Ok(session)
    }

    async fn update(&self, session: AgentSession) -> Result<AgentSession, EngineError> {
        let mut sessions = self.sessions.write().await;
        let stored = sessions
            .get_mut(&session.session_id)
            .ok_or_else(|| EngineError::SessionNotFound {
                session_id: session.session_id.clone(),
            })?;

        if stored.version != session.version {
            return Err(EngineError::VersionConflict {
                session_id: session.session_id.clone(),
                expected: session.version,
                actual: stored.version,
            });
        }

        let mut next = session;
        next.version += 1;
        next.updated_at = Utc::now();
        *stored = next.clone();
        Ok(next)
    }

    async fn delete(&self, session_id: &str) -> Result<bool, EngineError> {
        Ok(self.sessions.write().await.remove(session_id).is_some())
    }
}

/// 内存状态机定义存储
#[derive(Default)]
pub struct MemoryDefinitionStore {
    definitions: RwLock<HashMap<String, StateMachineDefinition>>,
}

impl MemoryDefinitionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预置一批定义（测试 / 启动时装载）
    pub async fn with_definitions(
        definitions: impl IntoIterator<Item = StateMachineDefinition>,
    ) -> Result<Self, EngineError> {
        let store = Self::new();
        for def in definitions {
            store.create(def).await?;
        }
        Ok(store)
    }
}

#[async_trait]
impl DefinitionStore for MemoryDefinitionStore {
    async fn find_by_id(
        &self,
        fsm_id: &str,
    ) -> Result<Option<StateMachineDefinition>, EngineError> {
        Ok(self.definitions.read().await.get(fsm_id).cloned())
    }

    async fn create(
        &self,
        definition: StateMachineDefinition,
    ) -> Result<StateMachineDefinition, EngineError> {
        definition.validate()?;
        let mut definitions = self.definitions.write().await;
        if definitions.contains_key(&definition.id) {
            return Err(EngineError::AlreadyExists(definition.id));
        }
        definitions.insert(definition.id.clone(), definition.clone());
        Ok(definition)
    }

    async fn update(
        &self,
        definition: StateMachineDefinition,
    ) -> Result<StateMachineDefinition, EngineError> {
        definition.validate()?;
        let mut definitions = self.definitions.write().await;
        let stored = definitions
            .get_mut(&definition.id)
            .ok_or_else(|| EngineError::DefinitionNotFound {
                fsm_id: definition.id.clone(),
            })?;
        *stored = definition.clone();
        Ok(definition)
    }

    async fn delete(&self, fsm_id: &str) -> Result<bool, EngineError> {
        Ok(self.definitions.write().await.remove(fsm_id).is_some())
    }
}

/// 创建存储
///
/// 如果提供了 db_path 且启用了 async-sqlite feature，则使用 SQLite；否则使用内存存储
pub async fn create_stores(
    db_path: Option<&Path>,
) -> (Arc<dyn SessionStore>, Arc<dyn DefinitionStore>) {
    #[cfg(feature = "async-sqlite")]
    if let Some(path) = db_path {
        match super::sqlite::SqliteStore::open(path).await {
            Ok(store) => {
                tracing::info!("Using SQLite store: {:?}", path);
                let store = Arc::new(store);
                let sessions: Arc<dyn SessionStore> = store.clone();
                let definitions: Arc<dyn DefinitionStore> = store;
                return (sessions, definitions);
            }
            Err(e) => {
                tracing::warn!("Failed to open SQLite store, falling back to memory: {}", e);
            }
        }
    }

    #[cfg(not(feature = "async-sqlite"))]
    if db_path.is_some() {
        tracing::warn!(
            "SQLite store requested but async-sqlite feature not enabled, using memory store"
        );
    }

    tracing::info!("Using in-memory stores");
    (
        Arc::new(MemorySessionStore::new()),
        Arc::new(MemoryDefinitionStore::new()),
    )
}

/// 从 JSON 文件（定义数组）装载状态机定义；已存在的 id 跳过
pub async fn load_definitions(
    store: &dyn DefinitionStore,
    path: &Path,
) -> Result<usize, EngineError> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| EngineError::Storage(format!("read {}: {}", path.display(), e)))?;
    let definitions: Vec<StateMachineDefinition> = serde_json::from_str(&raw)?;

    let mut loaded = 0;
    for def in definitions {
        match store.create(def).await {
            Ok(def) => {
                tracing::debug!(fsm_id = %def.id, "Loaded state machine definition");
                loaded += 1;
            }
            Err(EngineError::AlreadyExists(id)) => {
                tracing::debug!(fsm_id = %id, "Definition already present, skipped");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::DefinitionBuilder;

    #[tokio::test]
    async fn test_update_requires_existing_record() {
        let store = MemorySessionStore::new();
        let session = AgentSession::new("agent", "fsm", "idle");

        let err = store.update(session.clone()).await.unwrap_err();
        assert_eq!(
            err,
            EngineError::SessionNotFound {
                session_id: session.session_id.clone()
            }
        );
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_update_bumps_version_and_rejects_stale() {
        let store = MemorySessionStore::new();
        let session = store
            .create(AgentSession::new("agent", "fsm", "idle"))
            .await
            .unwrap();

        let updated = store.update(session.advanced_to("working")).await.unwrap();
        assert_eq!(updated.version, 1);

        // 基于旧版本的写入被拒绝
        let err = store.update(session.advanced_to("done")).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::VersionConflict { expected: 0, actual: 1, .. }
        ));

        let stored = SessionStore::find_by_id(&store, &session.session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.phase, "working");
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate() {
        let store = MemorySessionStore::new();
        let session = AgentSession::new("agent", "fsm", "idle");
        store.create(session.clone()).await.unwrap();
        assert!(matches!(
            store.create(session).await,
            Err(EngineError::AlreadyExists(_))
        ));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_definition_store_crud() {
        let def = DefinitionBuilder::new("task")
            .id("fsm_task")
            .initial("idle")
            .transition("idle", "start", "working")
            .build()
            .unwrap();
        let store = MemoryDefinitionStore::with_definitions([def.clone()])
            .await
            .unwrap();

        assert_eq!(store.find_by_id("fsm_task").await.unwrap(), Some(def.clone()));
        assert!(store.delete("fsm_task").await.unwrap());
        assert!(!store.delete("fsm_task").await.unwrap());
        assert!(matches!(
            store.update(def).await,
            Err(EngineError::DefinitionNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_load_definitions_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("definitions.json");
        std::fs::write(
            &path,
            r#"[{
                "id": "fsm_task",
                "name": "task",
                "initial_phase": "idle",
                "terminal_phases": ["done"],
                "transitions": [{"from": "idle", "command": "start", "to": "done"}]
            }]"#,
        )
        .unwrap();

        let store = MemoryDefinitionStore::new();
        assert_eq!(load_definitions(&store, &path).await.unwrap(), 1);
        // 再次装载时跳过已存在的定义
        assert_eq!(load_definitions(&store, &path).await.unwrap(), 0);
        assert!(store.find_by_id("fsm_task").await.unwrap().is_some());
    }
}
