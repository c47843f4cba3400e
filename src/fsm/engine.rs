//! 转移引擎
//!
//! `apply(session_id, command)`：加载会话与定义 → 查找 `(phase, command)` 转移 → 持久化新阶段 →
//! 依次 await `on_transition`、`on_terminal_state`。
//!
//! 顺序保证：持久化 happens-before on_transition happens-before on_terminal_state。
//! 副作用失败不回滚已持久化的阶段，调用方应在重试前重新查询会话。

use std::sync::Arc;

use crate::core::EngineError;
use crate::fsm::effects::SideEffects;
use crate::fsm::locks::SessionLocks;
use crate::fsm::store::{DefinitionStore, SessionStore};
use crate::fsm::types::{AgentSession, TransitionResult};

/// 转移引擎
pub struct TransitionEngine {
    sessions: Arc<dyn SessionStore>,
    definitions: Arc<dyn DefinitionStore>,
    side_effects: Arc<dyn SideEffects>,
    locks: SessionLocks,
}

impl TransitionEngine {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        definitions: Arc<dyn DefinitionStore>,
        side_effects: Arc<dyn SideEffects>,
    ) -> Self {
        Self {
            sessions,
            definitions,
            side_effects,
            locks: SessionLocks::new(),
        }
    }

    /// 按定义的初始阶段创建会话
    pub async fn start_session(
        &self,
        agent_id: &str,
        fsm_id: &str,
        task_id: Option<String>,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Result<AgentSession, EngineError> {
        let definition = self
            .definitions
            .find_by_id(fsm_id)
            .await?
            .ok_or_else(|| EngineError::DefinitionNotFound {
                fsm_id: fsm_id.to_string(),
            })?;

        let mut session = AgentSession::new(agent_id, fsm_id, definition.initial_phase.as_str())
            .with_metadata(metadata);
        session.task_id = task_id;

        let session = self.sessions.create(session).await?;
        tracing::info!(
            session_id = %session.session_id,
            fsm_id,
            phase = %session.phase,
            "Session started"
        );
        Ok(session)
    }

    /// 对会话应用命令
    ///
    /// 每次调用恰好一次持久化写入、零到两次副作用回调；不重试。
    pub async fn apply(
        &self,
        session_id: &str,
        command: &str,
    ) -> Result<TransitionResult, EngineError> {
        let _guard = self.locks.acquire(session_id).await;

        let session = self
            .sessions
            .find_by_id(session_id)
            .await?
            .ok_or_else(|| EngineError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;

        let definition = self
            .definitions
            .find_by_id(&session.fsm_id)
            .await?
            .ok_or_else(|| EngineError::DefinitionNotFound {
                fsm_id: session.fsm_id.clone(),
            })?;

        let transition = definition
            .find_transition(&session.phase, command)
            .ok_or_else(|| {
                tracing::warn!(
                    session_id,
                    phase = %session.phase,
                    command,
                    available = ?definition.commands_from(&session.phase).collect::<Vec<_>>(),
                    "No transition for command"
                );
                EngineError::InvalidTransition {
                    phase: session.phase.clone(),
                    command: command.to_string(),
                }
            })?;

        let from = session.phase.clone();
        let to = transition.to.clone();

        let updated = self.sessions.update(session.advanced_to(&to)).await?;

        self.side_effects
            .on_transition(&updated, &from, &to, command)
            .await?;

        let is_terminal = definition.is_terminal(&to);
        if is_terminal {
            self.side_effects.on_terminal_state(&updated, &to).await?;
        }

        tracing::debug!(
            session_id,
            from = %from,
            to = %to,
            command,
            is_terminal,
            version = updated.version,
            "Transition applied"
        );

        Ok(TransitionResult {
            session: updated,
            previous_phase: from,
            is_terminal,
        })
    }

    /// 重新查询会话（apply 失败后确认阶段是否已推进）
    pub async fn session(&self, session_id: &str) -> Result<AgentSession, EngineError> {
        self.sessions
            .find_by_id(session_id)
            .await?
            .ok_or_else(|| EngineError::SessionNotFound {
                session_id: session_id.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::{
        DefinitionBuilder, MemoryDefinitionStore, MemorySessionStore, RecordingSideEffects,
    };

    async fn engine_with(
        side_effects: Arc<RecordingSideEffects>,
    ) -> (TransitionEngine, Arc<MemorySessionStore>) {
        let def = DefinitionBuilder::new("task")
            .id("fsm_task")
            .initial("idle")
            .terminal("done")
            .transition("idle", "start", "working")
            .transition("working", "complete", "done")
            .build()
            .unwrap();
        let sessions = Arc::new(MemorySessionStore::new());
        let definitions = Arc::new(MemoryDefinitionStore::with_definitions([def]).await.unwrap());
        (
            TransitionEngine::new(sessions.clone(), definitions, side_effects),
            sessions,
        )
    }

    #[tokio::test]
    async fn test_start_session_uses_initial_phase() {
        let (engine, _) = engine_with(Arc::new(RecordingSideEffects::new())).await;
        let session = engine
            .start_session("agent", "fsm_task", Some("task-1".into()), Default::default())
            .await
            .unwrap();
        assert_eq!(session.phase, "idle");
        assert_eq!(session.retry_count, 0);
        assert_eq!(session.task_id.as_deref(), Some("task-1"));
    }

    #[tokio::test]
    async fn test_start_session_unknown_definition() {
        let (engine, sessions) = engine_with(Arc::new(RecordingSideEffects::new())).await;
        let err = engine
            .start_session("agent", "fsm_missing", None, Default::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "definition_not_found");
        assert!(sessions.is_empty().await);
    }

    #[tokio::test]
    async fn test_side_effect_failure_keeps_persisted_phase() {
        let effects = Arc::new(RecordingSideEffects::failing());
        let (engine, _) = engine_with(effects.clone()).await;
        let session = engine
            .start_session("agent", "fsm_task", None, Default::default())
            .await
            .unwrap();

        let err = engine.apply(&session.session_id, "start").await.unwrap_err();
        assert_eq!(err.code(), "side_effect_failed");

        // 持久化先于副作用，阶段已推进
        let current = engine.session(&session.session_id).await.unwrap();
        assert_eq!(current.phase, "working");
        assert_eq!(effects.transition_count().await, 1);
        assert_eq!(effects.terminal_count().await, 0);
    }

    #[tokio::test]
    async fn test_concurrent_apply_on_one_session() {
        let effects = Arc::new(RecordingSideEffects::new());
        let (engine, _) = engine_with(effects.clone()).await;
        let engine = Arc::new(engine);
        let session = engine
            .start_session("agent", "fsm_task", None, Default::default())
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let engine = Arc::clone(&engine);
            let id = session.session_id.clone();
            handles.push(tokio::spawn(async move { engine.apply(&id, "start").await }));
        }

        let mut ok = 0;
        let mut invalid = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => ok += 1,
                Err(EngineError::InvalidTransition { phase, .. }) => {
                    assert_eq!(phase, "working");
                    invalid += 1;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        // 单写者：只有一个 start 生效，其余看到已推进的阶段
        assert_eq!(ok, 1);
        assert_eq!(invalid, 7);
        assert_eq!(effects.transition_count().await, 1);
    }
}
