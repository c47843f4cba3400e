//! 副作用端口：每次转移、每次进入终止阶段时通知
//!
//! 两个回调都被引擎 await，失败会原样返回给 `apply` 的调用方。

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::core::EngineError;
use crate::fsm::types::AgentSession;

#[async_trait]
pub trait SideEffects: Send + Sync {
    /// 会话已持久化到 `to` 之后调用
    async fn on_transition(
        &self,
        session: &AgentSession,
        from: &str,
        to: &str,
        command: &str,
    ) -> Result<(), EngineError>;

    /// 进入终止阶段时调用（在 on_transition 之后）
    async fn on_terminal_state(
        &self,
        session: &AgentSession,
        phase: &str,
    ) -> Result<(), EngineError>;
}

/// 只写日志的副作用实现
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSideEffects;

#[async_trait]
impl SideEffects for TracingSideEffects {
    async fn on_transition(
        &self,
        session: &AgentSession,
        from: &str,
        to: &str,
        command: &str,
    ) -> Result<(), EngineError> {
        tracing::info!(
            session_id = %session.session_id,
            agent_id = %session.agent_id,
            from,
            to,
            command,
            "Session transitioned"
        );
        Ok(())
    }

    async fn on_terminal_state(
        &self,
        session: &AgentSession,
        phase: &str,
    ) -> Result<(), EngineError> {
        tracing::info!(
            session_id = %session.session_id,
            agent_id = %session.agent_id,
            phase,
            "Session reached terminal phase"
        );
        Ok(())
    }
}

/// 记录到的一次回调
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideEffectCall {
    Transition {
        session_id: String,
        from: String,
        to: String,
        command: String,
    },
    TerminalState {
        session_id: String,
        phase: String,
    },
}

/// 记录全部回调的测试替身；可配置为在 on_transition 时失败
#[derive(Debug, Default)]
pub struct RecordingSideEffects {
    calls: Mutex<Vec<SideEffectCall>>,
    fail_transitions: bool,
}

impl RecordingSideEffects {
    pub fn new() -> Self {
        Self::default()
    }

    /// on_transition 记录后返回 SideEffect 错误
    pub fn failing() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_transitions: true,
        }
    }

    pub async fn calls(&self) -> Vec<SideEffectCall> {
        self.calls.lock().await.clone()
    }

    pub async fn transition_count(&self) -> usize {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|c| matches!(c, SideEffectCall::Transition { .. }))
            .count()
    }

    pub async fn terminal_count(&self) -> usize {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|c| matches!(c, SideEffectCall::TerminalState { .. }))
            .count()
    }
}

#[async_trait]
impl SideEffects for RecordingSideEffects {
    async fn on_transition(
        &self,
        session: &AgentSession,
        from: &str,
        to: &str,
        command: &str,
    ) -> Result<(), EngineError> {
        self.calls.lock().await.push(SideEffectCall::Transition {
            session_id: session.session_id.clone(),
            from: from.to_string(),
            to: to.to_string(),
            command: command.to_string(),
        });
        if self.fail_transitions {
            return Err(EngineError::SideEffect(format!(
                "on_transition rejected {} -> {}",
                from, to
            )));
        }
        Ok(())
    }

    async fn on_terminal_state(
        &self,
        session: &AgentSession,
        phase: &str,
    ) -> Result<(), EngineError> {
        self.calls.lock().await.push(SideEffectCall::TerminalState {
            session_id: session.session_id.clone(),
            phase: phase.to_string(),
        });
        Ok(())
    }
}
