//! 状态机类型定义
//!
//! 阶段 / 命令 / 转移、状态机定义（不可变、多会话共享）与 Agent 会话记录

use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::DefinitionError;

/// 阶段标识（状态机中的状态名）
pub type PhaseId = String;
/// 命令标识（触发转移的名字）
pub type CommandId = String;

/// 单条转移：`from` 阶段收到 `command` 后进入 `to`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransitionDefinition {
    pub from: PhaseId,
    pub command: CommandId,
    pub to: PhaseId,
}

impl TransitionDefinition {
    pub fn new(
        from: impl Into<PhaseId>,
        command: impl Into<CommandId>,
        to: impl Into<PhaseId>,
    ) -> Self {
        Self {
            from: from.into(),
            command: command.into(),
            to: to.into(),
        }
    }
}

/// 状态机定义
///
/// 创建后不可变，由引用它的 agent 类型持有，被多个会话共享。
/// `terminal_phases` 是集合，不要求从每个阶段都可达。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateMachineDefinition {
    pub id: String,
    pub name: String,
    pub initial_phase: PhaseId,
    #[serde(default)]
    pub terminal_phases: BTreeSet<PhaseId>,
    #[serde(default)]
    pub transitions: Vec<TransitionDefinition>,
}

impl StateMachineDefinition {
    /// 校验：id / 初始阶段非空，`(from, command)` 不重复
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.id.trim().is_empty() {
            return Err(DefinitionError::EmptyId);
        }
        if self.initial_phase.trim().is_empty() {
            return Err(DefinitionError::EmptyInitialPhase);
        }

        let mut seen = HashSet::new();
        for t in &self.transitions {
            if !seen.insert((t.from.as_str(), t.command.as_str())) {
                return Err(DefinitionError::DuplicateTransition {
                    from: t.from.clone(),
                    command: t.command.clone(),
                });
            }
        }
        Ok(())
    }

    /// 按列表顺序查找第一条匹配 `(phase, command)` 的转移
    pub fn find_transition(&self, phase: &str, command: &str) -> Option<&TransitionDefinition> {
        self.transitions
            .iter()
            .find(|t| t.from == phase && t.command == command)
    }

    pub fn is_terminal(&self, phase: &str) -> bool {
        self.terminal_phases.contains(phase)
    }

    /// 某阶段下可用的命令（按定义顺序）
    pub fn commands_from<'a>(&'a self, phase: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.transitions
            .iter()
            .filter(move |t| t.from == phase)
            .map(|t| t.command.as_str())
    }

}

/// Agent 会话记录
///
/// 每个对话 / 任务创建一次。转移引擎只改写 `phase`；`metadata`、`retry_count` 归调用方所有；
/// `version` 与时间戳由存储维护。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSession {
    pub session_id: String,
    pub agent_id: String,
    /// 外键：StateMachineDefinition.id
    pub fsm_id: String,
    pub phase: PhaseId,
    pub task_id: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// 乐观并发版本号，每次 update 成功后 +1
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentSession {
    pub fn new(
        agent_id: impl Into<String>,
        fsm_id: impl Into<String>,
        initial_phase: impl Into<PhaseId>,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id: format!("session_{}", uuid::Uuid::new_v4()),
            agent_id: agent_id.into(),
            fsm_id: fsm_id.into(),
            phase: initial_phase.into(),
            task_id: None,
            retry_count: 0,
            metadata: serde_json::Map::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Map<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// 仅替换阶段的副本，其他字段不变
    pub(crate) fn advanced_to(&self, phase: &str) -> Self {
        Self {
            phase: phase.to_string(),
            ..self.clone()
        }
    }
}

/// `apply` 的结果
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionResult {
    /// 已持久化的新会话
    pub session: AgentSession,
    /// 转移前的阶段
    pub previous_phase: PhaseId,
    pub is_terminal: bool,
}
