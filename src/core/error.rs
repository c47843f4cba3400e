//! 错误类型：引擎 / 协议 / 编排 actor / 注册表
//!
//! 每个错误都带机器可读的 `code()` 与结构化字段（id、阶段、命令），不在内部重试，由调用方决定策略。

use std::time::Duration;

use thiserror::Error;

/// 状态机定义校验错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("definition id is empty")]
    EmptyId,

    #[error("initial phase is empty")]
    EmptyInitialPhase,

    #[error("duplicate transition from '{from}' on command '{command}'")]
    DuplicateTransition { from: String, command: String },
}

/// 转移引擎及其协作者（会话存储、定义存储、副作用端口）的错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("State machine definition not found: {fsm_id}")]
    DefinitionNotFound { fsm_id: String },

    /// 当前阶段没有匹配该命令的转移
    #[error("Invalid transition: no transition from phase '{phase}' on command '{command}'")]
    InvalidTransition { phase: String, command: String },

    /// 乐观并发：存储中的版本与提交的版本不一致
    #[error("Version conflict on session {session_id}: expected {expected}, found {actual}")]
    VersionConflict {
        session_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("Record already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid definition: {0}")]
    InvalidDefinition(#[from] DefinitionError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Side effect failed: {0}")]
    SideEffect(String),
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::SessionNotFound { .. } => "session_not_found",
            EngineError::DefinitionNotFound { .. } => "definition_not_found",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::VersionConflict { .. } => "version_conflict",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::InvalidDefinition(_) => "invalid_definition",
            EngineError::Storage(_) => "storage_error",
            EngineError::SideEffect(_) => "side_effect_failed",
        }
    }

    /// 是否属于客户端输入错误（上层映射为 4xx）
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            EngineError::SessionNotFound { .. }
                | EngineError::DefinitionNotFound { .. }
                | EngineError::InvalidTransition { .. }
                | EngineError::AlreadyExists(_)
                | EngineError::InvalidDefinition(_)
        )
    }

    /// 结构化诊断数据（随 error 信封下发）
    pub fn details(&self) -> serde_json::Value {
        match self {
            EngineError::SessionNotFound { session_id } => {
                serde_json::json!({ "session_id": session_id })
            }
            EngineError::DefinitionNotFound { fsm_id } => serde_json::json!({ "fsm_id": fsm_id }),
            EngineError::InvalidTransition { phase, command } => {
                serde_json::json!({ "phase": phase, "command": command })
            }
            EngineError::VersionConflict {
                session_id,
                expected,
                actual,
            } => serde_json::json!({
                "session_id": session_id,
                "expected": expected,
                "actual": actual,
            }),
            other => serde_json::json!({ "reason": other.to_string() }),
        }
    }
}

#[cfg(feature = "async-sqlite")]
impl From<sqlx::Error> for EngineError {
    fn from(e: sqlx::Error) -> Self {
        EngineError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Storage(format!("serialization: {}", e))
    }
}

/// 协议信封层错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// 闭合集合之外的 kind：属于服务端 bug 信号，而非客户端输入错误
    #[error("Unknown envelope kind: {kind}")]
    UnknownEnvelopeKind { kind: String },

    #[error("Invalid payload for kind '{kind}': {reason}")]
    InvalidPayload { kind: String, reason: String },

    #[error("Malformed envelope: {0}")]
    Malformed(String),

    /// 客户端发送了只应由 agent 侧产生的 kind
    #[error("Unexpected envelope kind '{kind}' from {from}")]
    UnexpectedKind { kind: String, from: String },

    #[error("Handshake required before '{kind}'")]
    HandshakeRequired { kind: String },

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Handler failed: {0}")]
    Handler(String),
}

impl ProtocolError {
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::UnknownEnvelopeKind { .. } => "unknown_envelope_kind",
            ProtocolError::InvalidPayload { .. } => "invalid_payload",
            ProtocolError::Malformed(_) => "malformed_envelope",
            ProtocolError::UnexpectedKind { .. } => "unexpected_kind",
            ProtocolError::HandshakeRequired { .. } => "handshake_required",
            ProtocolError::UnknownCommand(_) => "unknown_command",
            ProtocolError::Handler(_) => "handler_failed",
        }
    }

    /// 结构化诊断数据（随 error 信封下发）
    pub fn details(&self) -> serde_json::Value {
        match self {
            ProtocolError::UnknownEnvelopeKind { kind } => serde_json::json!({ "kind": kind }),
            ProtocolError::InvalidPayload { kind, reason } => {
                serde_json::json!({ "kind": kind, "reason": reason })
            }
            ProtocolError::UnexpectedKind { kind, from } => {
                serde_json::json!({ "kind": kind, "from": from })
            }
            ProtocolError::HandshakeRequired { kind } => serde_json::json!({ "kind": kind }),
            ProtocolError::UnknownCommand(name) => serde_json::json!({ "command": name }),
            ProtocolError::Malformed(reason) | ProtocolError::Handler(reason) => {
                serde_json::json!({ "reason": reason })
            }
        }
    }
}

/// 编排 actor（意图识别、问候、总结、读数据）失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActorError {
    #[error("{0}")]
    Failed(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("stream interrupted: {0}")]
    Stream(String),
}

impl ActorError {
    pub fn failed(message: impl Into<String>) -> Self {
        ActorError::Failed(message.into())
    }
}

/// 编排注册表 / 句柄错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrchestrationError {
    #[error("Orchestration for conversation {0} has stopped")]
    Stopped(String),
}
