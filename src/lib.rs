//! Agentflow - Rust 智能体会话编排引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、actor 取消监管
//! - **fsm**: 通用状态机定义、会话 / 定义存储、副作用端口、转移引擎
//! - **orchestration**: 可抢占的编排状态机（意图识别 → 生成 → 流式输出）及其运行时、注册表
//! - **protocol**: 十种信封、穷尽分发、JSON / SSE 编解码
//! - **gateway**: WebSocket 网关（feature `gateway`）
//! - **observability**: tracing 初始化

pub mod config;
pub mod core;
pub mod fsm;
#[cfg(feature = "gateway")]
pub mod gateway;
pub mod observability;
pub mod orchestration;
pub mod protocol;

pub use crate::core::{ActorError, EngineError, OrchestrationError, ProtocolError};
pub use fsm::TransitionEngine;
pub use orchestration::{OrchestrationRegistry, OrchestratorHandle};
pub use protocol::{Dispatcher, EnvelopeHandler, ProtocolEnvelope};
