//! 状态机的输入与输出
//!
//! 外部事件和 actor 完成结果都是 [`MachineInput`]；状态机只返回 [`Effect`]，由运行时执行。

use futures_util::stream::BoxStream;

use crate::core::ActorError;
use crate::orchestration::state::{AgentContext, IntentClassification, RunningPhase, StreamResult};
use crate::protocol::{ConversationMessage, Payload, ToolPayload, UsagePayload};

/// 外部事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestrationEvent {
    UserInput { messages: Vec<ConversationMessage> },
    Stop,
    FinishStream,
}

impl OrchestrationEvent {
    pub fn user_text(text: impl Into<String>) -> Self {
        OrchestrationEvent::UserInput {
            messages: vec![ConversationMessage::user(text)],
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            OrchestrationEvent::UserInput { .. } => "USER_INPUT",
            OrchestrationEvent::Stop => "STOP",
            OrchestrationEvent::FinishStream => "FINISH_STREAM",
        }
    }
}

/// 生成器流中的一项
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    Text(String),
    Reasoning(String),
    Tool(ToolPayload),
    Usage(UsagePayload),
}

pub type TurnStream = BoxStream<'static, Result<TurnEvent, ActorError>>;

/// 状态机输入
///
/// actor 结果带着发起时的 generation，不匹配即视为过期。
pub enum MachineInput {
    Event(OrchestrationEvent),
    ContextLoaded {
        generation: u64,
        result: Result<Vec<ConversationMessage>, ActorError>,
    },
    IntentDetected {
        generation: u64,
        result: Result<IntentClassification, ActorError>,
    },
    Generated {
        generation: u64,
        phase: RunningPhase,
        result: Result<TurnStream, ActorError>,
    },
    StreamFinished {
        generation: u64,
        result: Result<StreamResult, ActorError>,
    },
}

impl MachineInput {
    pub fn name(&self) -> &'static str {
        match self {
            MachineInput::Event(e) => e.name(),
            MachineInput::ContextLoaded { .. } => "context_loaded",
            MachineInput::IntentDetected { .. } => "intent_detected",
            MachineInput::Generated { .. } => "generated",
            MachineInput::StreamFinished { .. } => "stream_finished",
        }
    }
}

impl From<OrchestrationEvent> for MachineInput {
    fn from(event: OrchestrationEvent) -> Self {
        MachineInput::Event(event)
    }
}

/// 需要 actor 完成的工作
#[derive(Debug, Clone, PartialEq)]
pub enum ActorJob {
    LoadContext { conversation_id: String },
    DetectIntent { text: String },
    Generate {
        phase: RunningPhase,
        context: AgentContext,
    },
}

/// 状态机要求运行时执行的动作
pub enum Effect {
    /// 启动 actor，结果以 `generation` 回送
    Invoke { generation: u64, job: ActorJob },
    /// 消费生成器流，逐项转为信封，结束后回送 StreamFinished
    PumpStream {
        generation: u64,
        source: RunningPhase,
        stream: TurnStream,
    },
    /// 取消在途 actor / 流
    CancelInFlight,
    Emit(Payload),
    /// 进入终止状态，运行时退出
    Shutdown,
}

impl std::fmt::Debug for Effect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Effect::Invoke { generation, job } => f
                .debug_struct("Invoke")
                .field("generation", generation)
                .field("job", job)
                .finish(),
            Effect::PumpStream {
                generation, source, ..
            } => f
                .debug_struct("PumpStream")
                .field("generation", generation)
                .field("source", source)
                .finish_non_exhaustive(),
            Effect::CancelInFlight => f.write_str("CancelInFlight"),
            Effect::Emit(payload) => f.debug_tuple("Emit").field(payload).finish(),
            Effect::Shutdown => f.write_str("Shutdown"),
        }
    }
}
