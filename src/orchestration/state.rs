//! 编排状态与上下文

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::protocol::{ConversationMessage, ToolPayload, UsagePayload};

/// `running` 复合状态的子阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunningPhase {
    DetectIntent,
    Greeting,
    SummarizeIntent,
    ReadData,
    Streaming,
}

impl RunningPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunningPhase::DetectIntent => "detectIntent",
            RunningPhase::Greeting => "greeting",
            RunningPhase::SummarizeIntent => "summarizeIntent",
            RunningPhase::ReadData => "readData",
            RunningPhase::Streaming => "streaming",
        }
    }

    /// 是否是生成回复的阶段（greeting / summarizeIntent / readData）
    pub fn is_generator(&self) -> bool {
        matches!(
            self,
            RunningPhase::Greeting | RunningPhase::SummarizeIntent | RunningPhase::ReadData
        )
    }
}

/// 编排状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OrchestrationState {
    LoadContext,
    Idle,
    Running(RunningPhase),
    Stopped,
}

impl OrchestrationState {
    /// 状态路径，如 `running.detectIntent`
    pub fn path(&self) -> String {
        match self {
            OrchestrationState::LoadContext => "loadContext".to_string(),
            OrchestrationState::Idle => "idle".to_string(),
            OrchestrationState::Running(phase) => format!("running.{}", phase.as_str()),
            OrchestrationState::Stopped => "stopped".to_string(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrchestrationState::Stopped)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, OrchestrationState::Running(_))
    }
}

impl fmt::Display for OrchestrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

/// 意图分类守卫的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Greeting,
    ReadData,
    Other,
}

impl Intent {
    pub fn from_label(label: &str) -> Self {
        match label {
            "greeting" => Intent::Greeting,
            "read-data" => Intent::ReadData,
            _ => Intent::Other,
        }
    }

    pub fn target_phase(&self) -> RunningPhase {
        match self {
            Intent::Greeting => RunningPhase::Greeting,
            Intent::ReadData => RunningPhase::ReadData,
            Intent::Other => RunningPhase::SummarizeIntent,
        }
    }
}

/// 意图识别器输出
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentClassification {
    pub intent: String,
    pub complexity: String,
}

impl IntentClassification {
    pub fn new(intent: impl Into<String>, complexity: impl Into<String>) -> Self {
        Self {
            intent: intent.into(),
            complexity: complexity.into(),
        }
    }

    pub fn intent(&self) -> Intent {
        Intent::from_label(&self.intent)
    }
}

/// 一轮流式生成累积下来的结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamResult {
    /// 产生这轮流的阶段
    pub source: Option<RunningPhase>,
    pub text: String,
    pub reasoning: String,
    pub tool_calls: Vec<ToolPayload>,
    pub usage: Option<UsagePayload>,
    /// 流已自然结束（而非被抢占或失败）
    pub complete: bool,
}

/// 编排上下文
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentContext {
    pub conversation_id: String,
    /// 最近一条用户消息的文本
    pub input_message: String,
    pub previous_messages: Vec<ConversationMessage>,
    pub intent: Option<IntentClassification>,
    pub stream_result: Option<StreamResult>,
    /// 最近一次 actor 失败的可读描述
    pub error: Option<String>,
}

impl AgentContext {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            ..Default::default()
        }
    }
}

/// 对外可观察的快照
#[derive(Debug, Clone, PartialEq)]
pub struct StateSnapshot {
    pub state: OrchestrationState,
    pub context: AgentContext,
    pub generation: u64,
}
