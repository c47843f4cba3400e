//! 各阶段的 actor 端口
//!
//! 实现方自行负责超时；运行时只负责在抢占 / 停止时取消在途调用。

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::ActorError;
use crate::orchestration::events::TurnStream;
use crate::orchestration::state::{AgentContext, IntentClassification, RunningPhase};
use crate::protocol::ConversationMessage;

/// 加载会话历史
#[async_trait]
pub trait ContextLoader: Send + Sync {
    async fn load(&self, conversation_id: &str) -> Result<Vec<ConversationMessage>, ActorError>;
}

/// 识别意图
#[async_trait]
pub trait IntentClassifier: Send + Sync {
    async fn classify(&self, text: &str) -> Result<IntentClassification, ActorError>;
}

/// 生成一轮回复（greeting / summarizeIntent / readData 各一个）
#[async_trait]
pub trait TurnGenerator: Send + Sync {
    async fn generate(&self, context: &AgentContext) -> Result<TurnStream, ActorError>;
}

/// 一个编排实例用到的全部 actor
#[derive(Clone)]
pub struct PhaseActors {
    pub context_loader: Arc<dyn ContextLoader>,
    pub intent_classifier: Arc<dyn IntentClassifier>,
    pub greeting: Arc<dyn TurnGenerator>,
    pub summarizer: Arc<dyn TurnGenerator>,
    pub data_reader: Arc<dyn TurnGenerator>,
}

impl PhaseActors {
    /// 生成阶段对应的生成器；非生成阶段返回 None
    pub fn generator_for(&self, phase: RunningPhase) -> Option<Arc<dyn TurnGenerator>> {
        match phase {
            RunningPhase::Greeting => Some(self.greeting.clone()),
            RunningPhase::SummarizeIntent => Some(self.summarizer.clone()),
            RunningPhase::ReadData => Some(self.data_reader.clone()),
            RunningPhase::DetectIntent | RunningPhase::Streaming => None,
        }
    }
}

/// 没有历史可加载
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyContextLoader;

#[async_trait]
impl ContextLoader for EmptyContextLoader {
    async fn load(&self, _conversation_id: &str) -> Result<Vec<ConversationMessage>, ActorError> {
        Ok(Vec::new())
    }
}
