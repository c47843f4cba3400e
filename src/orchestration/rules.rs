//! 规则实现的 actor（不依赖模型）
//!
//! 关键词匹配识别意图，模板生成回复。网关未配置模型 actor 时使用。

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;

use crate::core::ActorError;
use crate::orchestration::actors::{
    EmptyContextLoader, IntentClassifier, PhaseActors, TurnGenerator,
};
use crate::orchestration::events::{TurnEvent, TurnStream};
use crate::orchestration::state::{AgentContext, IntentClassification, RunningPhase};
use crate::protocol::UsagePayload;

const GREETING_PREFIXES: &[&str] = &[
    "hi",
    "hello",
    "hey",
    "good morning",
    "good evening",
    "你好",
    "您好",
    "嗨",
    "早上好",
    "晚上好",
];

const READ_DATA_KEYWORDS: &[&str] = &[
    "读取", "查看", "查询", "数据", "列出", "show ", "list ", "read ", "fetch ", "data",
];

/// 超过该字符数视为复杂请求
const COMPLEX_INPUT_CHARS: usize = 80;

/// 关键词意图识别
#[derive(Debug, Default, Clone, Copy)]
pub struct KeywordIntentClassifier;

impl KeywordIntentClassifier {
    /// 快速规则匹配
    pub fn fast_match(&self, input: &str) -> &'static str {
        let input_lower = input.trim().to_lowercase();

        if GREETING_PREFIXES.iter().any(|p| input_lower.starts_with(p)) {
            return "greeting";
        }

        if READ_DATA_KEYWORDS.iter().any(|k| input_lower.contains(k)) {
            return "read-data";
        }

        "other"
    }
}

#[async_trait]
impl IntentClassifier for KeywordIntentClassifier {
    async fn classify(&self, text: &str) -> Result<IntentClassification, ActorError> {
        let complexity = if text.chars().count() > COMPLEX_INPUT_CHARS {
            "high"
        } else {
            "low"
        };
        Ok(IntentClassification::new(self.fast_match(text), complexity))
    }
}

/// 模板回复，按词切片后逐片流出
#[derive(Debug, Clone, Copy)]
pub struct TemplateGenerator {
    phase: RunningPhase,
}

impl TemplateGenerator {
    pub fn new(phase: RunningPhase) -> Self {
        Self { phase }
    }

    fn render(&self, context: &AgentContext) -> String {
        match self.phase {
            RunningPhase::Greeting => "Hello! How can I help you today?".to_string(),
            RunningPhase::ReadData => format!(
                "No data source is connected yet, so I cannot read: {}",
                context.input_message
            ),
            _ => {
                let complexity = context
                    .intent
                    .as_ref()
                    .map(|i| i.complexity.as_str())
                    .unwrap_or("low");
                format!(
                    "You asked ({} complexity, {} earlier messages): {}",
                    complexity,
                    context.previous_messages.len(),
                    context.input_message
                )
            }
        }
    }
}

#[async_trait]
impl TurnGenerator for TemplateGenerator {
    async fn generate(&self, context: &AgentContext) -> Result<TurnStream, ActorError> {
        let text = self.render(context);
        let chunks: Vec<String> = text.split_inclusive(' ').map(str::to_string).collect();

        let prompt_tokens = context.input_message.split_whitespace().count() as u64;
        let completion_tokens = chunks.len() as u64;
        let usage = UsagePayload {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        };

        let events = chunks
            .into_iter()
            .map(TurnEvent::Text)
            .chain(std::iter::once(TurnEvent::Usage(usage)))
            .map(Ok);
        Ok(futures_util::stream::iter(events).boxed())
    }
}

/// 全部使用规则实现的 actor 组合
pub fn rule_based_actors() -> PhaseActors {
    PhaseActors {
        context_loader: Arc::new(EmptyContextLoader),
        intent_classifier: Arc::new(KeywordIntentClassifier),
        greeting: Arc::new(TemplateGenerator::new(RunningPhase::Greeting)),
        summarizer: Arc::new(TemplateGenerator::new(RunningPhase::SummarizeIntent)),
        data_reader: Arc::new(TemplateGenerator::new(RunningPhase::ReadData)),
    }
}
