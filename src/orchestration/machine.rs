//! 编排状态机（纯 reducer）
//!
//! `handle(input) -> Vec<Effect>`：不做 I/O、不持有任务句柄，所有动作都以 [`Effect`] 交给运行时。
//!
//! 过期结果的判定：每次发起 actor 调用都会领取新的 generation，离开 `running` 时也会递增；
//! actor 结果的 generation 或期望状态不匹配时直接丢弃。

use crate::core::ActorError;
use crate::orchestration::events::{ActorJob, Effect, MachineInput, OrchestrationEvent};
use crate::orchestration::state::{
    AgentContext, IntentClassification, OrchestrationState, RunningPhase, StateSnapshot,
    StreamResult,
};
use crate::protocol::{ConversationMessage, ErrorPayload, Payload, StatusPayload};

pub struct OrchestrationMachine {
    state: OrchestrationState,
    context: AgentContext,
    generation: u64,
    /// loadContext 期间收到的输入，进入 idle 后重放
    pending_input: Option<Vec<ConversationMessage>>,
}

impl OrchestrationMachine {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            state: OrchestrationState::LoadContext,
            context: AgentContext::new(conversation_id),
            generation: 0,
            pending_input: None,
        }
    }

    /// 进入初始状态 loadContext
    pub fn start(&mut self) -> Vec<Effect> {
        let mut effects = vec![self.status()];
        let generation = self.next_generation();
        effects.push(Effect::Invoke {
            generation,
            job: ActorJob::LoadContext {
                conversation_id: self.context.conversation_id.clone(),
            },
        });
        effects
    }

    pub fn state(&self) -> OrchestrationState {
        self.state
    }

    pub fn context(&self) -> &AgentContext {
        &self.context
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            state: self.state,
            context: self.context.clone(),
            generation: self.generation,
        }
    }

    pub fn handle(&mut self, input: MachineInput) -> Vec<Effect> {
        if self.state.is_terminal() {
            tracing::debug!(
                conversation_id = %self.context.conversation_id,
                input = input.name(),
                "Orchestration stopped, input ignored"
            );
            return Vec::new();
        }

        match input {
            MachineInput::Event(event) => self.on_event(event),
            MachineInput::ContextLoaded { generation, result } => {
                if !self.is_current(generation, OrchestrationState::LoadContext) {
                    return Vec::new();
                }
                self.on_context_loaded(result)
            }
            MachineInput::IntentDetected { generation, result } => {
                if !self.is_current(
                    generation,
                    OrchestrationState::Running(RunningPhase::DetectIntent),
                ) {
                    return Vec::new();
                }
                self.on_intent_detected(result)
            }
            MachineInput::Generated {
                generation,
                phase,
                result,
            } => {
                if !self.is_current(generation, OrchestrationState::Running(phase)) {
                    return Vec::new();
                }
                match result {
                    Ok(stream) => {
                        self.context.stream_result = Some(StreamResult {
                            source: Some(phase),
                            ..Default::default()
                        });
                        let mut effects =
                            self.enter(OrchestrationState::Running(RunningPhase::Streaming));
                        let generation = self.next_generation();
                        effects.push(Effect::PumpStream {
                            generation,
                            source: phase,
                            stream,
                        });
                        effects
                    }
                    Err(e) => self.fail(e),
                }
            }
            MachineInput::StreamFinished { generation, result } => {
                if !self.is_current(
                    generation,
                    OrchestrationState::Running(RunningPhase::Streaming),
                ) {
                    return Vec::new();
                }
                match result {
                    // 留在 streaming，等待 FINISH_STREAM
                    Ok(stream_result) => {
                        self.context.stream_result = Some(stream_result);
                        Vec::new()
                    }
                    Err(e) => self.fail(e),
                }
            }
        }
    }

    fn on_event(&mut self, event: OrchestrationEvent) -> Vec<Effect> {
        match event {
            OrchestrationEvent::UserInput { messages } => {
                if messages.last().map_or(true, |m| m.content.trim().is_empty()) {
                    tracing::debug!(
                        conversation_id = %self.context.conversation_id,
                        "Empty user input ignored"
                    );
                    return Vec::new();
                }

                match self.state {
                    OrchestrationState::LoadContext => {
                        self.pending_input = Some(messages);
                        Vec::new()
                    }
                    OrchestrationState::Idle => {
                        self.apply_input(messages);
                        self.detect_intent()
                    }
                    OrchestrationState::Running(phase) => {
                        tracing::info!(
                            conversation_id = %self.context.conversation_id,
                            preempted = phase.as_str(),
                            "User input preempts running turn"
                        );
                        self.generation += 1;
                        let mut effects = vec![Effect::CancelInFlight];
                        self.apply_input(messages);
                        effects.extend(self.detect_intent());
                        effects
                    }
                    OrchestrationState::Stopped => Vec::new(),
                }
            }
            OrchestrationEvent::Stop => {
                self.generation += 1;
                self.pending_input = None;
                let mut effects = vec![Effect::CancelInFlight];
                effects.extend(self.enter(OrchestrationState::Stopped));
                effects.push(Effect::Shutdown);
                effects
            }
            OrchestrationEvent::FinishStream => {
                if self.state != OrchestrationState::Running(RunningPhase::Streaming) {
                    tracing::debug!(
                        conversation_id = %self.context.conversation_id,
                        state = %self.state,
                        "FINISH_STREAM outside streaming ignored"
                    );
                    return Vec::new();
                }
                self.generation += 1;
                let mut effects = vec![Effect::CancelInFlight];
                effects.extend(self.enter(OrchestrationState::Idle));
                effects
            }
        }
    }

    fn on_context_loaded(
        &mut self,
        result: Result<Vec<ConversationMessage>, ActorError>,
    ) -> Vec<Effect> {
        match result {
            Ok(messages) => self.context.previous_messages = messages,
            Err(e) => {
                // 加载失败不阻塞对话，以空历史继续
                tracing::warn!(
                    conversation_id = %self.context.conversation_id,
                    error = %e,
                    "Context load failed, continuing with empty history"
                );
            }
        }

        let mut effects = self.enter(OrchestrationState::Idle);
        if let Some(messages) = self.pending_input.take() {
            self.apply_input(messages);
            effects.extend(self.detect_intent());
        }
        effects
    }

    fn on_intent_detected(
        &mut self,
        result: Result<IntentClassification, ActorError>,
    ) -> Vec<Effect> {
        let classification = match result {
            Ok(c) => c,
            Err(e) => return self.fail(e),
        };

        let phase = classification.intent().target_phase();
        tracing::debug!(
            conversation_id = %self.context.conversation_id,
            intent = %classification.intent,
            complexity = %classification.complexity,
            phase = phase.as_str(),
            "Intent detected"
        );
        self.context.intent = Some(classification);

        let mut effects = self.enter(OrchestrationState::Running(phase));
        let generation = self.next_generation();
        effects.push(Effect::Invoke {
            generation,
            job: ActorJob::Generate {
                phase,
                context: self.context.clone(),
            },
        });
        effects
    }

    /// 记录输入：最后一条为当前输入，其余（若有）覆盖历史
    fn apply_input(&mut self, mut messages: Vec<ConversationMessage>) {
        if let Some(last) = messages.pop() {
            self.context.input_message = last.content;
        }
        if !messages.is_empty() {
            self.context.previous_messages = messages;
        }
        self.context.intent = None;
        self.context.stream_result = None;
        self.context.error = None;
    }

    fn detect_intent(&mut self) -> Vec<Effect> {
        let mut effects = self.enter(OrchestrationState::Running(RunningPhase::DetectIntent));
        let generation = self.next_generation();
        effects.push(Effect::Invoke {
            generation,
            job: ActorJob::DetectIntent {
                text: self.context.input_message.clone(),
            },
        });
        effects
    }

    /// actor 失败：记录错误并回到 idle（从不进入 stopped）
    fn fail(&mut self, error: ActorError) -> Vec<Effect> {
        let failed_in = self.state.path();
        let message = format!("{} failed: {}", failed_in, error);
        tracing::warn!(
            conversation_id = %self.context.conversation_id,
            state = %failed_in,
            error = %error,
            "Actor failed"
        );
        self.context.error = Some(message.clone());
        self.generation += 1;

        let mut effects = vec![Effect::Emit(Payload::Error(ErrorPayload {
            code: "actor_failed".to_string(),
            message,
            details: Some(serde_json::json!({ "state": failed_in })),
        }))];
        effects.extend(self.enter(OrchestrationState::Idle));
        effects
    }

    fn enter(&mut self, state: OrchestrationState) -> Vec<Effect> {
        tracing::debug!(
            conversation_id = %self.context.conversation_id,
            from = %self.state,
            to = %state,
            "Orchestration state changed"
        );
        self.state = state;
        vec![self.status()]
    }

    fn status(&self) -> Effect {
        Effect::Emit(Payload::Status(StatusPayload {
            state: self.state.path(),
            terminal: self.state.is_terminal(),
            detail: None,
        }))
    }

    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    fn is_current(&self, generation: u64, expected: OrchestrationState) -> bool {
        let current = generation == self.generation && self.state == expected;
        if !current {
            tracing::debug!(
                conversation_id = %self.context.conversation_id,
                generation,
                current_generation = self.generation,
                state = %self.state,
                "Stale actor result dropped"
            );
        }
        current
    }
}
