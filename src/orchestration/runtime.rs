//! 编排运行时：每个会话一个 tokio 任务
//!
//! 任务持有 [`OrchestrationMachine`]，把外部事件与 actor 结果依次喂给它，再执行返回的 [`Effect`]。
//! actor 调用和流消费都在独立任务中进行，由 [`ActorSupervisor`] 的令牌控制取消。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::config::OrchestrationConfig;
use crate::core::{ActorError, ActorSupervisor, OrchestrationError};
use crate::orchestration::actors::PhaseActors;
use crate::orchestration::events::{
    ActorJob, Effect, MachineInput, OrchestrationEvent, TurnEvent, TurnStream,
};
use crate::orchestration::machine::OrchestrationMachine;
use crate::orchestration::state::{RunningPhase, StateSnapshot, StreamResult};
use crate::protocol::{ChunkPayload, Payload, ProtocolEnvelope, ReasoningPayload};

const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// 出站信封的 `from`
    pub agent_name: String,
    /// 广播缓冲，慢订阅者超出后丢失最旧的信封
    pub envelope_buffer: usize,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            agent_name: "agentflow".to_string(),
            envelope_buffer: 256,
        }
    }
}

impl From<&OrchestrationConfig> for OrchestratorOptions {
    fn from(config: &OrchestrationConfig) -> Self {
        Self {
            agent_name: config.agent_name.clone(),
            envelope_buffer: config.envelope_buffer.max(1),
        }
    }
}

/// 实例最近一次活跃的时间，句柄的所有克隆与运行任务共享
#[derive(Debug)]
struct Activity {
    started: Instant,
    /// 相对 `started` 的毫秒数
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = self.started.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(now, Ordering::Relaxed);
    }

    fn last_active(&self) -> Instant {
        self.started + Duration::from_millis(self.last_ms.load(Ordering::Relaxed))
    }
}

/// 编排实例句柄
#[derive(Clone)]
pub struct OrchestratorHandle {
    conversation_id: String,
    events: mpsc::Sender<OrchestrationEvent>,
    envelopes: broadcast::Sender<ProtocolEnvelope>,
    state: watch::Receiver<StateSnapshot>,
    activity: Arc<Activity>,
}

impl OrchestratorHandle {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub async fn send(&self, event: OrchestrationEvent) -> Result<(), OrchestrationError> {
        self.activity.touch();
        self.events
            .send(event)
            .await
            .map_err(|_| OrchestrationError::Stopped(self.conversation_id.clone()))
    }

    /// 订阅出站信封
    pub fn subscribe(&self) -> broadcast::Receiver<ProtocolEnvelope> {
        self.envelopes.subscribe()
    }

    pub fn state(&self) -> StateSnapshot {
        self.state.borrow().clone()
    }

    /// 标记为活跃（不发送事件）
    pub fn touch(&self) {
        self.activity.touch();
    }

    /// 最近一次入站事件、actor 结果或出站信封的时间
    pub fn last_active(&self) -> Instant {
        self.activity.last_active()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_active().elapsed()
    }

    /// 等待快照满足条件；实例退出且最后的快照仍不满足时返回 Stopped
    pub async fn wait_until(
        &self,
        predicate: impl FnMut(&StateSnapshot) -> bool,
    ) -> Result<StateSnapshot, OrchestrationError> {
        let mut rx = self.state.clone();
        rx.wait_for(predicate)
            .await
            .map(|snapshot| (*snapshot).clone())
            .map_err(|_| OrchestrationError::Stopped(self.conversation_id.clone()))
    }

    /// 运行任务已退出（STOP 或所有句柄都已释放）
    pub fn is_finished(&self) -> bool {
        self.events.is_closed()
    }
}

/// 启动编排实例
pub fn spawn(
    conversation_id: impl Into<String>,
    actors: PhaseActors,
    options: OrchestratorOptions,
) -> OrchestratorHandle {
    let conversation_id = conversation_id.into();
    let machine = OrchestrationMachine::new(conversation_id.clone());

    let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
    let (inputs_tx, inputs_rx) = mpsc::channel(EVENT_BUFFER);
    let (envelopes_tx, _) = broadcast::channel(options.envelope_buffer.max(1));
    let (state_tx, state_rx) = watch::channel(machine.snapshot());
    let activity = Arc::new(Activity::new());

    let orchestrator = Orchestrator {
        machine,
        actors,
        supervisor: ActorSupervisor::new(),
        events: events_rx,
        inputs: inputs_rx,
        inputs_tx,
        emitter: Emitter {
            tx: envelopes_tx.clone(),
            from: options.agent_name,
            to: conversation_id.clone(),
            activity: activity.clone(),
        },
        state: state_tx,
    };
    tokio::spawn(orchestrator.run());

    OrchestratorHandle {
        conversation_id,
        events: events_tx,
        envelopes: envelopes_tx,
        state: state_rx,
        activity,
    }
}

/// 出站信封发送端
#[derive(Clone)]
struct Emitter {
    tx: broadcast::Sender<ProtocolEnvelope>,
    from: String,
    to: String,
    activity: Arc<Activity>,
}

impl Emitter {
    fn emit(&self, payload: Payload) {
        self.activity.touch();
        // 没有订阅者时直接丢弃
        let _ = self
            .tx
            .send(ProtocolEnvelope::new(self.from.clone(), self.to.clone(), payload));
    }
}

struct Orchestrator {
    machine: OrchestrationMachine,
    actors: PhaseActors,
    supervisor: ActorSupervisor,
    events: mpsc::Receiver<OrchestrationEvent>,
    inputs: mpsc::Receiver<MachineInput>,
    inputs_tx: mpsc::Sender<MachineInput>,
    emitter: Emitter,
    state: watch::Sender<StateSnapshot>,
}

impl Orchestrator {
    async fn run(mut self) {
        let conversation_id = self.machine.context().conversation_id.clone();
        tracing::info!(conversation_id = %conversation_id, "Orchestrator started");

        let effects = self.machine.start();
        let mut finished = self.execute(effects);
        self.publish();

        while !finished {
            let input = tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => MachineInput::Event(event),
                    None => {
                        tracing::debug!(conversation_id = %conversation_id, "All handles dropped");
                        break;
                    }
                },
                Some(input) = self.inputs.recv() => input,
            };

            self.emitter.activity.touch();
            let effects = self.machine.handle(input);
            finished = self.execute(effects);
            self.publish();
        }

        self.supervisor.shutdown();
        tracing::info!(
            conversation_id = %conversation_id,
            state = %self.machine.state(),
            "Orchestrator exited"
        );
    }

    fn publish(&self) {
        self.state.send_replace(self.machine.snapshot());
    }

    /// 执行副作用；返回 true 表示应退出
    fn execute(&mut self, effects: Vec<Effect>) -> bool {
        let mut shutdown = false;
        for effect in effects {
            match effect {
                Effect::Invoke { generation, job } => {
                    let token = self.supervisor.fresh_token();
                    let actors = self.actors.clone();
                    let tx = self.inputs_tx.clone();
                    tokio::spawn(async move {
                        let input = tokio::select! {
                            biased;
                            _ = token.cancelled() => return,
                            input = run_job(&actors, generation, job) => input,
                        };
                        let _ = tx.send(input).await;
                    });
                }
                Effect::PumpStream {
                    generation,
                    source,
                    stream,
                } => {
                    let token = self.supervisor.fresh_token();
                    tokio::spawn(pump(
                        stream,
                        source,
                        generation,
                        self.emitter.clone(),
                        token,
                        self.inputs_tx.clone(),
                    ));
                }
                Effect::CancelInFlight => self.supervisor.cancel_in_flight(),
                Effect::Emit(payload) => self.emitter.emit(payload),
                Effect::Shutdown => shutdown = true,
            }
        }
        shutdown
    }
}

async fn run_job(actors: &PhaseActors, generation: u64, job: ActorJob) -> MachineInput {
    match job {
        ActorJob::LoadContext { conversation_id } => MachineInput::ContextLoaded {
            generation,
            result: actors.context_loader.load(&conversation_id).await,
        },
        ActorJob::DetectIntent { text } => MachineInput::IntentDetected {
            generation,
            result: actors.intent_classifier.classify(&text).await,
        },
        ActorJob::Generate { phase, context } => {
            let result = match actors.generator_for(phase) {
                Some(generator) => generator.generate(&context).await,
                None => Err(ActorError::failed(format!(
                    "no generator for phase {}",
                    phase.as_str()
                ))),
            };
            MachineInput::Generated {
                generation,
                phase,
                result,
            }
        }
    }
}

/// 消费生成器流：逐项转为信封并累积结果，最后发送 `Chunk { last: true }`
async fn pump(
    mut stream: TurnStream,
    source: RunningPhase,
    generation: u64,
    emitter: Emitter,
    token: CancellationToken,
    tx: mpsc::Sender<MachineInput>,
) {
    let mut result = StreamResult {
        source: Some(source),
        ..Default::default()
    };
    let mut sequence = 0u64;

    loop {
        let item = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            item = stream.next() => item,
        };

        match item {
            None => break,
            Some(Ok(TurnEvent::Text(text))) => {
                result.text.push_str(&text);
                emitter.emit(Payload::Chunk(ChunkPayload {
                    content: text,
                    sequence,
                    last: false,
                }));
                sequence += 1;
            }
            Some(Ok(TurnEvent::Reasoning(content))) => {
                result.reasoning.push_str(&content);
                emitter.emit(Payload::Reasoning(ReasoningPayload { content }));
            }
            Some(Ok(TurnEvent::Tool(tool))) => {
                result.tool_calls.push(tool.clone());
                emitter.emit(Payload::Tool(tool));
            }
            Some(Ok(TurnEvent::Usage(usage))) => {
                result.usage = Some(usage);
                emitter.emit(Payload::Usage(usage));
            }
            Some(Err(e)) => {
                let _ = tx
                    .send(MachineInput::StreamFinished {
                        generation,
                        result: Err(e),
                    })
                    .await;
                return;
            }
        }
    }

    emitter.emit(Payload::Chunk(ChunkPayload {
        content: String::new(),
        sequence,
        last: true,
    }));
    result.complete = true;
    let _ = tx
        .send(MachineInput::StreamFinished {
            generation,
            result: Ok(result),
        })
        .await;
}
