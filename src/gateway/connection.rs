//! 单个客户端连接的信封处理
//!
//! 握手绑定会话后，编排实例的出站信封由转发任务推给客户端；客户端发来的信封经 [`Dispatcher`] 分到这里。

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::core::{EngineError, ProtocolError};
use crate::fsm::TransitionEngine;
use crate::orchestration::{OrchestrationEvent, OrchestrationRegistry, OrchestratorHandle};
use crate::protocol::{
    ChunkPayload, CommandPayload, ConversationMessage, EnvelopeHandler, EnvelopeMeta, ErrorPayload,
    HandlerResult, HandshakePayload, HeartbeatPayload, MessagePayload, Payload, ProtocolEnvelope,
    ReasoningPayload, StatusPayload, ToolPayload, UsagePayload, PROTOCOL_VERSION,
};

const CAPABILITIES: &[&str] = &["stream", "reasoning", "tool", "usage", "fsm"];

/// 已绑定的会话
struct Binding {
    handle: OrchestratorHandle,
    forwarder: JoinHandle<()>,
}

/// `create_session` 命令参数
#[derive(Debug, Deserialize)]
struct CreateSessionArgs {
    agent_id: String,
    fsm_id: String,
    #[serde(default)]
    task_id: Option<String>,
    #[serde(default)]
    metadata: serde_json::Map<String, serde_json::Value>,
}

pub struct ConnectionHandler {
    client_id: String,
    registry: Arc<OrchestrationRegistry>,
    engine: Arc<TransitionEngine>,
    outbound: mpsc::UnboundedSender<ProtocolEnvelope>,
    binding: Mutex<Option<Binding>>,
}

impl ConnectionHandler {
    pub fn new(
        client_id: impl Into<String>,
        registry: Arc<OrchestrationRegistry>,
        engine: Arc<TransitionEngine>,
        outbound: mpsc::UnboundedSender<ProtocolEnvelope>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            registry,
            engine,
            outbound,
            binding: Mutex::new(None),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub async fn conversation_id(&self) -> Option<String> {
        self.binding
            .lock()
            .await
            .as_ref()
            .map(|b| b.handle.conversation_id().to_string())
    }

    /// 连接断开：停止转发，会话实例留给注册表按闲置超时回收
    pub async fn unbind(&self) {
        if let Some(binding) = self.binding.lock().await.take() {
            binding.forwarder.abort();
        }
    }

    async fn bind(&self, conversation_id: &str) -> OrchestratorHandle {
        let handle = self.registry.get_or_spawn(conversation_id).await;
        let forwarder = spawn_forwarder(
            handle.subscribe(),
            self.outbound.clone(),
            self.client_id.clone(),
        );

        let previous = self.binding.lock().await.replace(Binding {
            handle: handle.clone(),
            forwarder,
        });
        if let Some(previous) = previous {
            previous.forwarder.abort();
        }
        handle
    }

    /// 当前绑定的实例；实例已退出（STOP / 被驱逐）时重新绑定
    async fn bound(&self, kind: &str) -> Result<OrchestratorHandle, ProtocolError> {
        let (handle, finished) = {
            let binding = self.binding.lock().await;
            let binding = binding.as_ref().ok_or_else(|| ProtocolError::HandshakeRequired {
                kind: kind.to_string(),
            })?;
            (binding.handle.clone(), binding.handle.is_finished())
        };

        if finished {
            tracing::debug!(
                client_id = %self.client_id,
                conversation_id = handle.conversation_id(),
                "Orchestration exited, rebinding"
            );
            return Ok(self.bind(handle.conversation_id()).await);
        }
        Ok(handle)
    }

    async fn send_event(&self, kind: &str, event: OrchestrationEvent) -> HandlerResult {
        let handle = self.bound(kind).await?;
        handle
            .send(event)
            .await
            .map_err(|e| ProtocolError::Handler(e.to_string()))?;
        Ok(Vec::new())
    }

    async fn apply_command(
        &self,
        meta: &EnvelopeMeta,
        session_id: &str,
        command: &str,
    ) -> HandlerResult {
        let reply = match self.engine.apply(session_id, command).await {
            Ok(result) => meta.reply(Payload::Status(StatusPayload {
                state: result.session.phase.clone(),
                terminal: result.is_terminal,
                detail: Some(format!("{} -> {}", result.previous_phase, result.session.phase)),
            })),
            Err(e) => meta.reply(engine_error(&e)),
        };
        Ok(vec![reply])
    }

    async fn create_session(
        &self,
        meta: &EnvelopeMeta,
        arguments: serde_json::Value,
    ) -> HandlerResult {
        let args: CreateSessionArgs =
            serde_json::from_value(arguments).map_err(|e| ProtocolError::InvalidPayload {
                kind: "command".to_string(),
                reason: format!("create_session: {}", e),
            })?;

        let reply = match self
            .engine
            .start_session(&args.agent_id, &args.fsm_id, args.task_id, args.metadata)
            .await
        {
            // detail 携带新会话 id，后续命令以它作为 session_id
            Ok(session) => meta.reply(Payload::Status(StatusPayload {
                state: session.phase,
                terminal: false,
                detail: Some(session.session_id),
            })),
            Err(e) => meta.reply(engine_error(&e)),
        };
        Ok(vec![reply])
    }

    fn unexpected(&self, meta: &EnvelopeMeta) -> HandlerResult {
        Err(ProtocolError::UnexpectedKind {
            kind: meta.kind.to_string(),
            from: meta.from.clone(),
        })
    }
}

fn engine_error(e: &EngineError) -> Payload {
    Payload::Error(ErrorPayload {
        code: e.code().to_string(),
        message: e.to_string(),
        details: Some(e.details()),
    })
}

/// 把编排实例的广播转给客户端
fn spawn_forwarder(
    mut rx: broadcast::Receiver<ProtocolEnvelope>,
    outbound: mpsc::UnboundedSender<ProtocolEnvelope>,
    client_id: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(envelope) => {
                    if outbound.send(envelope).is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        client_id = %client_id,
                        skipped,
                        "Client lagging, envelopes dropped"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[async_trait]
impl EnvelopeHandler for ConnectionHandler {
    async fn on_handshake(&self, meta: &EnvelopeMeta, payload: HandshakePayload) -> HandlerResult {
        if payload.protocol_version != PROTOCOL_VERSION {
            tracing::warn!(
                client_id = %self.client_id,
                client_version = %payload.protocol_version,
                "Protocol version mismatch"
            );
        }

        let conversation_id = payload
            .conversation_id
            .unwrap_or_else(|| format!("conv_{}", uuid::Uuid::new_v4()));
        let handle = self.bind(&conversation_id).await;
        tracing::info!(
            client_id = %self.client_id,
            conversation_id = %conversation_id,
            "Client bound"
        );

        let snapshot = handle.state();
        Ok(vec![
            meta.reply(Payload::Handshake(HandshakePayload {
                protocol_version: PROTOCOL_VERSION.to_string(),
                capabilities: CAPABILITIES.iter().map(|c| c.to_string()).collect(),
                conversation_id: Some(conversation_id),
            })),
            meta.reply(Payload::Status(StatusPayload {
                state: snapshot.state.path(),
                terminal: snapshot.state.is_terminal(),
                detail: None,
            })),
        ])
    }

    async fn on_message(&self, _meta: &EnvelopeMeta, payload: MessagePayload) -> HandlerResult {
        let mut messages = payload.history;
        messages.push(ConversationMessage {
            role: payload.role,
            content: payload.content,
        });
        self.send_event("message", OrchestrationEvent::UserInput { messages })
            .await
    }

    async fn on_chunk(&self, meta: &EnvelopeMeta, _payload: ChunkPayload) -> HandlerResult {
        self.unexpected(meta)
    }

    async fn on_reasoning(&self, meta: &EnvelopeMeta, _payload: ReasoningPayload) -> HandlerResult {
        self.unexpected(meta)
    }

    async fn on_tool(&self, meta: &EnvelopeMeta, _payload: ToolPayload) -> HandlerResult {
        self.unexpected(meta)
    }

    async fn on_status(&self, meta: &EnvelopeMeta, _payload: StatusPayload) -> HandlerResult {
        self.unexpected(meta)
    }

    async fn on_heartbeat(&self, meta: &EnvelopeMeta, payload: HeartbeatPayload) -> HandlerResult {
        // 连接仍在，绑定的实例不算闲置
        if let Some(binding) = self.binding.lock().await.as_ref() {
            binding.handle.touch();
        }
        Ok(vec![meta.reply(Payload::Heartbeat(payload))])
    }

    async fn on_command(&self, meta: &EnvelopeMeta, payload: CommandPayload) -> HandlerResult {
        if let Some(session_id) = payload.session_id.as_deref() {
            return self.apply_command(meta, session_id, &payload.name).await;
        }

        match payload.name.as_str() {
            "create_session" => self.create_session(meta, payload.arguments).await,
            "stop" => self.send_event("command", OrchestrationEvent::Stop).await,
            "finish_stream" => {
                self.send_event("command", OrchestrationEvent::FinishStream)
                    .await
            }
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }

    async fn on_error(&self, meta: &EnvelopeMeta, payload: ErrorPayload) -> HandlerResult {
        tracing::warn!(
            client_id = %self.client_id,
            envelope_id = %meta.id,
            code = %payload.code,
            message = %payload.message,
            "Client reported error"
        );
        Ok(Vec::new())
    }

    async fn on_usage(&self, meta: &EnvelopeMeta, _payload: UsagePayload) -> HandlerResult {
        self.unexpected(meta)
    }
}
