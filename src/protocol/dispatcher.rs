//! 信封分发
//!
//! [`Dispatcher::handle`] 对 [`Payload`] 做穷尽匹配，把带类型的载荷交给 [`EnvelopeHandler`]
//! 的恰好一个方法。新增第十一种 kind 时，所有实现者都会在编译期报错。

use async_trait::async_trait;

use crate::core::ProtocolError;
use crate::protocol::codec;
use crate::protocol::envelope::{
    ChunkPayload, CommandPayload, ErrorPayload, EnvelopeKind, HandshakePayload, HeartbeatPayload,
    MessagePayload, Payload, ProtocolEnvelope, ReasoningPayload, StatusPayload, ToolPayload,
    UsagePayload,
};

/// 信封的路由信息（载荷之外的字段）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeMeta {
    pub id: String,
    pub kind: EnvelopeKind,
    pub from: String,
    pub to: String,
}

impl EnvelopeMeta {
    /// 构造发回给来源方的信封
    pub fn reply(&self, payload: Payload) -> ProtocolEnvelope {
        ProtocolEnvelope::new(self.to.clone(), self.from.clone(), payload)
    }
}

/// 处理结果：需要回发的信封
pub type HandlerResult = Result<Vec<ProtocolEnvelope>, ProtocolError>;

/// 每种 kind 一个方法
#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    async fn on_handshake(&self, meta: &EnvelopeMeta, payload: HandshakePayload) -> HandlerResult;

    async fn on_message(&self, meta: &EnvelopeMeta, payload: MessagePayload) -> HandlerResult;

    async fn on_chunk(&self, meta: &EnvelopeMeta, payload: ChunkPayload) -> HandlerResult;

    async fn on_reasoning(&self, meta: &EnvelopeMeta, payload: ReasoningPayload) -> HandlerResult;

    async fn on_tool(&self, meta: &EnvelopeMeta, payload: ToolPayload) -> HandlerResult;

    async fn on_status(&self, meta: &EnvelopeMeta, payload: StatusPayload) -> HandlerResult;

    async fn on_heartbeat(&self, meta: &EnvelopeMeta, payload: HeartbeatPayload) -> HandlerResult;

    async fn on_command(&self, meta: &EnvelopeMeta, payload: CommandPayload) -> HandlerResult;

    async fn on_error(&self, meta: &EnvelopeMeta, payload: ErrorPayload) -> HandlerResult;

    async fn on_usage(&self, meta: &EnvelopeMeta, payload: UsagePayload) -> HandlerResult;
}

pub struct Dispatcher<H> {
    handler: H,
}

impl<H: EnvelopeHandler> Dispatcher<H> {
    pub fn new(handler: H) -> Self {
        Self { handler }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub async fn handle(&self, envelope: ProtocolEnvelope) -> HandlerResult {
        let meta = EnvelopeMeta {
            kind: envelope.kind(),
            id: envelope.id,
            from: envelope.from,
            to: envelope.to,
        };
        tracing::trace!(
            id = %meta.id,
            kind = %meta.kind,
            from = %meta.from,
            "Dispatching envelope"
        );

        let h = &self.handler;
        match envelope.payload {
            Payload::Handshake(p) => h.on_handshake(&meta, p).await,
            Payload::Message(p) => h.on_message(&meta, p).await,
            Payload::Chunk(p) => h.on_chunk(&meta, p).await,
            Payload::Reasoning(p) => h.on_reasoning(&meta, p).await,
            Payload::Tool(p) => h.on_tool(&meta, p).await,
            Payload::Status(p) => h.on_status(&meta, p).await,
            Payload::Heartbeat(p) => h.on_heartbeat(&meta, p).await,
            Payload::Command(p) => h.on_command(&meta, p).await,
            Payload::Error(p) => h.on_error(&meta, p).await,
            Payload::Usage(p) => h.on_usage(&meta, p).await,
        }
    }

    /// 解码后分发；未知 kind 不会触达任何处理方法
    pub async fn handle_json(&self, raw: &str) -> HandlerResult {
        let envelope = codec::decode(raw).map_err(|e| {
            tracing::warn!(code = e.code(), error = %e, "Rejected inbound envelope");
            e
        })?;
        self.handle(envelope).await
    }
}
