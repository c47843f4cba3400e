//! 协议信封层：十种 kind、穷尽分发、JSON / SSE 编解码

pub mod codec;
pub mod dispatcher;
pub mod envelope;

pub use codec::{decode, encode, to_sse_frame};
pub use dispatcher::{Dispatcher, EnvelopeHandler, EnvelopeMeta, HandlerResult};
pub use envelope::{
    ChunkPayload, CommandPayload, ConversationMessage, EnvelopeKind, ErrorPayload,
    HandshakePayload, HeartbeatPayload, MessagePayload, MessageRole, Payload, ProtocolEnvelope,
    ReasoningPayload, StatusPayload, ToolPayload, ToolStatus, UsagePayload, PROTOCOL_VERSION,
};
