//! 协议信封定义
//!
//! 线上格式：`{id, kind, payload, from, to}`。`kind` 与 `payload` 形状一一对应，
//! 在类型上由 [`Payload`] 枚举保证，`kind` 总是从载荷推导，不能单独设置。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::ProtocolError;

/// 当前协议版本（握手时下发）
pub const PROTOCOL_VERSION: &str = "1";

/// 信封类型（闭合集合）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    Handshake,
    Message,
    Chunk,
    Reasoning,
    Tool,
    Status,
    Heartbeat,
    Command,
    Error,
    Usage,
}

impl EnvelopeKind {
    pub const ALL: [EnvelopeKind; 10] = [
        EnvelopeKind::Handshake,
        EnvelopeKind::Message,
        EnvelopeKind::Chunk,
        EnvelopeKind::Reasoning,
        EnvelopeKind::Tool,
        EnvelopeKind::Status,
        EnvelopeKind::Heartbeat,
        EnvelopeKind::Command,
        EnvelopeKind::Error,
        EnvelopeKind::Usage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeKind::Handshake => "handshake",
            EnvelopeKind::Message => "message",
            EnvelopeKind::Chunk => "chunk",
            EnvelopeKind::Reasoning => "reasoning",
            EnvelopeKind::Tool => "tool",
            EnvelopeKind::Status => "status",
            EnvelopeKind::Heartbeat => "heartbeat",
            EnvelopeKind::Command => "command",
            EnvelopeKind::Error => "error",
            EnvelopeKind::Usage => "usage",
        }
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnvelopeKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EnvelopeKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownEnvelopeKind {
                kind: s.to_string(),
            })
    }
}

/// 对话消息角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// 单条对话消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ConversationMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// 握手：客户端声明要绑定的会话，服务端回传协议版本与能力
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakePayload {
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

/// 用户消息（可附带之前的历史）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<ConversationMessage>,
}

/// 流式回复片段
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPayload {
    pub content: String,
    pub sequence: u64,
    /// 本轮流的最后一个片段
    #[serde(default)]
    pub last: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasoningPayload {
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Started,
    Completed,
    Failed,
}

/// 工具调用进度
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolPayload {
    pub call_id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
    pub status: ToolStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
}

/// 状态更新（编排状态路径或会话阶段）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusPayload {
    pub state: String,
    #[serde(default)]
    pub terminal: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    /// 毫秒时间戳
    pub timestamp: i64,
}

/// 客户端命令
///
/// 带 `session_id` 时作用于转移引擎（`name` 即命令 id）；否则作用于编排状态机（stop / finish_stream）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandPayload {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl From<&ProtocolError> for ErrorPayload {
    fn from(e: &ProtocolError) -> Self {
        Self {
            code: e.code().to_string(),
            message: e.to_string(),
            details: Some(e.details()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsagePayload {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// 信封载荷：每种 kind 恰好一种形状
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Handshake(HandshakePayload),
    Message(MessagePayload),
    Chunk(ChunkPayload),
    Reasoning(ReasoningPayload),
    Tool(ToolPayload),
    Status(StatusPayload),
    Heartbeat(HeartbeatPayload),
    Command(CommandPayload),
    Error(ErrorPayload),
    Usage(UsagePayload),
}

impl Payload {
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Payload::Handshake(_) => EnvelopeKind::Handshake,
            Payload::Message(_) => EnvelopeKind::Message,
            Payload::Chunk(_) => EnvelopeKind::Chunk,
            Payload::Reasoning(_) => EnvelopeKind::Reasoning,
            Payload::Tool(_) => EnvelopeKind::Tool,
            Payload::Status(_) => EnvelopeKind::Status,
            Payload::Heartbeat(_) => EnvelopeKind::Heartbeat,
            Payload::Command(_) => EnvelopeKind::Command,
            Payload::Error(_) => EnvelopeKind::Error,
            Payload::Usage(_) => EnvelopeKind::Usage,
        }
    }

    /// 按 kind 解析载荷
    pub fn from_value(kind: EnvelopeKind, value: serde_json::Value) -> Result<Self, ProtocolError> {
        fn parse<T: serde::de::DeserializeOwned>(
            kind: EnvelopeKind,
            value: serde_json::Value,
        ) -> Result<T, ProtocolError> {
            serde_json::from_value(value).map_err(|e| ProtocolError::InvalidPayload {
                kind: kind.to_string(),
                reason: e.to_string(),
            })
        }

        Ok(match kind {
            EnvelopeKind::Handshake => Payload::Handshake(parse(kind, value)?),
            EnvelopeKind::Message => Payload::Message(parse(kind, value)?),
            EnvelopeKind::Chunk => Payload::Chunk(parse(kind, value)?),
            EnvelopeKind::Reasoning => Payload::Reasoning(parse(kind, value)?),
            EnvelopeKind::Tool => Payload::Tool(parse(kind, value)?),
            EnvelopeKind::Status => Payload::Status(parse(kind, value)?),
            EnvelopeKind::Heartbeat => Payload::Heartbeat(parse(kind, value)?),
            EnvelopeKind::Command => Payload::Command(parse(kind, value)?),
            EnvelopeKind::Error => Payload::Error(parse(kind, value)?),
            EnvelopeKind::Usage => Payload::Usage(parse(kind, value)?),
        })
    }
}

/// 线上的原始信封：kind 尚未校验，payload 尚未按 kind 解析
#[derive(Debug, Deserialize)]
///
/// `id` / `from` / `to` 必填，缺失时整体解析失败；`kind` 缺失按未知 kind 处理。
pub struct RawEnvelope {
    pub id: String,
    #[serde(default)]
    pub kind: serde_json::Value,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub from: String,
    pub to: String,
}

/// 协议信封
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawEnvelope")]
pub struct ProtocolEnvelope {
    pub id: String,
    pub payload: Payload,
    pub from: String,
    pub to: String,
}

impl ProtocolEnvelope {
    pub fn new(from: impl Into<String>, to: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            payload,
            from: from.into(),
            to: to.into(),
        }
    }

    pub fn kind(&self) -> EnvelopeKind {
        self.payload.kind()
    }

    /// 回复：交换 from / to
    pub fn reply(&self, payload: Payload) -> Self {
        Self::new(self.to.clone(), self.from.clone(), payload)
    }

    pub fn error(
        from: impl Into<String>,
        to: impl Into<String>,
        code: &str,
        message: &str,
    ) -> Self {
        Self::new(
            from,
            to,
            Payload::Error(ErrorPayload {
                code: code.to_string(),
                message: message.to_string(),
                details: None,
            }),
        )
    }

    pub fn heartbeat(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::new(
            from,
            to,
            Payload::Heartbeat(HeartbeatPayload {
                timestamp: chrono::Utc::now().timestamp_millis(),
            }),
        )
    }
}

impl TryFrom<RawEnvelope> for ProtocolEnvelope {
    type Error = ProtocolError;

    fn try_from(raw: RawEnvelope) -> Result<Self, Self::Error> {
        let kind = match &raw.kind {
            serde_json::Value::String(s) => s.parse::<EnvelopeKind>()?,
            other => {
                return Err(ProtocolError::UnknownEnvelopeKind {
                    kind: other.to_string(),
                })
            }
        };
        let payload = Payload::from_value(kind, raw.payload)?;

        Ok(Self {
            id: raw.id,
            payload,
            from: raw.from,
            to: raw.to,
        })
    }
}

impl Serialize for ProtocolEnvelope {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;

        let mut s = serializer.serialize_struct("ProtocolEnvelope", 5)?;
        s.serialize_field("id", &self.id)?;
        s.serialize_field("kind", &self.kind())?;
        s.serialize_field("payload", &self.payload)?;
        s.serialize_field("from", &self.from)?;
        s.serialize_field("to", &self.to)?;
        s.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_strings() {
        for kind in EnvelopeKind::ALL {
            assert_eq!(kind.as_str().parse::<EnvelopeKind>().unwrap(), kind);
            assert_eq!(
                serde_json::to_value(kind).unwrap(),
                serde_json::json!(kind.as_str())
            );
        }
        assert!(matches!(
            "telemetry".parse::<EnvelopeKind>(),
            Err(ProtocolError::UnknownEnvelopeKind { kind }) if kind == "telemetry"
        ));
    }

    #[test]
    fn test_serialized_shape() {
        let env = ProtocolEnvelope::new(
            "agent",
            "client-1",
            Payload::Chunk(ChunkPayload {
                content: "hel".into(),
                sequence: 0,
                last: false,
            }),
        );
        let value = serde_json::to_value(&env).unwrap();

        assert_eq!(value["kind"], "chunk");
        assert_eq!(value["payload"]["content"], "hel");
        assert_eq!(value["from"], "agent");
        assert_eq!(value["to"], "client-1");
        assert_eq!(value["id"], env.id.as_str());
    }

    #[test]
    fn test_payload_must_match_kind() {
        let raw: RawEnvelope = serde_json::from_value(serde_json::json!({
            "id": "1",
            "kind": "usage",
            "payload": {"content": "not usage"},
            "from": "a",
            "to": "b"
        }))
        .unwrap();

        let err = ProtocolEnvelope::try_from(raw).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload { ref kind, .. } if kind == "usage"));
    }

    #[test]
    fn test_non_string_kind_is_unknown() {
        let raw: RawEnvelope = serde_json::from_value(serde_json::json!({
            "id": "1",
            "kind": 7,
            "payload": {},
            "from": "a",
            "to": "b"
        }))
        .unwrap();
        assert_eq!(
            ProtocolEnvelope::try_from(raw).unwrap_err().code(),
            "unknown_envelope_kind"
        );
    }

    #[test]
    fn test_reply_swaps_endpoints() {
        let env = ProtocolEnvelope::heartbeat("client", "agent");
        let reply = env.reply(Payload::Heartbeat(HeartbeatPayload { timestamp: 1 }));
        assert_eq!(reply.from, "agent");
        assert_eq!(reply.to, "client");
        assert_ne!(reply.id, env.id);
    }
}
