//! 线上编解码：JSON 文本帧与 SSE 帧

use crate::core::ProtocolError;
use crate::protocol::envelope::{ProtocolEnvelope, RawEnvelope};

/// 序列化为 JSON 文本
pub fn encode(envelope: &ProtocolEnvelope) -> String {
    // 所有载荷都是普通结构体 + 字符串 kind，序列化不会失败
    serde_json::to_string(envelope).unwrap_or_else(|e| {
        tracing::error!(error = %e, "Envelope serialization failed");
        String::from("{}")
    })
}

/// 解析 JSON 文本
///
/// 先读原始结构再按 kind 解析载荷，以区分未知 kind 与载荷错误。
pub fn decode(raw: &str) -> Result<ProtocolEnvelope, ProtocolError> {
    let raw: RawEnvelope =
        serde_json::from_str(raw).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    ProtocolEnvelope::try_from(raw)
}

/// `event: <kind>\ndata: <json>\n\n`
pub fn to_sse_frame(envelope: &ProtocolEnvelope) -> String {
    format!("event: {}\ndata: {}\n\n", envelope.kind(), encode(envelope))
}
