//! WebSocket 网关
//!
//! 每个连接是一个 [`EnvelopeHandler`](crate::protocol::EnvelopeHandler)：
//! - `handshake` 绑定会话（conversation）并回传协议版本与当前状态
//! - `message` 转为编排事件 USER_INPUT
//! - `command` 无 session_id 时作用于编排（stop / finish_stream / create_session），有则在转移引擎上 apply
//! - `heartbeat` 原样回送；agent 侧才会产生的 kind 被拒绝

mod connection;
mod hub;

use thiserror::Error;

pub use connection::ConnectionHandler;
pub use hub::Hub;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Invalid bind address: {0}")]
    InvalidAddress(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}
