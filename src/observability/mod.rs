//! 可观测性：tracing 订阅器初始化
//!
//! 日志级别由 `RUST_LOG` 控制，未设置或无法解析时使用 info。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // 测试或嵌入场景下可能已有全局订阅器
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}
