//! 可观测性：tracing 日志初始化
//!
//! 日志写到 stderr，stdout 只输出对话内容；级别由 RUST_LOG 控制，默认 info。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init() {
    init_with_default("info");
}

/// RUST_LOG 未设置时使用 default_directive（如 "warn"、"waypoint=debug"）
pub fn init_with_default(default_directive: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
