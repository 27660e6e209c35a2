//! Waypoint - 可恢复的工具调用 Agent 循环
//!
//! 模块划分：
//! - **agent**: 操作面（send / replay / list_sessions / history / checkpoints）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 会话状态与状态机动作、错误类型、会话监管、工具并发调度
//! - **checkpoint**: 检查点存储（内存 / SQLite / PostgreSQL）
//! - **llm**: Model Gateway 抽象与实现（OpenAI / Azure OpenAI / Scripted）
//! - **memory**: 对话消息模型
//! - **react**: Agent 主循环（RunModel / RunTools / Done）与过程事件
//! - **session**: 会话管理、续接与回放
//! - **tools**: 工具注册表、执行器与内置工具

pub mod agent;
pub mod checkpoint;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod session;
pub mod tools;

pub use agent::{Agent, TurnOutcome};
pub use config::{load_config, AppConfig};
pub use core::{AgentError, ConversationState, NextAction};
