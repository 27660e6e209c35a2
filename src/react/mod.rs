//! 执行层：Agent 状态机主循环与过程事件

pub mod events;
pub mod loop_;

pub use events::AgentEvent;
pub use loop_::{AgentLoop, Checkpointer, DEFAULT_MAX_STEPS};
