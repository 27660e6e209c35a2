//! 核心层：错误类型、会话状态机状态、会话监管、工具并发调度

pub mod error;
pub mod session_supervisor;
pub mod state;
pub mod task_scheduler;

pub use error::{AgentError, ToolError};
pub use session_supervisor::SessionSupervisor;
pub use state::{ConversationState, NextAction};
pub use task_scheduler::TaskScheduler;
