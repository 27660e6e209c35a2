//! 工具层：Tool trait 与注册表、批量执行器、内置工具（计算器、当前时间）

pub mod calculator;
pub mod clock;
pub mod executor;
pub mod registry;
pub mod schema;

pub use calculator::CalculatorTool;
pub use clock::CurrentTimeTool;
pub use executor::{ToolExecutor, UnknownToolPolicy};
pub use registry::{RegistryError, Tool, ToolRegistry, ToolSpec};
pub use schema::parameters_schema;

/// 内置工具注册表：get_current_time_tool、calculator_tool
pub fn builtin_registry() -> Result<ToolRegistry, RegistryError> {
    let mut registry = ToolRegistry::new();
    registry.register(CurrentTimeTool)?;
    registry.register(CalculatorTool)?;
    Ok(registry)
}
