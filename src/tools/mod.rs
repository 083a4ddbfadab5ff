//! 工具层：注册表、参数 schema、调度池与内置工具

pub mod echo;
pub mod executor;
pub mod filesystem;
pub mod registry;
pub mod schema;

pub use echo::EchoTool;
pub use executor::{diagnostic_reason, tool_diagnostic, ToolDispatchPool, ToolResponse};
pub use filesystem::{ListFilesTool, ReadFileTool, SafeFs};
pub use registry::{Tool, ToolOutput, ToolRegistry, ToolSpec};
