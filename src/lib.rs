//! Scout - 多轮研究型 Agent 编排引擎
//!
//! 模块划分：
//! - **agent**: Agent 门面（按配置选择 direct / hosted 协议，加载与保存对话）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、会话状态、设置存储
//! - **llm**: Provider 抽象与实现（OpenAI 兼容 / DeepSeek / Assistants / 脚本化 Mock）
//! - **memory**: 类型化消息与对话持久化 / 回放
//! - **observability**: 日志初始化
//! - **react**: Turn Engine 主循环、Planner 检查点、Hosted run 轮询、过程事件
//! - **tools**: 工具注册表、调度池与内置工具

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod tools;

pub use agent::{Agent, AskOptions};
