//! Agent 错误类型
//!
//! 工具层错误（参数缺失、未知工具）不会抛给调用方，而是转成 tool 消息回灌给模型自我修正；
//! Provider / Run 层错误对当前会话是终止性的，但由上层转成诊断性回复；只有回放解码、配置、IO 错误真正上抛。

use thiserror::Error;

use crate::llm::LlmError;

/// 编排过程中可能出现的错误
#[derive(Error, Debug)]
pub enum AgentError {
    /// Provider 传输层 / HTTP 错误或显式错误载荷
    #[error("Provider error: {0}")]
    Provider(#[from] LlmError),

    /// 参数载荷无法解析或缺少必填键（可恢复，回灌为 tool 消息）
    #[error("Tool argument error in {tool}: {reason}")]
    ToolArgument {
        tool: String,
        reason: String,
        /// 缺失的必填键（载荷无法解析时为空）
        missing: Vec<String>,
        /// 工具完整参数契约
        parameters: serde_json::Value,
    },

    /// 模型请求了注册表中不存在的工具（可恢复，回灌为 tool 消息）
    #[error("Unknown tool: {tool}")]
    UnknownTool { tool: String, available: Vec<String> },

    /// 工具自身执行失败（可恢复，回灌为 tool 消息）
    #[error("Tool {tool} failed: {reason}")]
    ToolFailed { tool: String, reason: String },

    /// Hosted run 进入 failed 或无法识别的终止状态
    #[error("Run failed ({status}): {message}")]
    RunFailed { status: String, message: String },

    /// 持久化的对话记录格式错误
    #[error("Replay decode error: {0}")]
    ReplayDecode(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Settings error: {0}")]
    Settings(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// 将终止性错误格式化为可直接作为 assistant 回复的诊断文本
    pub fn to_diagnostic(&self) -> String {
        match self {
            AgentError::Provider(e) => e.to_diagnostic(),
            AgentError::RunFailed { status, message } => {
                format!("The run ended with status `{status}`: {message}")
            }
            AgentError::Timeout(what) => format!("Gave up waiting: {what}"),
            AgentError::Cancelled => "The request was cancelled before an answer was produced.".to_string(),
            other => format!("Error: {other}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_diagnostic_carries_status_and_message() {
        let err = AgentError::from(LlmError::Api {
            status: Some(429),
            code: Some("rate_limit_exceeded".to_string()),
            message: "slow down".to_string(),
        });
        let text = err.to_diagnostic();
        assert!(text.contains("429"));
        assert!(text.contains("rate_limit_exceeded"));
        assert!(text.contains("slow down"));
    }

    #[test]
    fn test_run_failed_diagnostic() {
        let err = AgentError::RunFailed {
            status: "expired".to_string(),
            message: "run expired".to_string(),
        };
        assert!(err.to_diagnostic().contains("expired"));
    }
}
