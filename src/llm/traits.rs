//! LLM 客户端抽象
//!
//! 直连协议（chat completion 循环）实现 ChatProvider：一次请求带完整历史（含 system prompt）与工具 spec，
//! 返回文本回复或一批工具调用。Hosted 协议见 `llm::assistants`。

use async_trait::async_trait;
use thiserror::Error;

use crate::memory::{Message, ToolCallRequest};
use crate::tools::ToolSpec;

/// Provider 层错误：传输失败、HTTP 非 2xx、显式错误载荷、响应解码失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("API error (status {status:?}, code {code:?}): {message}")]
    Api {
        status: Option<u16>,
        code: Option<String>,
        message: String,
    },

    #[error("decode error: {0}")]
    Decode(String),
}

impl LlmError {
    /// 格式化为 assistant 诊断回复（status / code / message）
    pub fn to_diagnostic(&self) -> String {
        match self {
            LlmError::Transport(reason) => {
                format!("The model provider could not be reached: {reason}")
            }
            LlmError::Api {
                status,
                code,
                message,
            } => {
                let status = status.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string());
                let code = code.as_deref().unwrap_or("-");
                format!("The model provider returned an error (status {status}, code {code}): {message}")
            }
            LlmError::Decode(reason) => {
                format!("The model provider sent a response that could not be understood: {reason}")
            }
        }
    }
}

/// 一次 turn 的请求
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    /// 完整历史；首条通常是 system prompt
    pub messages: Vec<Message>,
    /// 为空时不向 Provider 声明工具（模型只能文本回复）
    pub tools: Vec<ToolSpec>,
    pub max_tokens: Option<u32>,
}

/// 模型回复：文本或工具调用
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatReply {
    Text(String),
    ToolCalls(Vec<ToolCallRequest>),
}

/// 单次调用的 token 用量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub reply: ChatReply,
    pub usage: Option<Usage>,
}

impl ChatResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            reply: ChatReply::Text(text.into()),
            usage: None,
        }
    }

    pub fn tool_calls(calls: Vec<ToolCallRequest>) -> Self {
        Self {
            reply: ChatReply::ToolCalls(calls),
            usage: None,
        }
    }
}

/// 直连协议客户端
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, LlmError>;

    /// 累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
