//! DeepSeek API 客户端（OpenAI 兼容格式）
//!
//! DeepSeek 提供与 OpenAI 兼容的 chat completions 接口（含 function calling）。
//! - Base URL: https://api.deepseek.com
//! - 模型: deepseek-chat (常规对话), deepseek-reasoner (思考模式)

use crate::llm::OpenAiClient;

/// DeepSeek API 常量
pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const DEEPSEEK_CHAT: &str = "deepseek-chat";
pub const DEEPSEEK_REASONER: &str = "deepseek-reasoner";

/// 创建 DeepSeek 客户端
///
/// 优先使用调用方给定的 key，其次环境变量 `DEEPSEEK_API_KEY`、`OPENAI_API_KEY`。
pub fn create_deepseek_client(api_key: Option<&str>, request_timeout_secs: u64) -> OpenAiClient {
    let api_key = api_key
        .map(String::from)
        .or_else(|| std::env::var("DEEPSEEK_API_KEY").ok())
        .or_else(|| std::env::var("OPENAI_API_KEY").ok());
    OpenAiClient::new(
        Some(DEEPSEEK_BASE_URL),
        api_key.as_deref(),
        request_timeout_secs,
    )
}
