//! OpenAI 兼容 Chat Completions 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；支持 DeepSeek、OpenAI、自建代理等。
//! 请求由转录格式 `StoredMessage`（role / content / tool_calls / tool_call_id / name）直接映射为
//! `CreateChatCompletionRequest`；工具调用参数保持原始字符串，不在此解析。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::chat::{CreateChatCompletionRequest, CreateChatCompletionResponse};
use async_openai::Client;
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::llm::{ChatProvider, ChatReply, ChatRequest, ChatResponse, LlmError, Usage};
use crate::memory::persistence::{encode_messages, StoredToolCall};
use crate::memory::ToolCallRequest;

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
    pub total_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
        self.total_tokens.fetch_add(prompt + completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
            self.total_tokens.load(Ordering::Relaxed),
        )
    }
}

/// OpenAI 兼容客户端：持有 async_openai Client，chat 时发送完整历史 + 工具 spec
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    /// 累计 token 使用统计
    pub usage: TokenUsage,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, api_key: Option<&str>, request_timeout_secs: u64) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new()
                .with_api_base(url.trim_end_matches('/'))
                .with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(request_timeout_secs.max(1)))
            .build()
            .unwrap_or_default();

        Self {
            client: Client::with_config(config).with_http_client(http),
            usage: TokenUsage::new(),
        }
    }

    /// 获取累计 token 使用统计
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }
}

/// 转录格式即线格式：整体映射为 async_openai 的请求类型；工具为空时不声明 tools
fn build_request(request: &ChatRequest) -> Result<CreateChatCompletionRequest, LlmError> {
    let mut body = json!({
        "model": request.model,
        "messages": encode_messages(&request.messages),
    });
    if !request.tools.is_empty() {
        body["tools"] = request
            .tools
            .iter()
            .map(|spec| json!({"type": "function", "function": spec}))
            .collect::<Vec<Value>>()
            .into();
    }
    if let Some(max_tokens) = request.max_tokens {
        body["max_tokens"] = max_tokens.into();
    }
    serde_json::from_value(body)
        .map_err(|e| LlmError::Decode(format!("request does not fit the chat completion schema: {e}")))
}

/// 解析 chat completion 响应：有 tool_calls 则为工具调用，否则为文本
fn parse_response(response: CreateChatCompletionResponse) -> Result<ChatResponse, LlmError> {
    let usage = response.usage.as_ref().map(|u| Usage {
        prompt_tokens: u.prompt_tokens as u64,
        completion_tokens: u.completion_tokens as u64,
    });
    let message = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::Decode("response has no choices".to_string()))?
        .message;

    // 工具调用按线格式取回，id / name / 原始 arguments 原样保留
    let calls: Vec<StoredToolCall> = match &message.tool_calls {
        Some(calls) => serde_json::to_value(calls)
            .and_then(serde_json::from_value)
            .map_err(|e| LlmError::Decode(format!("malformed tool_calls: {e}")))?,
        None => Vec::new(),
    };

    let reply = if calls.is_empty() {
        ChatReply::Text(message.content.unwrap_or_default())
    } else {
        ChatReply::ToolCalls(
            calls
                .into_iter()
                .map(|c| ToolCallRequest::new(c.id, c.function.name, c.function.arguments))
                .collect(),
        )
    };
    Ok(ChatResponse { reply, usage })
}

/// async_openai 错误映射：显式错误载荷保留 code / message，其余视为传输或解码失败
fn map_error(err: OpenAIError) -> LlmError {
    match err {
        OpenAIError::ApiError(api) => LlmError::Api {
            status: None,
            code: api
                .code
                .as_ref()
                .map(ToString::to_string)
                .or_else(|| api.r#type.clone()),
            message: api.message,
        },
        e @ OpenAIError::JSONDeserialize(..) => LlmError::Decode(e.to_string()),
        other => LlmError::Transport(other.to_string()),
    }
}

#[async_trait]
impl ChatProvider for OpenAiClient {
    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, LlmError> {
        let request = build_request(&request)?;
        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(map_error)?;

        let parsed = parse_response(response)?;
        if let Some(usage) = parsed.usage {
            self.usage.add(usage.prompt_tokens, usage.completion_tokens);
        }
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Message;
    use crate::tools::ToolSpec;

    fn response(message: Value) -> CreateChatCompletionResponse {
        serde_json::from_value(json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "created": 1700000000,
            "model": "deepseek-chat",
            "choices": [{"index": 0, "message": message, "finish_reason": "stop", "logprobs": null}],
            "usage": {"prompt_tokens": 5, "completion_tokens": 2, "total_tokens": 7}
        }))
        .unwrap()
    }

    #[test]
    fn test_parse_text_reply() {
        let resp = parse_response(response(json!({"role": "assistant", "content": "hello"}))).unwrap();
        assert_eq!(resp.reply, ChatReply::Text("hello".to_string()));
        assert_eq!(resp.usage.map(|u| u.total()), Some(7));
    }

    #[test]
    fn test_parse_tool_calls_keep_raw_arguments() {
        let resp = parse_response(response(json!({
            "role": "assistant",
            "content": null,
            "tool_calls": [{"id": "call_1", "type": "function",
                "function": {"name": "list_files", "arguments": "{\"path\": \".\"}"}}]
        })))
        .unwrap();
        assert_eq!(
            resp.reply,
            ChatReply::ToolCalls(vec![ToolCallRequest::new(
                "call_1",
                "list_files",
                r#"{"path": "."}"#
            )])
        );
    }

    #[test]
    fn test_request_carries_tool_turns() {
        let messages = vec![
            Message::system("be brief"),
            Message::user("hi"),
            Message::tool_calls(vec![ToolCallRequest::new("c1", "echo", "{}")]),
            Message::tool("c1", "echo", "done"),
        ];
        let spec = ToolSpec {
            name: "echo".to_string(),
            description: "echo".to_string(),
            parameters: json!({"type": "object"}),
        };
        let request = build_request(&ChatRequest {
            model: "m".to_string(),
            messages,
            tools: vec![spec],
            max_tokens: None,
        })
        .unwrap();
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["model"], "m");
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][2]["tool_calls"][0]["id"], "c1");
        assert_eq!(json["messages"][2]["tool_calls"][0]["function"]["arguments"], "{}");
        assert_eq!(json["messages"][3]["tool_call_id"], "c1");
        assert_eq!(json["tools"][0]["function"]["name"], "echo");
    }

    #[test]
    fn test_request_without_tools_declares_none() {
        let request = build_request(&ChatRequest {
            model: "m".to_string(),
            messages: vec![Message::system("s"), Message::user("answer now")],
            tools: Vec::new(),
            max_tokens: None,
        })
        .unwrap();
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("tools").map(Value::is_null).unwrap_or(true));
    }
}
