//! Hosted 协议（thread / run）客户端
//!
//! 与直连循环不同，对话状态托管在 Provider 侧：创建 thread、追加用户消息、创建 run，
//! 之后轮询 run 状态；requires_action 时提交工具输出；completed 时拉取 thread 消息。
//! AssistantsClient 通过 reqwest 对接 OpenAI Assistants v2 REST 接口。

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::llm::openai::OPENAI_BASE_URL;
use crate::llm::LlmError;
use crate::memory::persistence::StoredToolCall;
use crate::memory::ToolCallRequest;

/// Run 状态；其它任何状态（cancelled / expired / incomplete ...）归入 Unrecognized，视为终止错误
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    Queued,
    InProgress,
    RequiresAction,
    Completed,
    Failed,
    Unrecognized(String),
}

impl RunState {
    pub fn parse(status: &str) -> Self {
        match status {
            "queued" => RunState::Queued,
            "in_progress" => RunState::InProgress,
            "requires_action" => RunState::RequiresAction,
            "completed" => RunState::Completed,
            "failed" => RunState::Failed,
            other => RunState::Unrecognized(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            RunState::Queued => "queued",
            RunState::InProgress => "in_progress",
            RunState::RequiresAction => "requires_action",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
            RunState::Unrecognized(s) => s,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一次轮询得到的 run 快照
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunStatus {
    pub state: RunState,
    /// requires_action 时内嵌的一批工具调用
    pub required_calls: Vec<ToolCallRequest>,
    /// failed 时 Provider 给出的错误（code: message）
    pub last_error: Option<String>,
}

impl RunStatus {
    pub fn new(state: RunState) -> Self {
        Self {
            state,
            required_calls: Vec::new(),
            last_error: None,
        }
    }

    pub fn requires_action(calls: Vec<ToolCallRequest>) -> Self {
        Self {
            state: RunState::RequiresAction,
            required_calls: calls,
            last_error: None,
        }
    }
}

/// 提交给 run 的单个工具输出
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolOutputSubmission {
    pub tool_call_id: String,
    pub output: String,
}

/// thread 中的一条消息（只取文本部分）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadMessage {
    pub role: String,
    pub text: String,
}

/// Hosted 协议
#[async_trait]
pub trait HostedProvider: Send + Sync {
    async fn create_thread(&self) -> Result<String, LlmError>;

    async fn add_user_message(&self, thread_id: &str, text: &str) -> Result<(), LlmError>;

    async fn create_run(&self, thread_id: &str, assistant_id: &str) -> Result<String, LlmError>;

    async fn poll_run(&self, thread_id: &str, run_id: &str) -> Result<RunStatus, LlmError>;

    async fn submit_tool_outputs(
        &self,
        thread_id: &str,
        run_id: &str,
        outputs: Vec<ToolOutputSubmission>,
    ) -> Result<(), LlmError>;

    /// 按时间正序返回 thread 全部消息
    async fn list_messages(&self, thread_id: &str) -> Result<Vec<ThreadMessage>, LlmError>;
}

#[derive(Debug, Deserialize)]
struct IdObject {
    id: String,
}

#[derive(Debug, Deserialize)]
struct WireRun {
    status: String,
    required_action: Option<WireRequiredAction>,
    last_error: Option<WireLastError>,
}

#[derive(Debug, Deserialize)]
struct WireRequiredAction {
    submit_tool_outputs: Option<WireSubmitToolOutputs>,
}

#[derive(Debug, Deserialize)]
struct WireSubmitToolOutputs {
    #[serde(default)]
    tool_calls: Vec<StoredToolCall>,
}

#[derive(Debug, Deserialize)]
struct WireLastError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// 分页列表：has_more 时以 last_id 作为下一页的 after 游标
#[derive(Debug, Deserialize)]
struct WireMessageList {
    #[serde(default)]
    data: Vec<WireThreadMessage>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    last_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireThreadMessage {
    role: String,
    #[serde(default)]
    content: Vec<WireContentPart>,
}

#[derive(Debug, Deserialize)]
struct WireContentPart {
    #[serde(rename = "type")]
    kind: String,
    text: Option<WireText>,
}

#[derive(Debug, Deserialize)]
struct WireText {
    value: String,
}

impl From<WireRun> for RunStatus {
    fn from(run: WireRun) -> Self {
        let required_calls = run
            .required_action
            .and_then(|a| a.submit_tool_outputs)
            .map(|s| {
                s.tool_calls
                    .into_iter()
                    .map(|c| ToolCallRequest::new(c.id, c.function.name, c.function.arguments))
                    .collect()
            })
            .unwrap_or_default();
        let last_error = run.last_error.map(|e| {
            format!(
                "{}: {}",
                e.code.unwrap_or_else(|| "error".to_string()),
                e.message.unwrap_or_default()
            )
        });
        RunStatus {
            state: RunState::parse(&run.status),
            required_calls,
            last_error,
        }
    }
}

impl From<WireThreadMessage> for ThreadMessage {
    fn from(m: WireThreadMessage) -> Self {
        let text = m
            .content
            .into_iter()
            .filter(|p| p.kind == "text")
            .filter_map(|p| p.text.map(|t| t.value))
            .collect::<Vec<_>>()
            .join("\n");
        ThreadMessage { role: m.role, text }
    }
}

/// 消息列表单页上限（接口允许的最大值）
const MESSAGE_PAGE_LIMIT: usize = 100;

/// OpenAI Assistants v2 客户端
pub struct AssistantsClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl AssistantsClient {
    pub fn new(base_url: Option<&str>, api_key: Option<&str>, request_timeout_secs: u64) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(request_timeout_secs.max(1)))
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.unwrap_or(OPENAI_BASE_URL).trim_end_matches('/').to_string(),
            api_key,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<String, LlmError> {
        let response = request
            .bearer_auth(&self.api_key)
            .header("OpenAI-Beta", "assistants=v2")
            .send()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| LlmError::Transport(format!("failed to read response body: {e}")))?;
        if status.is_success() {
            return Ok(text);
        }
        let parsed: Option<Value> = serde_json::from_str(&text).ok();
        let error = parsed.as_ref().and_then(|v| v.get("error"));
        Err(LlmError::Api {
            status: Some(status.as_u16()),
            code: error
                .and_then(|e| e.get("code"))
                .and_then(|c| c.as_str())
                .map(String::from),
            message: error
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .map(String::from)
                .unwrap_or(text),
        })
    }

    async fn post<T: for<'de> Deserialize<'de>>(&self, path: &str, body: Value) -> Result<T, LlmError> {
        let url = format!("{}{}", self.base_url, path);
        let text = self.send(self.http.post(&url).json(&body)).await?;
        serde_json::from_str(&text).map_err(|e| LlmError::Decode(format!("{path}: {e}")))
    }

    async fn get<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T, LlmError> {
        let url = format!("{}{}", self.base_url, path);
        let text = self.send(self.http.get(&url)).await?;
        serde_json::from_str(&text).map_err(|e| LlmError::Decode(format!("{path}: {e}")))
    }
}

#[async_trait]
impl HostedProvider for AssistantsClient {
    async fn create_thread(&self) -> Result<String, LlmError> {
        let thread: IdObject = self.post("/threads", serde_json::json!({})).await?;
        Ok(thread.id)
    }

    async fn add_user_message(&self, thread_id: &str, text: &str) -> Result<(), LlmError> {
        let _: Value = self
            .post(
                &format!("/threads/{thread_id}/messages"),
                serde_json::json!({"role": "user", "content": text}),
            )
            .await?;
        Ok(())
    }

    async fn create_run(&self, thread_id: &str, assistant_id: &str) -> Result<String, LlmError> {
        let run: IdObject = self
            .post(
                &format!("/threads/{thread_id}/runs"),
                serde_json::json!({"assistant_id": assistant_id}),
            )
            .await?;
        Ok(run.id)
    }

    async fn poll_run(&self, thread_id: &str, run_id: &str) -> Result<RunStatus, LlmError> {
        let run: WireRun = self.get(&format!("/threads/{thread_id}/runs/{run_id}")).await?;
        Ok(run.into())
    }

    async fn submit_tool_outputs(
        &self,
        thread_id: &str,
        run_id: &str,
        outputs: Vec<ToolOutputSubmission>,
    ) -> Result<(), LlmError> {
        let _: Value = self
            .post(
                &format!("/threads/{thread_id}/runs/{run_id}/submit_tool_outputs"),
                serde_json::json!({"tool_outputs": outputs}),
            )
            .await?;
        Ok(())
    }

    async fn list_messages(&self, thread_id: &str) -> Result<Vec<ThreadMessage>, LlmError> {
        let mut messages = Vec::new();
        let mut after: Option<String> = None;
        loop {
            let mut path =
                format!("/threads/{thread_id}/messages?order=asc&limit={MESSAGE_PAGE_LIMIT}");
            if let Some(cursor) = &after {
                path.push_str(&format!("&after={cursor}"));
            }
            let page: WireMessageList = self.get(&path).await?;
            messages.extend(page.data.into_iter().map(ThreadMessage::from));
            match page.last_id {
                // 游标不前进时停止，避免死循环
                Some(id) if page.has_more && after.as_deref() != Some(id.as_str()) => {
                    after = Some(id)
                }
                _ => break,
            }
        }
        tracing::debug!(thread = %thread_id, messages = messages.len(), "thread messages listed");
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_run_state_parse() {
        assert_eq!(RunState::parse("queued"), RunState::Queued);
        assert_eq!(RunState::parse("requires_action"), RunState::RequiresAction);
        assert_eq!(
            RunState::parse("expired"),
            RunState::Unrecognized("expired".to_string())
        );
        assert_eq!(RunState::parse("expired").to_string(), "expired");
    }

    #[test]
    fn test_wire_run_with_required_action() {
        let run: WireRun = serde_json::from_str(
            r#"{"id":"run_1","status":"requires_action",
                "required_action":{"type":"submit_tool_outputs","submit_tool_outputs":{"tool_calls":[
                  {"id":"call_a","type":"function","function":{"name":"list_files","arguments":"{}"}},
                  {"id":"call_b","type":"function","function":{"name":"read_file","arguments":"{\"path\":\"a\"}"}}
                ]}},"last_error":null}"#,
        )
        .unwrap();
        let status = RunStatus::from(run);
        assert_eq!(status.state, RunState::RequiresAction);
        assert_eq!(status.required_calls.len(), 2);
        assert_eq!(status.required_calls[1].arguments, r#"{"path":"a"}"#);
    }

    #[test]
    fn test_wire_run_failed_carries_last_error() {
        let run: WireRun = serde_json::from_str(
            r#"{"status":"failed","last_error":{"code":"server_error","message":"oops"}}"#,
        )
        .unwrap();
        let status = RunStatus::from(run);
        assert_eq!(status.state, RunState::Failed);
        assert_eq!(status.last_error.as_deref(), Some("server_error: oops"));
    }

    /// 本地 HTTP 桩：按 after 游标返回两页消息，并记录请求路径
    async fn serve_two_pages() -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let paths = Arc::new(Mutex::new(Vec::new()));
        let seen = paths.clone();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                while !String::from_utf8_lossy(&buf).contains("\r\n\r\n") {
                    match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    }
                }
                let request = String::from_utf8_lossy(&buf).to_string();
                let path = request.split_whitespace().nth(1).unwrap_or("").to_string();
                let body = if path.contains("after=msg_99") {
                    serde_json::json!({
                        "data": [{"id": "msg_100", "role": "assistant",
                                  "content": [{"type": "text", "text": {"value": "LATEST ANSWER", "annotations": []}}]}],
                        "has_more": false,
                        "last_id": "msg_100"
                    })
                } else {
                    let data: Vec<Value> = (0..100)
                        .map(|i| serde_json::json!({"id": format!("msg_{i}"), "role": "assistant",
                            "content": [{"type": "text", "text": {"value": format!("old {i}"), "annotations": []}}]}))
                        .collect();
                    serde_json::json!({"data": data, "has_more": true, "last_id": "msg_99"})
                };
                seen.lock().unwrap().push(path);
                let body = body.to_string();
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });
        (base_url, paths)
    }

    #[tokio::test]
    async fn test_list_messages_follows_pages() {
        let (base_url, paths) = serve_two_pages().await;
        let client = AssistantsClient::new(Some(&base_url), Some("sk-test"), 5);

        let messages = client.list_messages("thread_x").await.unwrap();
        assert_eq!(messages.len(), 101);
        assert_eq!(messages[0].text, "old 0");
        assert_eq!(messages.last().map(|m| m.text.as_str()), Some("LATEST ANSWER"));

        let paths = paths.lock().unwrap().clone();
        assert_eq!(paths.len(), 2);
        assert_eq!(paths[0], "/threads/thread_x/messages?order=asc&limit=100");
        assert!(paths[1].ends_with("&after=msg_99"));
    }

    #[test]
    fn test_thread_message_text_parts_joined() {
        let msg: WireThreadMessage = serde_json::from_str(
            r#"{"role":"assistant","content":[
                {"type":"text","text":{"value":"first","annotations":[]}},
                {"type":"image_file","image_file":{"file_id":"f"}},
                {"type":"text","text":{"value":"second","annotations":[]}}]}"#,
        )
        .unwrap();
        let msg = ThreadMessage::from(msg);
        assert_eq!(msg.text, "first\nsecond");
    }
}
