//! 脚本化 Mock 客户端（用于测试，无需 API）
//!
//! ScriptedChatProvider 按顺序返回预设回复并记录每次请求；ScriptedHostedProvider 按顺序返回预设 run 状态，
//! 并统计 submit_tool_outputs / list_messages 的调用。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::assistants::{HostedProvider, RunStatus, ThreadMessage, ToolOutputSubmission};
use crate::llm::{ChatProvider, ChatRequest, ChatResponse, LlmError};

/// 直连协议 Mock：脚本耗尽后返回 API 错误
#[derive(Debug, Default)]
pub struct ScriptedChatProvider {
    replies: Mutex<VecDeque<Result<ChatResponse, LlmError>>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedChatProvider {
    pub fn new(replies: Vec<Result<ChatResponse, LlmError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// 已收到的请求（按顺序）
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn remaining(&self) -> usize {
        self.replies.lock().map(|r| r.len()).unwrap_or(0)
    }
}

#[async_trait]
impl ChatProvider for ScriptedChatProvider {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, LlmError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        self.replies
            .lock()
            .ok()
            .and_then(|mut r| r.pop_front())
            .unwrap_or_else(|| {
                Err(LlmError::Api {
                    status: None,
                    code: Some("script_exhausted".to_string()),
                    message: "no scripted reply left".to_string(),
                })
            })
    }
}

/// Hosted 协议 Mock
#[derive(Debug)]
pub struct ScriptedHostedProvider {
    statuses: Mutex<VecDeque<RunStatus>>,
    messages: Vec<ThreadMessage>,
    thread_id: String,
    thread_error: Option<LlmError>,
    created_threads: Mutex<usize>,
    user_messages: Mutex<Vec<(String, String)>>,
    submissions: Mutex<Vec<Vec<ToolOutputSubmission>>>,
    list_calls: Mutex<usize>,
}

impl ScriptedHostedProvider {
    pub fn new(statuses: Vec<RunStatus>, messages: Vec<ThreadMessage>) -> Self {
        Self {
            statuses: Mutex::new(statuses.into()),
            messages,
            thread_id: "thread_mock".to_string(),
            thread_error: None,
            created_threads: Mutex::new(0),
            user_messages: Mutex::new(Vec::new()),
            submissions: Mutex::new(Vec::new()),
            list_calls: Mutex::new(0),
        }
    }

    pub fn with_thread_id(mut self, id: impl Into<String>) -> Self {
        self.thread_id = id.into();
        self
    }

    /// create_thread 总是返回该错误
    pub fn with_thread_error(mut self, error: LlmError) -> Self {
        self.thread_error = Some(error);
        self
    }

    pub fn created_threads(&self) -> usize {
        self.created_threads.lock().map(|n| *n).unwrap_or(0)
    }

    /// (thread_id, text)
    pub fn user_messages(&self) -> Vec<(String, String)> {
        self.user_messages.lock().map(|m| m.clone()).unwrap_or_default()
    }

    pub fn submissions(&self) -> Vec<Vec<ToolOutputSubmission>> {
        self.submissions.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.lock().map(|n| *n).unwrap_or(0)
    }
}

#[async_trait]
impl HostedProvider for ScriptedHostedProvider {
    async fn create_thread(&self) -> Result<String, LlmError> {
        if let Ok(mut n) = self.created_threads.lock() {
            *n += 1;
        }
        if let Some(error) = &self.thread_error {
            return Err(error.clone());
        }
        Ok(self.thread_id.clone())
    }

    async fn add_user_message(&self, thread_id: &str, text: &str) -> Result<(), LlmError> {
        if let Ok(mut m) = self.user_messages.lock() {
            m.push((thread_id.to_string(), text.to_string()));
        }
        Ok(())
    }

    async fn create_run(&self, _thread_id: &str, _assistant_id: &str) -> Result<String, LlmError> {
        Ok("run_mock".to_string())
    }

    async fn poll_run(&self, _thread_id: &str, _run_id: &str) -> Result<RunStatus, LlmError> {
        self.statuses
            .lock()
            .ok()
            .and_then(|mut s| s.pop_front())
            .ok_or_else(|| LlmError::Api {
                status: None,
                code: Some("script_exhausted".to_string()),
                message: "no scripted run status left".to_string(),
            })
    }

    async fn submit_tool_outputs(
        &self,
        _thread_id: &str,
        _run_id: &str,
        outputs: Vec<ToolOutputSubmission>,
    ) -> Result<(), LlmError> {
        if let Ok(mut s) = self.submissions.lock() {
            s.push(outputs);
        }
        Ok(())
    }

    async fn list_messages(&self, _thread_id: &str) -> Result<Vec<ThreadMessage>, LlmError> {
        if let Ok(mut n) = self.list_calls.lock() {
            *n += 1;
        }
        Ok(self.messages.clone())
    }
}
