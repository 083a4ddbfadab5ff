//! 会话：一次多轮交互的全部状态
//!
//! 消息列表只追加、不重排；首条为 system prompt。会话由调用方独占（`&mut Session`），
//! 工具调度池的 worker 从不直接写入，一轮结果由 `append_tool_round` 单写者合并。

use crate::llm::Usage;
use crate::memory::{Message, ToolCallRequest};
use crate::tools::{ToolResponse, ToolSpec};

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub model: String,
    /// 咨询性 token 预算（仅展示与告警，不强制）
    pub token_budget: Option<u64>,
    pub tools: Vec<ToolSpec>,
    pub planner_enabled: bool,
    messages: Vec<Message>,
    usage: Usage,
}

impl Session {
    pub fn new(model: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            model: model.into(),
            token_budget: None,
            tools: Vec::new(),
            planner_enabled: false,
            messages: vec![Message::system(system_prompt)],
            usage: Usage::default(),
        }
    }

    /// 从已保存的消息恢复（首条应为 system prompt）
    pub fn from_messages(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            model: model.into(),
            token_budget: None,
            tools: Vec::new(),
            planner_enabled: false,
            messages,
            usage: Usage::default(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_planner(mut self, enabled: bool) -> Self {
        self.planner_enabled = enabled;
        self
    }

    pub fn with_token_budget(mut self, budget: Option<u64>) -> Self {
        self.token_budget = budget;
        self
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// 合并一整轮工具调用：先 assistant 工具调用消息，再按请求顺序每个 id 一条 tool 消息
    pub fn append_tool_round(&mut self, results: Vec<(ToolCallRequest, ToolResponse)>) {
        if results.is_empty() {
            return;
        }
        let calls: Vec<ToolCallRequest> = results.iter().map(|(call, _)| call.clone()).collect();
        self.messages.push(Message::tool_calls(calls));
        for (call, response) in results {
            self.messages
                .push(Message::tool(call.id, call.name, response.text));
        }
    }

    /// 最近一条 assistant 文本
    pub fn last_answer(&self) -> Option<&str> {
        self.messages.iter().rev().find_map(|m| match m {
            Message::Assistant(crate::memory::AssistantContent::Text(text)) => Some(text.as_str()),
            _ => None,
        })
    }

    /// 发起本次交互的用户消息（最近一条非 planner 注入的 user 消息）
    pub fn last_user_text(&self) -> Option<&str> {
        self.messages.iter().rev().find_map(|m| match m {
            Message::User { text } if crate::react::planner::parse_planner_note(text).is_none() => {
                Some(text.as_str())
            }
            _ => None,
        })
    }

    pub fn record_usage(&mut self, usage: Usage) {
        self.usage.prompt_tokens += usage.prompt_tokens;
        self.usage.completion_tokens += usage.completion_tokens;
    }

    pub fn usage(&self) -> Usage {
        self.usage
    }

    pub fn over_budget(&self) -> bool {
        self.token_budget
            .map(|budget| self.usage.total() > budget)
            .unwrap_or(false)
    }
}

/// 校验工具调用配对：每条工具调用消息之后、下一次非 tool 消息之前，恰好每个 id 一条 tool 响应且顺序一致
pub fn check_tool_pairing(messages: &[Message]) -> Result<(), String> {
    let mut i = 0;
    while i < messages.len() {
        if let Some(calls) = messages[i].requested_calls() {
            for (offset, call) in calls.iter().enumerate() {
                match messages.get(i + 1 + offset) {
                    Some(Message::Tool { call_id, .. }) if call_id == &call.id => {}
                    other => {
                        return Err(format!(
                            "call {} at message {i} is answered by {:?}",
                            call.id, other
                        ))
                    }
                }
            }
            i += 1 + calls.len();
            if let Some(Message::Tool { call_id, .. }) = messages.get(i) {
                return Err(format!("extra tool response {call_id} at message {i}"));
            }
        } else {
            if let Message::Tool { call_id, .. } = &messages[i] {
                return Err(format!("orphan tool response {call_id} at message {i}"));
            }
            i += 1;
        }
    }
    Ok(())
}
