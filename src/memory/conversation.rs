//! 对话消息模型
//!
//! Message 为封闭的带标签联合：每个角色只携带自己需要的字段，match 时由编译器保证穷尽。

use serde::{Deserialize, Serialize};

/// 消息角色（与 Provider API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// 模型发出的一次工具调用请求；arguments 为原始字符串，只有工具自己解析
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

impl ToolCallRequest {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }
}

/// assistant 消息内容：文本回复或一批工具调用
///
/// 工具调用消息可带一段前置文本（OpenAI 兼容 Provider 常在 tool_calls 旁给出 content），
/// 只为转录往返保留，不参与叙述与回答。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AssistantContent {
    Text(String),
    ToolCalls {
        calls: Vec<ToolCallRequest>,
        preamble: Option<String>,
    },
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    System { text: String },
    User { text: String },
    Assistant(AssistantContent),
    Tool {
        call_id: String,
        tool_name: String,
        text: String,
    },
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Message::System { text: text.into() }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Message::User { text: text.into() }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Message::Assistant(AssistantContent::Text(text.into()))
    }

    pub fn tool_calls(calls: Vec<ToolCallRequest>) -> Self {
        Message::Assistant(AssistantContent::ToolCalls {
            calls,
            preamble: None,
        })
    }

    /// 带前置文本的工具调用消息（原样保留，含空串）
    pub fn tool_calls_with_text(calls: Vec<ToolCallRequest>, text: Option<String>) -> Self {
        Message::Assistant(AssistantContent::ToolCalls {
            calls,
            preamble: text,
        })
    }

    pub fn tool(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Message::Tool {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            text: text.into(),
        }
    }

    pub fn role(&self) -> Role {
        match self {
            Message::System { .. } => Role::System,
            Message::User { .. } => Role::User,
            Message::Assistant(_) => Role::Assistant,
            Message::Tool { .. } => Role::Tool,
        }
    }

    /// 文本内容；assistant 的工具调用消息没有文本
    pub fn text(&self) -> Option<&str> {
        match self {
            Message::System { text } | Message::User { text } => Some(text),
            Message::Assistant(AssistantContent::Text(text)) => Some(text),
            Message::Assistant(AssistantContent::ToolCalls { .. }) => None,
            Message::Tool { text, .. } => Some(text),
        }
    }

    pub fn requested_calls(&self) -> Option<&[ToolCallRequest]> {
        match self {
            Message::Assistant(AssistantContent::ToolCalls { calls, .. }) => Some(calls),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles_and_text() {
        assert_eq!(Message::system("s").role(), Role::System);
        assert_eq!(Message::user("u").text(), Some("u"));
        let calls = Message::tool_calls(vec![ToolCallRequest::new("c1", "echo", "{}")]);
        assert_eq!(calls.role(), Role::Assistant);
        assert!(calls.text().is_none());
        assert_eq!(calls.requested_calls().map(|c| c.len()), Some(1));
        assert_eq!(Message::tool("c1", "echo", "hi").role().as_str(), "tool");
    }
}
