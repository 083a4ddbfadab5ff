//! 对话持久化与回放
//!
//! 每个会话一个 JSON 文件（按调用方给定的 conversation id 命名），保存时整体覆盖（临时文件 + rename），
//! 保证落盘内容与保存时的内存状态一致。加载时从通用字段形式（role / content / tool_calls / tool_call_id / name）
//! 重建类型化 Message，并向 Notifier 重新发出工具调用 / 结果 / planner 笔记事件，但绝不重新执行工具。

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::AgentError;
use crate::memory::{AssistantContent, Message, ToolCallRequest};
use crate::react::planner::parse_planner_note;
use crate::react::{AgentEvent, Notifier};

/// 通用字段形式的消息，同时也是 OpenAI 兼容 API 的消息线格式
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<StoredToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_type")]
    pub kind: String,
    pub function: StoredFunction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredFunction {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

fn function_type() -> String {
    "function".to_string()
}

impl From<&ToolCallRequest> for StoredToolCall {
    fn from(call: &ToolCallRequest) -> Self {
        Self {
            id: call.id.clone(),
            kind: function_type(),
            function: StoredFunction {
                name: call.name.clone(),
                arguments: call.arguments.clone(),
            },
        }
    }
}

impl From<&Message> for StoredMessage {
    fn from(message: &Message) -> Self {
        let blank = |role: &str| StoredMessage {
            role: role.to_string(),
            content: None,
            tool_calls: None,
            tool_call_id: None,
            name: None,
        };
        match message {
            Message::System { text } => StoredMessage {
                content: Some(text.clone()),
                ..blank("system")
            },
            Message::User { text } => StoredMessage {
                content: Some(text.clone()),
                ..blank("user")
            },
            Message::Assistant(AssistantContent::Text(text)) => StoredMessage {
                content: Some(text.clone()),
                ..blank("assistant")
            },
            Message::Assistant(AssistantContent::ToolCalls { calls, preamble }) => StoredMessage {
                content: preamble.clone(),
                tool_calls: Some(calls.iter().map(StoredToolCall::from).collect()),
                ..blank("assistant")
            },
            Message::Tool {
                call_id,
                tool_name,
                text,
            } => StoredMessage {
                content: Some(text.clone()),
                tool_call_id: Some(call_id.clone()),
                name: Some(tool_name.clone()),
                ..blank("tool")
            },
        }
    }
}

/// 将通用字段形式解码为类型化消息；tool 消息缺少 name 时按 call id 回查前面的工具调用
pub fn decode_messages(stored: Vec<StoredMessage>) -> Result<Vec<Message>, AgentError> {
    let mut known_calls: HashMap<String, String> = HashMap::new();
    let mut messages = Vec::with_capacity(stored.len());
    for (index, m) in stored.into_iter().enumerate() {
        let missing = |field: &str| {
            AgentError::ReplayDecode(format!("message {index} ({}) has no {field}", m.role))
        };
        let message = match m.role.as_str() {
            "system" => Message::system(m.content.clone().ok_or_else(|| missing("content"))?),
            "user" => Message::user(m.content.clone().ok_or_else(|| missing("content"))?),
            "assistant" => match &m.tool_calls {
                Some(calls) if !calls.is_empty() => {
                    let calls: Vec<ToolCallRequest> = calls
                        .iter()
                        .map(|c| {
                            ToolCallRequest::new(
                                c.id.clone(),
                                c.function.name.clone(),
                                c.function.arguments.clone(),
                            )
                        })
                        .collect();
                    for call in &calls {
                        known_calls.insert(call.id.clone(), call.name.clone());
                    }
                    Message::tool_calls_with_text(calls, m.content.clone())
                }
                _ => Message::assistant(m.content.clone().ok_or_else(|| missing("content"))?),
            },
            "tool" => {
                let call_id = m.tool_call_id.clone().ok_or_else(|| missing("tool_call_id"))?;
                let tool_name = match m.name.clone() {
                    Some(name) => name,
                    None => known_calls
                        .get(&call_id)
                        .cloned()
                        .ok_or_else(|| missing("name"))?,
                };
                let text = m.content.clone().ok_or_else(|| missing("content"))?;
                Message::tool(call_id, tool_name, text)
            }
            other => {
                return Err(AgentError::ReplayDecode(format!(
                    "message {index} has unknown role `{other}`"
                )))
            }
        };
        messages.push(message);
    }
    Ok(messages)
}

pub fn encode_messages(messages: &[Message]) -> Vec<StoredMessage> {
    messages.iter().map(StoredMessage::from).collect()
}

/// 按回放顺序重新发出叙述事件；首条消息视为 system prompt，不参与叙述
pub fn replay(messages: &[Message], notifier: &Notifier) {
    let mut pending: HashMap<&str, &str> = HashMap::new();
    for message in messages.iter().skip(1) {
        match message {
            Message::System { text } => {
                if let Some((phase, note)) = parse_planner_note(text) {
                    notifier.emit(AgentEvent::PlannerNote {
                        phase,
                        text: note.to_string(),
                    });
                }
            }
            Message::User { text } => match parse_planner_note(text) {
                Some((phase, note)) => notifier.emit(AgentEvent::PlannerNote {
                    phase,
                    text: note.to_string(),
                }),
                None => notifier.emit(AgentEvent::UserMessage { text: text.clone() }),
            },
            Message::Assistant(AssistantContent::Text(text)) => {
                notifier.emit(AgentEvent::AssistantMessage { text: text.clone() })
            }
            Message::Assistant(AssistantContent::ToolCalls { calls, .. }) => {
                for call in calls {
                    pending.insert(call.id.as_str(), call.arguments.as_str());
                    notifier.tool_requested(call);
                }
            }
            Message::Tool {
                call_id,
                tool_name,
                text,
            } => {
                let args = pending.remove(call_id.as_str()).unwrap_or("");
                let call = ToolCallRequest::new(call_id.clone(), tool_name.clone(), args);
                match crate::tools::diagnostic_reason(text) {
                    Some(reason) => notifier.tool_error(&call, &reason),
                    None => notifier.tool_result(&call, text),
                }
            }
        }
    }
}

/// 文件对话存储：dir/<conversation_id>.json
#[derive(Debug, Clone)]
pub struct ConversationStore {
    dir: PathBuf,
}

impl ConversationStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// conversation id 只允许字母数字、`-`、`_`，防止路径逃逸
    fn path_for(&self, conversation_id: &str) -> Result<PathBuf, AgentError> {
        let valid = !conversation_id.is_empty()
            && conversation_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(AgentError::Config(format!(
                "invalid conversation id `{conversation_id}`"
            )));
        }
        Ok(self.dir.join(format!("{conversation_id}.json")))
    }

    pub fn exists(&self, conversation_id: &str) -> bool {
        self.path_for(conversation_id)
            .map(|p| p.exists())
            .unwrap_or(false)
    }

    /// 整体覆盖写入；父目录不存在时自动创建
    pub fn save(&self, conversation_id: &str, messages: &[Message]) -> Result<(), AgentError> {
        let path = self.path_for(conversation_id)?;
        std::fs::create_dir_all(&self.dir)?;
        let data = serde_json::to_string_pretty(&encode_messages(messages))
            .map_err(|e| AgentError::ReplayDecode(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &path)?;
        tracing::debug!(conversation = %conversation_id, messages = messages.len(), "conversation saved");
        Ok(())
    }

    /// 只解码，不发出回放事件
    pub fn load_messages(&self, conversation_id: &str) -> Result<Vec<Message>, AgentError> {
        let path = self.path_for(conversation_id)?;
        let data = std::fs::read_to_string(&path)?;
        let stored: Vec<StoredMessage> = serde_json::from_str(&data)
            .map_err(|e| AgentError::ReplayDecode(format!("{}: {e}", path.display())))?;
        decode_messages(stored)
    }

    /// 加载并回放：返回面向模型的完整消息列表
    pub fn load(&self, conversation_id: &str, notifier: &Notifier) -> Result<Vec<Message>, AgentError> {
        let messages = self.load_messages(conversation_id)?;
        replay(&messages, notifier);
        tracing::info!(conversation = %conversation_id, messages = messages.len(), "conversation replayed");
        Ok(messages)
    }

    /// 已保存的 conversation id（排序）
    pub fn list(&self) -> Result<Vec<String>, AgentError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::react::PlannerPhase;
    use tokio::sync::mpsc;

    fn sample() -> Vec<Message> {
        vec![
            Message::system("You are a research assistant."),
            Message::user("What is in the workspace?"),
            Message::tool_calls(vec![
                ToolCallRequest::new("call_1", "list_files", "{}"),
                ToolCallRequest::new("call_2", "read_file", r#"{"path":"a.txt"}"#),
            ]),
            Message::tool("call_1", "list_files", r#"["a.txt","b.txt"]"#),
            Message::tool(
                "call_2",
                "read_file",
                r#"{"error":"tool_failed","message":"Path not found: a.txt","tool":"read_file"}"#,
            ),
            Message::assistant("There are two files."),
            Message::system("[planner:finish]\nworkspace has a.txt and b.txt"),
        ]
    }

    #[test]
    fn test_save_then_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(dir.path());
        store.save("conv-1", &sample()).unwrap();
        let loaded = store.load_messages("conv-1").unwrap();
        assert_eq!(loaded, sample());
    }

    #[test]
    fn test_resave_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(dir.path());
        store.save("conv-1", &sample()).unwrap();
        let first = std::fs::read_to_string(dir.path().join("conv-1.json")).unwrap();
        let loaded = store.load_messages("conv-1").unwrap();
        store.save("conv-1", &loaded).unwrap();
        let second = std::fs::read_to_string(dir.path().join("conv-1.json")).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_malformed_transcript_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.json"), "{not json").unwrap();
        let store = ConversationStore::new(dir.path());
        assert!(matches!(
            store.load_messages("bad"),
            Err(AgentError::ReplayDecode(_))
        ));

        std::fs::write(dir.path().join("role.json"), r#"[{"role":"wizard","content":"x"}]"#).unwrap();
        assert!(matches!(
            store.load_messages("role"),
            Err(AgentError::ReplayDecode(_))
        ));
    }

    #[test]
    fn test_tool_name_recovered_from_call_id() {
        let stored: Vec<StoredMessage> = serde_json::from_str(
            r#"[
                {"role":"system","content":"s"},
                {"role":"assistant","tool_calls":[{"id":"c1","function":{"name":"echo","arguments":"{}"}}]},
                {"role":"tool","tool_call_id":"c1","content":"hi"}
            ]"#,
        )
        .unwrap();
        let messages = decode_messages(stored).unwrap();
        assert_eq!(messages[2], Message::tool("c1", "echo", "hi"));
    }

    #[test]
    fn test_tool_call_preamble_survives_resave() {
        let dir = tempfile::tempdir().unwrap();
        let original = serde_json::json!([
            {"role": "system", "content": "s"},
            {"role": "user", "content": "what is here?"},
            {"role": "assistant", "content": "Let me check the files first.", "tool_calls": [
                {"id": "c1", "type": "function", "function": {"name": "list_files", "arguments": "{}"}}
            ]},
            {"role": "tool", "tool_call_id": "c1", "name": "list_files", "content": "[]"},
            {"role": "assistant", "content": "The workspace is empty."}
        ]);
        std::fs::write(dir.path().join("pre.json"), original.to_string()).unwrap();
        let store = ConversationStore::new(dir.path());

        let loaded = store.load_messages("pre").unwrap();
        assert_eq!(
            loaded[2],
            Message::tool_calls_with_text(
                vec![ToolCallRequest::new("c1", "list_files", "{}")],
                Some("Let me check the files first.".to_string())
            )
        );
        assert_eq!(loaded[2].requested_calls().map(|c| c.len()), Some(1));

        store.save("pre", &loaded).unwrap();
        let after: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("pre.json")).unwrap())
                .unwrap();
        assert_eq!(after, original);
    }

    #[test]
    fn test_replay_only_flags_known_diagnostics() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let notifier = Notifier::new().with_event_tx(tx);
        let messages = vec![
            Message::system("s"),
            Message::tool_calls(vec![ToolCallRequest::new("c1", "lookup", "{}")]),
            // 工具自己的 JSON 输出恰好带 error / message 字段，仍是正常结果
            Message::tool("c1", "lookup", r#"{"error":"none","message":"all good"}"#),
        ];
        replay(&messages, &notifier);

        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[1], AgentEvent::ToolResult { tool, .. } if tool == "lookup"));
    }

    #[test]
    fn test_invalid_conversation_id_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(dir.path());
        assert!(store.save("../escape", &sample()).is_err());
        assert!(!store.exists("../escape"));
    }

    #[test]
    fn test_list_conversations() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(dir.path().join("conversations"));
        assert!(store.list().unwrap().is_empty());
        store.save("b", &sample()).unwrap();
        store.save("a", &sample()).unwrap();
        assert_eq!(store.list().unwrap(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_replay_emits_events_without_system_prompt() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let notifier = Notifier::new().with_event_tx(tx);
        replay(&sample(), &notifier);

        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        assert!(matches!(&events[0], AgentEvent::UserMessage { text } if text.contains("workspace")));
        assert!(matches!(&events[1], AgentEvent::ToolRequested { tool, .. } if tool == "list_files"));
        assert!(matches!(&events[2], AgentEvent::ToolRequested { tool, .. } if tool == "read_file"));
        assert!(matches!(&events[3], AgentEvent::ToolResult { tool, .. } if tool == "list_files"));
        assert!(matches!(&events[4], AgentEvent::ToolError { tool, .. } if tool == "read_file"));
        assert!(matches!(&events[5], AgentEvent::AssistantMessage { .. }));
        assert!(matches!(
            &events[6],
            AgentEvent::PlannerNote { phase: PlannerPhase::Finish, .. }
        ));
        assert_eq!(events.len(), 7);
        assert!(!events.iter().any(|e| matches!(e, AgentEvent::UserMessage { text } if text.contains("research assistant"))));
    }
}
