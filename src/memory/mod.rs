//! 记忆层：消息模型与对话持久化 / 回放

pub mod conversation;
pub mod persistence;

pub use conversation::{AssistantContent, Message, Role, ToolCallRequest};
pub use persistence::{ConversationStore, StoredMessage, StoredToolCall};
