//! LLM 层：直连协议（OpenAI 兼容 / DeepSeek）、Hosted 协议（thread / run）与脚本化 Mock

pub mod assistants;
pub mod deepseek;
pub mod mock;
pub mod openai;
pub mod traits;

pub use assistants::{
    AssistantsClient, HostedProvider, RunState, RunStatus, ThreadMessage, ToolOutputSubmission,
};
pub use deepseek::{create_deepseek_client, DEEPSEEK_BASE_URL, DEEPSEEK_CHAT, DEEPSEEK_REASONER};
pub use mock::{ScriptedChatProvider, ScriptedHostedProvider};
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::{ChatProvider, ChatReply, ChatRequest, ChatResponse, LlmError, Usage};
