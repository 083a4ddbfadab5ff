//! 核心层：错误类型、会话状态、设置存储

pub mod error;
pub mod session;
pub mod settings;

pub use error::AgentError;
pub use session::{check_tool_pairing, Session};
pub use settings::{
    default_settings_path, JsonFileSettings, MemorySettings, SettingsStore, LAST_THREAD_ID_KEY,
};
