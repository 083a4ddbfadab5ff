//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `SCOUT__*` 覆盖（双下划线表示嵌套，如 `SCOUT__LLM__PROTOCOL=hosted`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub engine: EngineSection,
    pub tools: ToolsSection,
    pub planner: PlannerSection,
    pub hosted: HostedSection,
}

/// [app] 段：沙箱根目录、对话存储目录、设置文件
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    /// 沙箱根目录，未设置时用 ./workspace
    pub workspace_root: Option<PathBuf>,
    /// 对话存储目录，未设置时用 ./conversations
    pub conversations_dir: Option<PathBuf>,
    /// 设置文件，未设置时用 <用户配置目录>/scout/settings.json
    pub settings_path: Option<PathBuf>,
}

/// [llm] 段：协议、模型与端点
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// direct（chat completion 循环）或 hosted（thread/run 轮询）
    pub protocol: String,
    /// 直连后端：deepseek / openai
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    /// 存放 API Key 的环境变量名
    pub api_key_env: Option<String>,
    pub max_tokens: Option<u32>,
    /// 咨询性 token 预算，仅用于告警
    pub token_budget: Option<u64>,
    pub request_timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            protocol: "direct".to_string(),
            provider: "deepseek".to_string(),
            model: "deepseek-chat".to_string(),
            base_url: None,
            api_key_env: None,
            max_tokens: None,
            token_budget: None,
            request_timeout_secs: 60,
        }
    }
}

/// [engine] 段：主循环
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// 单次交互的最大 turn 数
    pub max_turns: usize,
    pub system_prompt: String,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_turns: 20,
            system_prompt: "You are a careful research assistant. Use the available tools to \
                inspect the workspace before answering, and answer concisely."
                .to_string(),
        }
    }
}

/// [tools] 段：并发与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    pub max_concurrency: usize,
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            tool_timeout_secs: 120,
        }
    }
}

/// [planner] 段：规划子 agent
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlannerSection {
    pub enabled: bool,
    /// 未设置时与主模型相同
    pub model: Option<String>,
    pub max_checkins: usize,
    /// 规划子 agent 自身的 turn 上限
    pub max_turns: usize,
    pub initial_prompt: String,
    pub checkin_prompt: String,
    pub finish_prompt: String,
}

impl Default for PlannerSection {
    fn default() -> Self {
        Self {
            enabled: true,
            model: None,
            max_checkins: 8,
            max_turns: 6,
            initial_prompt: "You plan research for another assistant. Given the user's question, \
                write a short numbered plan of what to inspect. Do not answer the question."
                .to_string(),
            checkin_prompt: "You supervise a research assistant. Review the progress so far and \
                give brief guidance for the next step. If enough has been gathered, reply with \
                PROCEED_TO_ANSWER and a one-line reason."
                .to_string(),
            finish_prompt: "Summarise the durable findings of this exchange as a few short notes \
                that would help with follow-up questions."
                .to_string(),
        }
    }
}

/// [hosted] 段：thread/run 协议
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HostedSection {
    pub assistant_id: Option<String>,
    pub poll_interval_ms: u64,
    pub run_deadline_secs: u64,
}

impl Default for HostedSection {
    fn default() -> Self {
        Self {
            assistant_id: None,
            poll_interval_ms: 500,
            run_deadline_secs: 600,
        }
    }
}

impl AppConfig {
    pub fn workspace_root(&self) -> PathBuf {
        self.app
            .workspace_root
            .clone()
            .unwrap_or_else(|| PathBuf::from("workspace"))
    }

    pub fn conversations_dir(&self) -> PathBuf {
        self.app
            .conversations_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("conversations"))
    }

    pub fn settings_path(&self) -> PathBuf {
        self.app
            .settings_path
            .clone()
            .unwrap_or_else(crate::core::default_settings_path)
    }
}

/// 从 config 目录加载配置，环境变量 SCOUT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 SCOUT__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("SCOUT")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
