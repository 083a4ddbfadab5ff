//! Agent 门面
//!
//! 从配置构建 Provider、工具注册表、调度池、Planner 与存储；ask 在配置的协议上跑一次交互：
//! direct 走 TurnEngine（可挂 Planner），hosted 走 RunStatusPoller（可继续上一个 thread）。
//! 给定 conversation id 时先加载（并回放）已存对话，结束后整体保存。
//! Provider / run 错误总是落成回答文本；只有配置、IO、设置与回放解码错误才上抛。

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::{AgentError, JsonFileSettings, Session, SettingsStore};
use crate::llm::{
    create_deepseek_client, AssistantsClient, ChatProvider, HostedProvider, OpenAiClient,
    DEEPSEEK_BASE_URL,
};
use crate::memory::{ConversationStore, Message};
use crate::react::{
    planner_registry, AgentEvent, Notifier, PlannerController, PlannerPrompts, RunStatusPoller,
    TurnEngine,
};
use crate::tools::{EchoTool, ListFilesTool, ReadFileTool, ToolDispatchPool, ToolRegistry};

/// 单次 ask 的选项
#[derive(Clone)]
pub struct AskOptions {
    /// hosted：继续设置中记录的上一个 thread
    pub continue_previous: bool,
    /// 给定时加载并在结束后保存该对话
    pub conversation_id: Option<String>,
    /// false 时本次关闭 planner（配置启用时才有意义）
    pub planner: bool,
    pub notifier: Notifier,
    pub cancel: CancellationToken,
}

impl Default for AskOptions {
    fn default() -> Self {
        Self {
            continue_previous: false,
            conversation_id: None,
            planner: true,
            notifier: Notifier::new(),
            cancel: CancellationToken::new(),
        }
    }
}

enum Protocol {
    Direct(TurnEngine),
    Hosted(RunStatusPoller),
}

pub struct Agent {
    config: AppConfig,
    protocol: Protocol,
    registry: ToolRegistry,
    store: ConversationStore,
    settings: Arc<dyn SettingsStore>,
}

/// 主工具集：echo、list_files、read_file（沙箱在 workspace_root）
pub fn default_registry(config: &AppConfig) -> ToolRegistry {
    let root = config.workspace_root();
    ToolRegistry::new()
        .with(EchoTool)
        .with(ListFilesTool::new(&root))
        .with(ReadFileTool::new(&root))
}

fn api_key(config: &AppConfig) -> Option<String> {
    config
        .llm
        .api_key_env
        .as_deref()
        .and_then(|name| std::env::var(name).ok())
}

fn is_deepseek(config: &AppConfig) -> bool {
    config.llm.provider.eq_ignore_ascii_case("deepseek")
}

/// 直连端点：显式 base_url 优先；deepseek 走 DeepSeek 端点；其余为 None（OpenAI 默认端点）
pub fn chat_base_url(config: &AppConfig) -> Option<&str> {
    match config.llm.base_url.as_deref() {
        Some(url) => Some(url),
        None if is_deepseek(config) => Some(DEEPSEEK_BASE_URL),
        None => None,
    }
}

/// 按配置创建直连 Provider，按 provider 名选端点，配置的 key 原样透传
pub fn create_chat_provider(config: &AppConfig) -> Arc<dyn ChatProvider> {
    let timeout = config.llm.request_timeout_secs;
    let key = api_key(config);
    if is_deepseek(config) && config.llm.base_url.is_none() {
        tracing::info!(model = %config.llm.model, "using DeepSeek");
        Arc::new(create_deepseek_client(key.as_deref(), timeout))
    } else {
        let base_url = chat_base_url(config);
        tracing::info!(model = %config.llm.model, base_url = ?base_url, "using OpenAI-compatible endpoint");
        Arc::new(OpenAiClient::new(base_url, key.as_deref(), timeout))
    }
}

pub fn create_hosted_provider(config: &AppConfig) -> Arc<dyn HostedProvider> {
    Arc::new(AssistantsClient::new(
        config.llm.base_url.as_deref(),
        api_key(config).as_deref(),
        config.llm.request_timeout_secs,
    ))
}

impl Agent {
    /// 用真实 Provider 与文件设置构建
    pub fn from_config(config: AppConfig) -> Result<Self, AgentError> {
        std::fs::create_dir_all(config.workspace_root())?;
        let settings: Arc<dyn SettingsStore> =
            Arc::new(JsonFileSettings::new(config.settings_path()));
        let chat = create_chat_provider(&config);
        let hosted = match config.llm.protocol.as_str() {
            "hosted" => Some(create_hosted_provider(&config)),
            _ => None,
        };
        Self::new(config, chat, hosted, settings)
    }

    /// 注入 Provider 与设置存储（测试用 Mock 也走这里）
    pub fn new(
        config: AppConfig,
        chat: Arc<dyn ChatProvider>,
        hosted: Option<Arc<dyn HostedProvider>>,
        settings: Arc<dyn SettingsStore>,
    ) -> Result<Self, AgentError> {
        let registry = default_registry(&config);
        let pool = ToolDispatchPool::new(
            registry.clone(),
            config.tools.max_concurrency,
            config.tools.tool_timeout_secs,
        );

        let protocol = match config.llm.protocol.as_str() {
            "direct" => {
                let mut engine = TurnEngine::new(chat.clone(), pool)
                    .with_max_turns(config.engine.max_turns)
                    .with_max_tokens(config.llm.max_tokens);
                if config.planner.enabled {
                    let planner_pool = ToolDispatchPool::new(
                        planner_registry(config.workspace_root()),
                        config.tools.max_concurrency,
                        config.tools.tool_timeout_secs,
                    );
                    let planner_engine = TurnEngine::new(chat, planner_pool)
                        .with_max_turns(config.planner.max_turns)
                        .with_max_tokens(config.llm.max_tokens);
                    let model = config
                        .planner
                        .model
                        .clone()
                        .unwrap_or_else(|| config.llm.model.clone());
                    let planner = PlannerController::new(planner_engine, model)
                        .with_prompts(PlannerPrompts::from(&config.planner))
                        .with_max_checkins(config.planner.max_checkins);
                    engine = engine.with_planner(Arc::new(planner));
                }
                Protocol::Direct(engine)
            }
            "hosted" => {
                let provider = hosted.ok_or_else(|| {
                    AgentError::Config("hosted protocol needs a hosted provider".to_string())
                })?;
                let assistant_id = config.hosted.assistant_id.clone().ok_or_else(|| {
                    AgentError::Config("hosted.assistant_id is not set".to_string())
                })?;
                Protocol::Hosted(
                    RunStatusPoller::new(provider, pool, assistant_id)
                        .with_poll_interval(Duration::from_millis(config.hosted.poll_interval_ms))
                        .with_deadline(Duration::from_secs(config.hosted.run_deadline_secs)),
                )
            }
            other => {
                return Err(AgentError::Config(format!(
                    "unknown protocol `{other}` (expected direct or hosted)"
                )))
            }
        };

        Ok(Self {
            store: ConversationStore::new(config.conversations_dir()),
            config,
            protocol,
            registry,
            settings,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// 新会话，或从存储中加载（并回放）给定对话
    fn open_session(&self, options: &AskOptions) -> Result<Session, AgentError> {
        let session = match options.conversation_id.as_deref() {
            Some(id) if self.store.exists(id) => {
                let messages = self.store.load(id, &options.notifier)?;
                tracing::info!(conversation = %id, messages = messages.len(), "resuming conversation");
                Session::from_messages(self.config.llm.model.clone(), messages).with_id(id)
            }
            Some(id) => Session::new(self.config.llm.model.clone(), &self.config.engine.system_prompt)
                .with_id(id),
            None => Session::new(self.config.llm.model.clone(), &self.config.engine.system_prompt),
        };
        Ok(session
            .with_tools(self.registry.specs())
            .with_planner(self.config.planner.enabled && options.planner)
            .with_token_budget(self.config.llm.token_budget))
    }

    /// 跑一次交互并返回回答
    pub async fn ask(&self, question: &str, options: AskOptions) -> Result<String, AgentError> {
        let mut session = self.open_session(&options)?;
        session.push(Message::user(question));
        options.notifier.emit(AgentEvent::UserMessage {
            text: question.to_string(),
        });

        let answer = match &self.protocol {
            Protocol::Direct(engine) => {
                engine
                    .run(&mut session, &options.notifier, &options.cancel)
                    .await
            }
            Protocol::Hosted(poller) => {
                match poller
                    .open_thread(self.settings.as_ref(), options.continue_previous)
                    .await
                {
                    Ok(thread_id) => {
                        poller
                            .exchange(&thread_id, &mut session, &options.notifier, &options.cancel)
                            .await
                    }
                    Err(e @ AgentError::Provider(_)) => {
                        tracing::warn!(error = %e, "could not open hosted thread");
                        let diagnostic = e.to_diagnostic();
                        session.push(Message::assistant(diagnostic.clone()));
                        options.notifier.emit(AgentEvent::AssistantMessage {
                            text: diagnostic.clone(),
                        });
                        diagnostic
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        if let Some(id) = options.conversation_id.as_deref() {
            self.store.save(id, session.messages())?;
            tracing::info!(conversation = %id, "conversation saved");
        }
        Ok(answer)
    }
}
