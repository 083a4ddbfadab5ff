//! 过程事件与通知钩子
//!
//! NotificationSink 是下游协作者：工具请求 / 工具结果 / 工具错误三个钩子，返回 None 或 (label, detail) 供展示；
//! 钩子纯信息性，不影响控制流与结果。Notifier 把钩子与事件通道（供前端 / CLI 叙述）打包在一起。

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::memory::ToolCallRequest;
use crate::react::PlannerPhase;

/// 结果 / 错误预览最大字符数
const PREVIEW_CHARS: usize = 200;

/// 单步过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// 新一轮 turn 开始
    TurnStarted { turn: usize },
    UserMessage { text: String },
    AssistantMessage { text: String },
    /// 模型请求调用工具
    ToolRequested {
        call_id: String,
        tool: String,
        args: String,
    },
    /// 工具返回（预览）
    ToolResult {
        call_id: String,
        tool: String,
        preview: String,
    },
    /// 工具失败或参数诊断
    ToolError {
        call_id: String,
        tool: String,
        reason: String,
    },
    /// Planner 检查点注入的内容
    PlannerNote { phase: PlannerPhase, text: String },
    /// 钩子返回的展示标签
    Notice { label: String, detail: String },
    /// Hosted run 状态变化
    RunStatus { status: String },
    /// Token 使用统计（咨询性）
    TokenUsage {
        prompt_tokens: u64,
        completion_tokens: u64,
        budget: Option<u64>,
    },
}

/// 下游通知钩子；默认实现什么都不返回
pub trait NotificationSink: Send + Sync {
    fn on_tool_requested(&self, _name: &str, _args: &str) -> Option<(String, String)> {
        None
    }

    fn on_tool_result(&self, _name: &str, _args: &str, _output: &str) -> Option<(String, String)> {
        None
    }

    fn on_tool_error(&self, _name: &str, _args: &str, _error: &str) -> Option<(String, String)> {
        None
    }
}

/// 通知器：可选钩子 + 可选事件通道；Clone 后可交给工具 worker 使用
#[derive(Clone, Default)]
pub struct Notifier {
    sink: Option<Arc<dyn NotificationSink>>,
    event_tx: Option<mpsc::UnboundedSender<AgentEvent>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_event_tx(mut self, tx: mpsc::UnboundedSender<AgentEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn emit(&self, event: AgentEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    fn notice(&self, notice: Option<(String, String)>) {
        if let Some((label, detail)) = notice {
            self.emit(AgentEvent::Notice { label, detail });
        }
    }

    pub fn tool_requested(&self, call: &ToolCallRequest) {
        tracing::debug!(tool = %call.name, call_id = %call.id, "tool requested");
        if let Some(sink) = &self.sink {
            self.notice(sink.on_tool_requested(&call.name, &call.arguments));
        }
        self.emit(AgentEvent::ToolRequested {
            call_id: call.id.clone(),
            tool: call.name.clone(),
            args: call.arguments.clone(),
        });
    }

    pub fn tool_result(&self, call: &ToolCallRequest, output: &str) {
        if let Some(sink) = &self.sink {
            self.notice(sink.on_tool_result(&call.name, &call.arguments, output));
        }
        self.emit(AgentEvent::ToolResult {
            call_id: call.id.clone(),
            tool: call.name.clone(),
            preview: preview(output),
        });
    }

    pub fn tool_error(&self, call: &ToolCallRequest, error: &str) {
        tracing::warn!(tool = %call.name, call_id = %call.id, error = %error, "tool failed");
        if let Some(sink) = &self.sink {
            self.notice(sink.on_tool_error(&call.name, &call.arguments, error));
        }
        self.emit(AgentEvent::ToolError {
            call_id: call.id.clone(),
            tool: call.name.clone(),
            reason: preview(error),
        });
    }
}

pub(crate) fn preview(text: &str) -> String {
    if text.chars().count() > PREVIEW_CHARS {
        format!("{}...", text.chars().take(PREVIEW_CHARS).collect::<String>())
    } else {
        text.to_string()
    }
}
