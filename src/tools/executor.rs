//! 工具调度池
//!
//! 一批工具调用（一轮）在有界并发下执行：每个调用一个 tokio 任务，Semaphore 限制同时运行数；
//! 每个调用有截止时间并服从会话取消令牌。worker 只返回不可变的 (请求, 响应) 对，
//! 全部完成后按请求顺序返回（屏障），调用方单写者合并，绝不合并半批结果。
//!
//! 参数错误、未知工具、工具失败、超时都转为结构化诊断文本作为正常 tool 响应，模型可据此自我修正。
//! 每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::memory::ToolCallRequest;
use crate::react::Notifier;
use crate::tools::ToolRegistry;

/// 单个调用的结果（已序列化为文本）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolResponse {
    pub call_id: String,
    pub tool_name: String,
    pub text: String,
    pub ok: bool,
}

/// 工具调度池：持有注册表、并发上限与单次调用截止时间
#[derive(Clone)]
pub struct ToolDispatchPool {
    registry: Arc<ToolRegistry>,
    max_concurrency: usize,
    call_timeout: Duration,
}

impl ToolDispatchPool {
    pub fn new(registry: ToolRegistry, max_concurrency: usize, call_timeout_secs: u64) -> Self {
        Self {
            registry: Arc::new(registry),
            max_concurrency: max_concurrency.max(1),
            call_timeout: Duration::from_secs(call_timeout_secs.max(1)),
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// 执行一整批调用；返回顺序与请求顺序一致，与完成顺序无关
    pub async fn dispatch(
        &self,
        calls: &[ToolCallRequest],
        notifier: &Notifier,
        cancel: &CancellationToken,
    ) -> Vec<(ToolCallRequest, ToolResponse)> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut handles = Vec::with_capacity(calls.len());

        for call in calls.iter().cloned() {
            let registry = self.registry.clone();
            let semaphore = semaphore.clone();
            let notifier = notifier.clone();
            let cancel = cancel.clone();
            let call_timeout = self.call_timeout;
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                notifier.tool_requested(&call);
                let response = run_call(&registry, &call, call_timeout, &cancel).await;
                if response.ok {
                    notifier.tool_result(&call, &response.text);
                } else {
                    let reason = diagnostic_reason(&response.text).unwrap_or_else(|| response.text.clone());
                    notifier.tool_error(&call, &reason);
                }
                response
            }));
        }

        // 屏障：全部完成后才返回，join_all 保持请求顺序
        let joined = join_all(handles).await;
        let mut results = Vec::with_capacity(calls.len());
        for (call, joined) in calls.iter().zip(joined) {
            let response = match joined {
                Ok(response) => response,
                Err(e) => {
                    let err = AgentError::ToolFailed {
                        tool: call.name.clone(),
                        reason: format!("worker aborted: {e}"),
                    };
                    notifier.tool_error(call, &err.to_string());
                    failure_response(call, &err)
                }
            };
            results.push((call.clone(), response));
        }
        results
    }
}

async fn run_call(
    registry: &ToolRegistry,
    call: &ToolCallRequest,
    call_timeout: Duration,
    cancel: &CancellationToken,
) -> ToolResponse {
    let start = Instant::now();
    let outcome = tokio::select! {
        _ = cancel.cancelled() => Err(AgentError::Cancelled),
        r = invoke(registry, call, call_timeout) => r,
    };

    let (ok, label) = match &outcome {
        Ok(_) => (true, "ok"),
        Err(AgentError::ToolArgument { .. }) => (false, "invalid_arguments"),
        Err(AgentError::UnknownTool { .. }) => (false, "unknown_tool"),
        Err(AgentError::Timeout(_)) => (false, "timeout"),
        Err(AgentError::Cancelled) => (false, "cancelled"),
        Err(_) => (false, "error"),
    };
    let audit = json!({
        "event": "tool_audit",
        "tool": call.name,
        "call_id": call.id,
        "ok": ok,
        "outcome": label,
        "duration_ms": start.elapsed().as_millis() as u64,
        "args_preview": args_preview(&call.arguments),
    });
    tracing::info!(audit = %audit.to_string(), "tool");

    match outcome {
        Ok(text) => ToolResponse {
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            text,
            ok: true,
        },
        Err(err) => failure_response(call, &err),
    }
}

/// 查找工具、解析载荷、校验必填键、在截止时间内调用
async fn invoke(
    registry: &ToolRegistry,
    call: &ToolCallRequest,
    call_timeout: Duration,
) -> Result<String, AgentError> {
    let tool = registry.get(&call.name).ok_or_else(|| AgentError::UnknownTool {
        tool: call.name.clone(),
        available: registry.tool_names(),
    })?;
    let spec = tool.spec();

    let args = parse_arguments(&call.arguments).map_err(|reason| AgentError::ToolArgument {
        tool: call.name.clone(),
        reason,
        missing: Vec::new(),
        parameters: spec.parameters.clone(),
    })?;

    let missing: Vec<String> = spec
        .required_keys()
        .into_iter()
        .filter(|k| args.get(k).map(|v| v.is_null()).unwrap_or(true))
        .collect();
    if !missing.is_empty() {
        return Err(AgentError::ToolArgument {
            tool: call.name.clone(),
            reason: format!("missing required argument(s): {}", missing.join(", ")),
            missing,
            parameters: spec.parameters,
        });
    }

    match timeout(call_timeout, tool.call(args)).await {
        Ok(Ok(output)) => Ok(output.into_text()),
        Ok(Err(reason)) => Err(AgentError::ToolFailed {
            tool: call.name.clone(),
            reason,
        }),
        Err(_) => Err(AgentError::Timeout(format!(
            "tool {} did not finish within {}s",
            call.name,
            call_timeout.as_secs()
        ))),
    }
}

/// 空载荷视为 `{}`；必须是 JSON 对象
fn parse_arguments(raw: &str) -> Result<Value, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(json!({}));
    }
    let value: Value = serde_json::from_str(raw).map_err(|e| format!("arguments are not valid JSON: {e}"))?;
    if value.is_object() {
        Ok(value)
    } else {
        Err("arguments must be a JSON object".to_string())
    }
}

fn failure_response(call: &ToolCallRequest, err: &AgentError) -> ToolResponse {
    ToolResponse {
        call_id: call.id.clone(),
        tool_name: call.name.clone(),
        text: tool_diagnostic(err),
        ok: false,
    }
}

/// 结构化诊断文本（规范化 JSON）；缺参时点名缺失键并重述完整参数契约
pub fn tool_diagnostic(err: &AgentError) -> String {
    let value = match err {
        AgentError::ToolArgument {
            tool,
            reason,
            missing,
            parameters,
        } if !missing.is_empty() => json!({
            "error": "missing_argument",
            "tool": tool,
            "missing": missing,
            "message": format!("{reason}. Call `{tool}` again with every required argument."),
            "parameters": parameters,
        }),
        AgentError::ToolArgument {
            tool,
            reason,
            parameters,
            ..
        } => json!({
            "error": "invalid_arguments",
            "tool": tool,
            "message": reason,
            "parameters": parameters,
        }),
        AgentError::UnknownTool { tool, available } => json!({
            "error": "unknown_tool",
            "tool": tool,
            "message": format!("No tool named `{tool}` is available."),
            "available_tools": available,
        }),
        AgentError::ToolFailed { tool, reason } => json!({
            "error": "tool_failed",
            "tool": tool,
            "message": reason,
        }),
        AgentError::Timeout(what) => json!({
            "error": "timeout",
            "message": what,
        }),
        AgentError::Cancelled => json!({
            "error": "cancelled",
            "message": "the session was cancelled before this call finished",
        }),
        other => json!({
            "error": "internal",
            "message": other.to_string(),
        }),
    };
    value.to_string()
}

/// tool_diagnostic 可能产生的 error 取值
const DIAGNOSTIC_KINDS: &[&str] = &[
    "missing_argument",
    "invalid_arguments",
    "unknown_tool",
    "tool_failed",
    "timeout",
    "cancelled",
    "internal",
];

/// 若文本是 tool_diagnostic 生成的诊断，返回其中的 message
pub fn diagnostic_reason(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    let obj = value.as_object()?;
    let kind = obj.get("error")?.as_str()?;
    if !DIAGNOSTIC_KINDS.contains(&kind) {
        return None;
    }
    obj.get("message")?.as_str().map(String::from)
}

fn args_preview(args: &str) -> String {
    if args.chars().count() > 200 {
        format!("{}...", args.chars().take(200).collect::<String>())
    } else {
        args.to_string()
    }
}
