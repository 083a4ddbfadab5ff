//! Hosted 协议的 run 状态轮询
//!
//! queued / in_progress 间隔 `poll_interval` 后重新轮询；requires_action 取出内嵌的一批工具调用，
//! 经调度池执行后一次性提交全部 {call_id, output}，继续轮询；completed 拉取 thread 全部消息，
//! 只保留模型产出的消息并以空行连接；failed 与无法识别的状态是终止性错误。
//! 整个 run 有截止时间，并服从取消令牌。

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::core::{AgentError, Session, SettingsStore, LAST_THREAD_ID_KEY};
use crate::llm::{HostedProvider, RunState, ToolOutputSubmission};
use crate::memory::Message;
use crate::react::{AgentEvent, Notifier};
use crate::tools::ToolDispatchPool;

const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
const DEFAULT_RUN_DEADLINE_SECS: u64 = 600;

pub struct RunStatusPoller {
    provider: Arc<dyn HostedProvider>,
    pool: ToolDispatchPool,
    assistant_id: String,
    poll_interval: Duration,
    deadline: Duration,
}

impl RunStatusPoller {
    pub fn new(
        provider: Arc<dyn HostedProvider>,
        pool: ToolDispatchPool,
        assistant_id: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            pool,
            assistant_id: assistant_id.into(),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            deadline: Duration::from_secs(DEFAULT_RUN_DEADLINE_SECS),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// 取得本次使用的 thread：继续上次对话时读设置中的 id，否则新建并记录。
    /// 已失效的 id 不在此校验，只会在后续 run 中表现为普通失败。
    pub async fn open_thread(
        &self,
        settings: &dyn SettingsStore,
        continue_previous: bool,
    ) -> Result<String, AgentError> {
        if continue_previous {
            if let Some(thread_id) = settings.get(LAST_THREAD_ID_KEY)? {
                tracing::info!(thread = %thread_id, "continuing previous thread");
                return Ok(thread_id);
            }
            tracing::info!("no previous thread recorded, starting a new one");
        }
        let thread_id = self.provider.create_thread().await?;
        settings.set(LAST_THREAD_ID_KEY, &thread_id)?;
        tracing::info!(thread = %thread_id, "created thread");
        Ok(thread_id)
    }

    /// 把会话末尾的用户消息发到 thread、启动 run 并轮询到结束。
    /// 工具轮与最终回复同步记录进会话；错误以诊断性 assistant 消息结束。
    pub async fn exchange(
        &self,
        thread_id: &str,
        session: &mut Session,
        notifier: &Notifier,
        cancel: &CancellationToken,
    ) -> String {
        match self.start_and_poll(thread_id, session, notifier, cancel).await {
            Ok(answer) => answer,
            Err(e) => {
                tracing::warn!(thread = %thread_id, error = %e, "hosted run ended with error");
                let diagnostic = e.to_diagnostic();
                session.push(Message::assistant(diagnostic.clone()));
                notifier.emit(AgentEvent::AssistantMessage {
                    text: diagnostic.clone(),
                });
                diagnostic
            }
        }
    }

    async fn start_and_poll(
        &self,
        thread_id: &str,
        session: &mut Session,
        notifier: &Notifier,
        cancel: &CancellationToken,
    ) -> Result<String, AgentError> {
        let question = session.last_user_text().unwrap_or_default().to_string();
        self.provider.add_user_message(thread_id, &question).await?;
        let run_id = self.provider.create_run(thread_id, &self.assistant_id).await?;
        tracing::info!(thread = %thread_id, run = %run_id, "run created");
        self.poll(thread_id, &run_id, session, notifier, cancel).await
    }

    /// 驱动 run 状态机直到终止状态
    pub async fn poll(
        &self,
        thread_id: &str,
        run_id: &str,
        session: &mut Session,
        notifier: &Notifier,
        cancel: &CancellationToken,
    ) -> Result<String, AgentError> {
        let started = Instant::now();
        let mut last_state: Option<RunState> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            if started.elapsed() > self.deadline {
                return Err(AgentError::Timeout(format!(
                    "run {run_id} did not finish within {}s",
                    self.deadline.as_secs()
                )));
            }

            let status = self.provider.poll_run(thread_id, run_id).await?;
            if last_state.as_ref() != Some(&status.state) {
                tracing::debug!(run = %run_id, status = %status.state, "run status");
                notifier.emit(AgentEvent::RunStatus {
                    status: status.state.to_string(),
                });
                last_state = Some(status.state.clone());
            }

            match status.state {
                RunState::Queued | RunState::InProgress => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
                RunState::RequiresAction => {
                    let results = self
                        .pool
                        .dispatch(&status.required_calls, notifier, cancel)
                        .await;
                    let outputs: Vec<ToolOutputSubmission> = results
                        .iter()
                        .map(|(call, response)| ToolOutputSubmission {
                            tool_call_id: call.id.clone(),
                            output: response.text.clone(),
                        })
                        .collect();
                    session.append_tool_round(results);
                    tracing::info!(run = %run_id, outputs = outputs.len(), "submitting tool outputs");
                    self.provider
                        .submit_tool_outputs(thread_id, run_id, outputs)
                        .await?;
                }
                RunState::Completed => {
                    let messages = self.provider.list_messages(thread_id).await?;
                    let answer = messages
                        .into_iter()
                        .filter(|m| m.role == "assistant" && !m.text.trim().is_empty())
                        .map(|m| m.text)
                        .collect::<Vec<_>>()
                        .join("\n\n");
                    session.push(Message::assistant(answer.clone()));
                    notifier.emit(AgentEvent::AssistantMessage {
                        text: answer.clone(),
                    });
                    return Ok(answer);
                }
                RunState::Failed => {
                    return Err(AgentError::RunFailed {
                        status: RunState::Failed.to_string(),
                        message: status
                            .last_error
                            .unwrap_or_else(|| "no error detail reported".to_string()),
                    })
                }
                RunState::Unrecognized(other) => {
                    return Err(AgentError::RunFailed {
                        status: other,
                        message: status
                            .last_error
                            .unwrap_or_else(|| "run ended in an unrecognized state".to_string()),
                    })
                }
            }
        }
    }
}
