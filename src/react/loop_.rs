//! 主循环（Turn Engine）
//!
//! 带完整历史与工具 spec 请求模型 -> 文本回复则追加并结束；工具调用则交给调度池执行整批、
//! 按请求顺序合并回会话，再开始下一轮。Provider 错误转为诊断性 assistant 回复并结束，不自动重试。
//! 可选挂载 PlannerController：INITIAL / CHECKIN / FINISH 三个检查点包裹本循环。

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::core::{AgentError, Session};
use crate::llm::{ChatProvider, ChatReply, ChatRequest};
use crate::memory::Message;
use crate::react::planner::{is_testing_request, CheckinOutcome, PlannerController};
use crate::react::{AgentEvent, Notifier};
use crate::tools::ToolDispatchPool;

/// 单次交互内默认最大 turn 数，防止死循环
pub const MAX_TURNS: usize = 20;

/// Turn Engine：Provider + 工具调度池 + 可选 planner
#[derive(Clone)]
pub struct TurnEngine {
    provider: Arc<dyn ChatProvider>,
    pool: ToolDispatchPool,
    max_turns: usize,
    max_tokens: Option<u32>,
    planner: Option<Arc<PlannerController>>,
}

impl TurnEngine {
    pub fn new(provider: Arc<dyn ChatProvider>, pool: ToolDispatchPool) -> Self {
        Self {
            provider,
            pool,
            max_turns: MAX_TURNS,
            max_tokens: None,
            planner: None,
        }
    }

    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns.max(1);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_planner(mut self, planner: Arc<PlannerController>) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn pool(&self) -> &ToolDispatchPool {
        &self.pool
    }

    /// 驱动会话直到得到最终回复；Provider 错误、取消、turn 超限都以诊断性 assistant 消息结束。
    /// 调用前会话末尾应已有本次的 user 消息。
    pub async fn run(
        &self,
        session: &mut Session,
        notifier: &Notifier,
        cancel: &CancellationToken,
    ) -> String {
        let planner = self.active_planner(session);
        if let Some(planner) = planner {
            planner.initial(session, notifier, cancel).await;
        }
        match self.turns(session, notifier, cancel, planner).await {
            Ok(answer) => answer,
            Err(e) => {
                tracing::warn!(session = %session.id, error = %e, "session ended with error");
                let diagnostic = e.to_diagnostic();
                session.push(Message::assistant(diagnostic.clone()));
                notifier.emit(AgentEvent::AssistantMessage {
                    text: diagnostic.clone(),
                });
                diagnostic
            }
        }
    }

    /// 不挂 planner、错误直接返回；供规划子 agent 等嵌套调用使用
    pub async fn try_run(
        &self,
        session: &mut Session,
        notifier: &Notifier,
        cancel: &CancellationToken,
    ) -> Result<String, AgentError> {
        self.turns(session, notifier, cancel, None).await
    }

    fn active_planner(&self, session: &Session) -> Option<&PlannerController> {
        let planner = self.planner.as_deref()?;
        if !session.planner_enabled {
            return None;
        }
        if session.last_user_text().map(is_testing_request).unwrap_or(false) {
            tracing::debug!(session = %session.id, "testing request, planner disabled");
            return None;
        }
        Some(planner)
    }

    async fn turns(
        &self,
        session: &mut Session,
        notifier: &Notifier,
        cancel: &CancellationToken,
        planner: Option<&PlannerController>,
    ) -> Result<String, AgentError> {
        let mut withhold_tools = false;
        let mut checkins = 0;

        for turn in 0..self.max_turns {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            notifier.emit(AgentEvent::TurnStarted { turn });

            let request = ChatRequest {
                model: session.model.clone(),
                messages: session.messages().to_vec(),
                tools: if withhold_tools {
                    Vec::new()
                } else {
                    session.tools.clone()
                },
                max_tokens: self.max_tokens,
            };
            let response = tokio::select! {
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                r = self.provider.chat(request) => r?,
            };

            if let Some(usage) = response.usage {
                session.record_usage(usage);
                let total = session.usage();
                notifier.emit(AgentEvent::TokenUsage {
                    prompt_tokens: total.prompt_tokens,
                    completion_tokens: total.completion_tokens,
                    budget: session.token_budget,
                });
                if session.over_budget() {
                    tracing::warn!(
                        session = %session.id,
                        used = total.total(),
                        budget = ?session.token_budget,
                        "advisory token budget exceeded"
                    );
                }
            }

            let calls = match response.reply {
                ChatReply::ToolCalls(calls) if !calls.is_empty() => calls,
                ChatReply::ToolCalls(_) => {
                    return Ok(self.finish(session, String::new(), notifier, cancel, planner).await)
                }
                ChatReply::Text(text) => {
                    return Ok(self.finish(session, text, notifier, cancel, planner).await)
                }
            };

            tracing::info!(session = %session.id, turn, calls = calls.len(), "dispatching tool round");
            let results = self.pool.dispatch(&calls, notifier, cancel).await;
            session.append_tool_round(results);

            withhold_tools = false;
            if let Some(planner) = planner {
                checkins += 1;
                if planner.checkin(session, checkins, notifier, cancel).await
                    == CheckinOutcome::ProceedToAnswer
                {
                    withhold_tools = true;
                }
            }
        }

        Err(AgentError::Timeout(format!(
            "no final answer after {} turns",
            self.max_turns
        )))
    }

    async fn finish(
        &self,
        session: &mut Session,
        text: String,
        notifier: &Notifier,
        cancel: &CancellationToken,
        planner: Option<&PlannerController>,
    ) -> String {
        session.push(Message::assistant(text.clone()));
        notifier.emit(AgentEvent::AssistantMessage { text: text.clone() });
        if let Some(planner) = planner {
            planner.finish(session, notifier, cancel).await;
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatResponse, LlmError, ScriptedChatProvider, Usage};
    use crate::memory::ToolCallRequest;
    use crate::tools::{EchoTool, ToolRegistry};

    fn engine(provider: Arc<ScriptedChatProvider>) -> TurnEngine {
        let registry = ToolRegistry::new().with(EchoTool);
        TurnEngine::new(provider, ToolDispatchPool::new(registry, 4, 5))
    }

    fn session() -> Session {
        let specs = ToolRegistry::new().with(EchoTool).specs();
        let mut s = Session::new("test-model", "sys").with_tools(specs);
        s.push(Message::user("say hi"));
        s
    }

    #[tokio::test]
    async fn test_text_reply_ends_loop() {
        let provider = Arc::new(ScriptedChatProvider::new(vec![Ok(ChatResponse::text("hi"))]));
        let mut s = session();
        let answer = engine(provider.clone())
            .run(&mut s, &Notifier::new(), &CancellationToken::new())
            .await;
        assert_eq!(answer, "hi");
        assert_eq!(s.messages().len(), 3);
        assert_eq!(provider.request_count(), 1);
        assert_eq!(provider.requests()[0].tools.len(), 1);
    }

    #[tokio::test]
    async fn test_tool_round_then_answer() {
        let provider = Arc::new(ScriptedChatProvider::new(vec![
            Ok(ChatResponse::tool_calls(vec![ToolCallRequest::new(
                "c1",
                "echo",
                r#"{"text":"ping"}"#,
            )])),
            Ok(ChatResponse::text("got ping")),
        ]));
        let mut s = session();
        let answer = engine(provider.clone())
            .run(&mut s, &Notifier::new(), &CancellationToken::new())
            .await;
        assert_eq!(answer, "got ping");
        assert_eq!(s.messages()[3], Message::tool("c1", "echo", "ping"));
        // 第二次请求带上了工具结果
        assert_eq!(provider.requests()[1].messages.len(), 4);
        assert!(crate::core::check_tool_pairing(s.messages()).is_ok());
    }

    #[tokio::test]
    async fn test_provider_error_becomes_diagnostic_answer() {
        let provider = Arc::new(ScriptedChatProvider::new(vec![Err(LlmError::Api {
            status: Some(429),
            code: Some("rate_limit".to_string()),
            message: "slow down".to_string(),
        })]));
        let mut s = session();
        let answer = engine(provider.clone())
            .run(&mut s, &Notifier::new(), &CancellationToken::new())
            .await;
        assert!(answer.contains("429"));
        assert!(answer.contains("rate_limit"));
        assert_eq!(s.last_answer(), Some(answer.as_str()));
        // 不重试
        assert_eq!(provider.request_count(), 1);
    }

    #[tokio::test]
    async fn test_max_turns_guard() {
        let call = || {
            Ok(ChatResponse::tool_calls(vec![ToolCallRequest::new(
                "c",
                "echo",
                r#"{"text":"again"}"#,
            )]))
        };
        let provider = Arc::new(ScriptedChatProvider::new(vec![call(), call(), call()]));
        let mut s = session();
        let answer = engine(provider.clone())
            .with_max_turns(2)
            .run(&mut s, &Notifier::new(), &CancellationToken::new())
            .await;
        assert!(answer.contains("2 turns"));
        assert_eq!(provider.request_count(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_turn() {
        let provider = Arc::new(ScriptedChatProvider::new(vec![Ok(ChatResponse::text("hi"))]));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut s = session();
        let answer = engine(provider.clone())
            .run(&mut s, &Notifier::new(), &cancel)
            .await;
        assert!(answer.contains("cancelled"));
        assert_eq!(provider.request_count(), 0);
    }

    #[tokio::test]
    async fn test_usage_is_accumulated_and_reported() {
        let mut reply = ChatResponse::text("hi");
        reply.usage = Some(Usage {
            prompt_tokens: 30,
            completion_tokens: 5,
        });
        let provider = Arc::new(ScriptedChatProvider::new(vec![Ok(reply)]));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut s = session().with_token_budget(Some(10));
        engine(provider)
            .run(&mut s, &Notifier::new().with_event_tx(tx), &CancellationToken::new())
            .await;
        assert!(s.over_budget());
        let mut saw_usage = false;
        while let Ok(ev) = rx.try_recv() {
            if let AgentEvent::TokenUsage { prompt_tokens, budget, .. } = ev {
                assert_eq!(prompt_tokens, 30);
                assert_eq!(budget, Some(10));
                saw_usage = true;
            }
        }
        assert!(saw_usage);
    }
}
