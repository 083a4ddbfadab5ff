//! Planner 检查点：规划子 agent 包裹主循环
//!
//! INITIAL（首轮之前）注入研究计划（user 消息）；CHECKIN（每个工具轮之后、下一轮之前）注入指导（user 消息），
//! 指导中含 `PROCEED_TO_ANSWER` 时下一轮不提供工具；FINISH（得到最终文本回复之后）注入持久笔记（system 消息）。
//! 每个检查点都是一次独立的嵌套 TurnEngine 调用：独立的小工具集与 system prompt、全新的小会话、planner 关闭。
//! 注入的消息带 `[planner:<phase>]` 标记，回放时据此识别为 planner 笔记。

use std::path::Path;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::PlannerSection;
use crate::core::Session;
use crate::memory::{AssistantContent, Message};
use crate::react::{AgentEvent, Notifier, TurnEngine};
use crate::tools::{ListFilesTool, ReadFileTool, ToolRegistry};

/// 指导中出现即表示「可以作答」
pub const PROCEED_MARKER: &str = "PROCEED_TO_ANSWER";
/// 用户消息以此开头（忽略大小写与前导空白）时强制关闭 planner
pub const TESTING_PREFIX: &str = "testing:";
/// 摘要中单个工具结果最大字符数
const DIGEST_RESULT_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlannerPhase {
    Initial,
    Checkin,
    Finish,
}

impl PlannerPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlannerPhase::Initial => "initial",
            PlannerPhase::Checkin => "checkin",
            PlannerPhase::Finish => "finish",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "initial" => Some(PlannerPhase::Initial),
            "checkin" => Some(PlannerPhase::Checkin),
            "finish" => Some(PlannerPhase::Finish),
            _ => None,
        }
    }
}

/// 给注入内容加上阶段标记
pub fn planner_tag(phase: PlannerPhase, text: &str) -> String {
    format!("[planner:{}]\n{}", phase.as_str(), text)
}

/// 识别带标记的 planner 笔记，返回 (阶段, 正文)
pub fn parse_planner_note(text: &str) -> Option<(PlannerPhase, &str)> {
    let rest = text.strip_prefix("[planner:")?;
    let end = rest.find(']')?;
    let phase = PlannerPhase::parse(&rest[..end])?;
    let body = &rest[end + 1..];
    Some((phase, body.strip_prefix('\n').unwrap_or(body)))
}

pub fn is_testing_request(text: &str) -> bool {
    text.trim_start()
        .get(..TESTING_PREFIX.len())
        .map(|p| p.eq_ignore_ascii_case(TESTING_PREFIX))
        .unwrap_or(false)
}

/// 规划子 agent 的默认工具集：只读文件
pub fn planner_registry(workspace_root: impl AsRef<Path>) -> ToolRegistry {
    let root = workspace_root.as_ref();
    ToolRegistry::new()
        .with(ListFilesTool::new(root))
        .with(ReadFileTool::new(root))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannerPrompts {
    pub initial: String,
    pub checkin: String,
    pub finish: String,
}

impl From<&PlannerSection> for PlannerPrompts {
    fn from(section: &PlannerSection) -> Self {
        Self {
            initial: section.initial_prompt.clone(),
            checkin: section.checkin_prompt.clone(),
            finish: section.finish_prompt.clone(),
        }
    }
}

impl Default for PlannerPrompts {
    fn default() -> Self {
        (&PlannerSection::default()).into()
    }
}

/// CHECKIN 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckinOutcome {
    /// 超出次数上限或子 agent 失败，未注入
    Skipped,
    Continue,
    /// 下一轮不提供工具，模型必须文本作答
    ProceedToAnswer,
}

/// Planner 检查点控制器：持有嵌套 TurnEngine（不再挂 planner）与三段 prompt
pub struct PlannerController {
    engine: TurnEngine,
    model: String,
    prompts: PlannerPrompts,
    max_checkins: usize,
}

impl PlannerController {
    pub fn new(engine: TurnEngine, model: impl Into<String>) -> Self {
        Self {
            engine,
            model: model.into(),
            prompts: PlannerPrompts::default(),
            max_checkins: 8,
        }
    }

    pub fn with_prompts(mut self, prompts: PlannerPrompts) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn with_max_checkins(mut self, max_checkins: usize) -> Self {
        self.max_checkins = max_checkins;
        self
    }

    pub fn max_checkins(&self) -> usize {
        self.max_checkins
    }

    /// INITIAL：注入研究计划
    pub async fn initial(&self, session: &mut Session, notifier: &Notifier, cancel: &CancellationToken) {
        let digest = digest(session.messages());
        if let Some(plan) = self
            .consult(PlannerPhase::Initial, &self.prompts.initial, digest, cancel)
            .await
        {
            inject(session, notifier, PlannerPhase::Initial, plan);
        }
    }

    /// CHECKIN：第 `round` 个工具轮之后的指导；超过上限后为空操作
    pub async fn checkin(
        &self,
        session: &mut Session,
        round: usize,
        notifier: &Notifier,
        cancel: &CancellationToken,
    ) -> CheckinOutcome {
        if round > self.max_checkins {
            return CheckinOutcome::Skipped;
        }
        let digest = digest(session.messages());
        let Some(guidance) = self
            .consult(PlannerPhase::Checkin, &self.prompts.checkin, digest, cancel)
            .await
        else {
            return CheckinOutcome::Skipped;
        };
        let proceed = guidance.contains(PROCEED_MARKER);
        inject(session, notifier, PlannerPhase::Checkin, guidance);
        if proceed {
            tracing::info!(session = %session.id, round, "planner says proceed to answer");
            CheckinOutcome::ProceedToAnswer
        } else {
            CheckinOutcome::Continue
        }
    }

    /// FINISH：注入持久笔记（system 角色，不参与面向用户的叙述）
    pub async fn finish(&self, session: &mut Session, notifier: &Notifier, cancel: &CancellationToken) {
        let digest = digest(session.messages());
        if let Some(notes) = self
            .consult(PlannerPhase::Finish, &self.prompts.finish, digest, cancel)
            .await
        {
            inject(session, notifier, PlannerPhase::Finish, notes);
        }
    }

    async fn consult(
        &self,
        phase: PlannerPhase,
        prompt: &str,
        digest: String,
        cancel: &CancellationToken,
    ) -> Option<String> {
        let mut sub = Session::new(self.model.clone(), prompt)
            .with_tools(self.engine.pool().registry().specs())
            .with_planner(false);
        sub.push(Message::user(digest));

        // 嵌套的 TurnEngine 会再次经过 finish，递归 future 需要装箱
        let silent = Notifier::new();
        let nested = Box::pin(self.engine.try_run(&mut sub, &silent, cancel));
        match nested.await {
            Ok(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
            Ok(_) => {
                tracing::debug!(phase = phase.as_str(), "planner returned nothing");
                None
            }
            Err(e) => {
                tracing::warn!(phase = phase.as_str(), error = %e, "planner checkpoint failed");
                None
            }
        }
    }
}

fn inject(session: &mut Session, notifier: &Notifier, phase: PlannerPhase, text: String) {
    let tagged = planner_tag(phase, &text);
    match phase {
        PlannerPhase::Finish => session.push(Message::system(tagged)),
        PlannerPhase::Initial | PlannerPhase::Checkin => session.push(Message::user(tagged)),
    }
    notifier.emit(AgentEvent::PlannerNote { phase, text });
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        format!("{}...[truncated]", text.chars().take(max).collect::<String>())
    } else {
        text.to_string()
    }
}

/// 主会话的紧凑摘要：用户问题、planner 笔记、工具调用与截断后的结果、assistant 回复
pub fn digest(messages: &[Message]) -> String {
    let mut lines = Vec::new();
    for message in messages.iter().skip(1) {
        match message {
            Message::System { .. } => {}
            Message::User { text } => match parse_planner_note(text) {
                Some((phase, note)) => lines.push(format!("Planner ({}): {}", phase.as_str(), note)),
                None => lines.push(format!("User: {text}")),
            },
            Message::Assistant(AssistantContent::Text(text)) => {
                lines.push(format!("Assistant: {text}"))
            }
            Message::Assistant(AssistantContent::ToolCalls { calls, .. }) => {
                for call in calls {
                    lines.push(format!("Tool call: {}({})", call.name, call.arguments));
                }
            }
            Message::Tool { tool_name, text, .. } => lines.push(format!(
                "Result of {tool_name}: {}",
                truncate(text, DIGEST_RESULT_CHARS)
            )),
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::llm::{ChatResponse, LlmError, ScriptedChatProvider};
    use crate::memory::ToolCallRequest;
    use crate::tools::{EchoTool, ToolDispatchPool};

    fn controller(provider: Arc<ScriptedChatProvider>) -> PlannerController {
        let engine = TurnEngine::new(provider, ToolDispatchPool::new(ToolRegistry::new(), 2, 5));
        PlannerController::new(engine, "planner-model").with_max_checkins(1)
    }

    fn main_engine(main: Arc<ScriptedChatProvider>, planner: PlannerController) -> TurnEngine {
        let registry = ToolRegistry::new().with(EchoTool);
        TurnEngine::new(main, ToolDispatchPool::new(registry, 4, 5)).with_planner(Arc::new(planner))
    }

    fn session(question: &str) -> Session {
        let mut s = Session::new("main-model", "sys")
            .with_tools(ToolRegistry::new().with(EchoTool).specs())
            .with_planner(true);
        s.push(Message::user(question));
        s
    }

    fn echo_call(id: &str) -> Result<ChatResponse, LlmError> {
        Ok(ChatResponse::tool_calls(vec![ToolCallRequest::new(
            id,
            "echo",
            r#"{"text":"x"}"#,
        )]))
    }

    #[test]
    fn test_tag_round_trip() {
        let tagged = planner_tag(PlannerPhase::Checkin, "look at src/");
        assert_eq!(
            parse_planner_note(&tagged),
            Some((PlannerPhase::Checkin, "look at src/"))
        );
        assert_eq!(parse_planner_note("[planner:other]\nx"), None);
        assert_eq!(parse_planner_note("plain question"), None);
    }

    #[test]
    fn test_testing_prefix() {
        assert!(is_testing_request("Testing: list 3 files"));
        assert!(is_testing_request("  TESTING:go"));
        assert!(!is_testing_request("test: nope"));
        assert!(!is_testing_request("this is testing: not a prefix"));
        assert!(!is_testing_request("测试"));
    }

    #[tokio::test]
    async fn test_three_checkpoints_inject_notes() {
        let planner_llm = Arc::new(ScriptedChatProvider::new(vec![
            Ok(ChatResponse::text("1. echo something")),
            Ok(ChatResponse::text("PROCEED_TO_ANSWER enough data")),
            Ok(ChatResponse::text("echo works")),
        ]));
        let main = Arc::new(ScriptedChatProvider::new(vec![
            echo_call("c1"),
            Ok(ChatResponse::text("done")),
        ]));
        let engine = main_engine(main.clone(), controller(planner_llm.clone()));
        let mut s = session("what does echo do?");
        let answer = engine.run(&mut s, &Notifier::new(), &CancellationToken::new()).await;

        assert_eq!(answer, "done");
        assert_eq!(planner_llm.request_count(), 3);
        let msgs = s.messages();
        assert_eq!(msgs[2], Message::user("[planner:initial]\n1. echo something"));
        assert!(matches!(&msgs[5], Message::User { text } if text.starts_with("[planner:checkin]")));
        assert_eq!(msgs.last(), Some(&Message::system("[planner:finish]\necho works")));
        // PROCEED_TO_ANSWER 之后的主轮不带工具
        assert!(!main.requests()[0].tools.is_empty());
        assert!(main.requests()[1].tools.is_empty());
        // 最终回复仍是主模型的文本
        assert_eq!(s.last_answer(), Some("done"));
    }

    #[tokio::test]
    async fn test_testing_sentinel_disables_planner() {
        let planner_llm = Arc::new(ScriptedChatProvider::new(vec![]));
        let main = Arc::new(ScriptedChatProvider::new(vec![Ok(ChatResponse::text("ok"))]));
        let engine = main_engine(main, controller(planner_llm.clone()));
        let mut s = session("testing: quick");
        engine.run(&mut s, &Notifier::new(), &CancellationToken::new()).await;
        assert_eq!(planner_llm.request_count(), 0);
        assert_eq!(s.messages().len(), 3);
    }

    #[tokio::test]
    async fn test_failed_planner_injects_nothing_and_checkins_are_capped() {
        // 全部 planner 请求都失败（脚本耗尽）
        let planner_llm = Arc::new(ScriptedChatProvider::new(vec![]));
        let main = Arc::new(ScriptedChatProvider::new(vec![
            echo_call("c1"),
            echo_call("c2"),
            Ok(ChatResponse::text("done")),
        ]));
        let engine = main_engine(main.clone(), controller(planner_llm.clone()));
        let mut s = session("loop twice");
        let answer = engine.run(&mut s, &Notifier::new(), &CancellationToken::new()).await;

        assert_eq!(answer, "done");
        // initial + 1 次 checkin（上限 1）+ finish
        assert_eq!(planner_llm.request_count(), 3);
        assert!(s
            .messages()
            .iter()
            .all(|m| m.text().map(|t| parse_planner_note(t).is_none()).unwrap_or(true)));
        assert!(main.requests().iter().all(|r| !r.tools.is_empty()));
    }

    #[test]
    fn test_digest_skips_system_and_truncates_results() {
        let messages = vec![
            Message::system("sys"),
            Message::user("question"),
            Message::tool_calls(vec![ToolCallRequest::new("c1", "read_file", r#"{"path":"a"}"#)]),
            Message::tool("c1", "read_file", "y".repeat(800)),
            Message::system("[planner:finish]\nnotes"),
        ];
        let d = digest(&messages);
        assert!(d.starts_with("User: question"));
        assert!(d.contains(r#"Tool call: read_file({"path":"a"})"#));
        assert!(d.contains("...[truncated]"));
        assert!(!d.contains("sys"));
        assert!(!d.contains("notes"));
    }
}
