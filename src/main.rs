//! Scout 命令行入口
//!
//! 用法：scout [--continue] [--conversation <id>] [--no-planner] [--config <path>] <问题...>
//! 过程事件写到 stderr，最终回答写到 stdout。

use std::path::PathBuf;

use anyhow::{bail, Context};
use scout::config::load_config;
use scout::react::{AgentEvent, Notifier};
use scout::{Agent, AskOptions};
use tokio::sync::mpsc;

struct CliArgs {
    config_path: Option<PathBuf>,
    options: AskOptions,
    question: String,
}

fn parse_args(args: impl Iterator<Item = String>) -> anyhow::Result<CliArgs> {
    let mut config_path = None;
    let mut options = AskOptions::default();
    let mut words = Vec::new();
    let mut args = args;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--continue" => options.continue_previous = true,
            "--no-planner" => options.planner = false,
            "--conversation" => {
                options.conversation_id =
                    Some(args.next().context("--conversation needs an id")?);
            }
            "--config" => {
                config_path = Some(PathBuf::from(args.next().context("--config needs a path")?));
            }
            _ => words.push(arg),
        }
    }
    if words.is_empty() {
        bail!("usage: scout [--continue] [--conversation <id>] [--no-planner] [--config <path>] <question>");
    }
    Ok(CliArgs {
        config_path,
        options,
        question: words.join(" "),
    })
}

fn narrate(event: &AgentEvent) {
    match event {
        AgentEvent::ToolRequested { tool, args, .. } => eprintln!("→ {tool} {args}"),
        AgentEvent::ToolResult { tool, preview, .. } => eprintln!("← {tool}: {preview}"),
        AgentEvent::ToolError { tool, reason, .. } => eprintln!("✗ {tool}: {reason}"),
        AgentEvent::PlannerNote { phase, text } => eprintln!("[planner {phase:?}] {text}"),
        AgentEvent::Notice { label, detail } => eprintln!("{label}: {detail}"),
        AgentEvent::RunStatus { status } => eprintln!("run: {status}"),
        _ => {}
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    scout::observability::init();

    let mut cli = parse_args(std::env::args().skip(1))?;
    let cfg = load_config(cli.config_path.clone()).context("Failed to load config")?;
    let agent = Agent::from_config(cfg).context("Failed to create agent")?;

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    cli.options.notifier = Notifier::new().with_event_tx(event_tx);
    let printer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            narrate(&event);
        }
    });

    let cancel = cli.options.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let answer = agent
        .ask(&cli.question, cli.options)
        .await
        .context("Agent run failed")?;
    // options（含事件发送端）已随 ask 释放，等待叙述打印完
    let _ = printer.await;
    println!("{answer}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> impl Iterator<Item = String> {
        list.iter().map(|s| s.to_string()).collect::<Vec<_>>().into_iter()
    }

    #[test]
    fn test_parse_flags_and_question() {
        let cli = parse_args(args(&["--continue", "--conversation", "c1", "--no-planner", "list", "files"]))
            .unwrap();
        assert!(cli.options.continue_previous);
        assert!(!cli.options.planner);
        assert_eq!(cli.options.conversation_id.as_deref(), Some("c1"));
        assert_eq!(cli.question, "list files");
    }

    #[test]
    fn test_parse_requires_question() {
        assert!(parse_args(args(&["--continue"])).is_err());
        assert!(parse_args(args(&["--conversation"])).is_err());
    }
}
