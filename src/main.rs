//! waypoint 命令行入口
//!
//! 初始化日志与配置，组装 Agent，然后执行子命令：
//! send（发送一条消息）、replay（从检查点恢复）、sessions、history、checkpoints。
//! 模型增量输出写到 stdout，日志写到 stderr。

use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use waypoint::memory::Message;
use waypoint::react::AgentEvent;
use waypoint::{load_config, observability, Agent, TurnOutcome};

/// Checkpointed, resumable tool-calling agent
#[derive(Parser, Debug)]
#[command(name = "waypoint")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Extra configuration file layered over config/default.toml
    #[arg(short, long, global = true, env = "WAYPOINT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Send a user message, starting a new session unless --session is given
    Send {
        /// Message text
        message: String,

        /// Continue an existing session
        #[arg(short, long)]
        session: Option<String>,

        /// Wait for the complete reply instead of streaming it
        #[arg(long)]
        no_stream: bool,
    },

    /// Resume a session from one of its checkpoints
    Replay {
        /// Session id
        session: String,

        /// Checkpoint sequence number
        sequence: u64,
    },

    /// List all sessions with at least one checkpoint
    Sessions,

    /// Print the transcript of a session's latest checkpoint
    History {
        /// Session id
        session: String,
    },

    /// List the checkpoints of a session
    Checkpoints {
        /// Session id
        session: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    observability::init();

    let cli = Cli::parse();
    let mut cfg = load_config(cli.config.clone()).context("Failed to load config")?;
    if let Commands::Send { no_stream: true, .. } = &cli.command {
        cfg.llm.streaming = false;
    }

    let agent = Agent::from_config(&cfg)
        .await
        .context("Failed to create agent")?;
    let agent = &agent;

    match cli.command {
        Commands::Send {
            message, session, ..
        } => {
            let outcome = run_with_events(agent, |tx| async move {
                agent.send(&message, session.as_deref(), Some(&tx)).await
            })
            .await?;
            eprintln!("session: {}", outcome.session_id);
        }
        Commands::Replay { session, sequence } => {
            let outcome = run_with_events(agent, |tx| async move {
                agent.replay(&session, sequence, Some(&tx)).await
            })
            .await?;
            eprintln!("session: {}", outcome.session_id);
        }
        Commands::Sessions => {
            for id in agent.list_sessions().await? {
                println!("{id}");
            }
        }
        Commands::History { session } => {
            for message in agent.history(&session).await? {
                print_message(&message);
            }
        }
        Commands::Checkpoints { session } => {
            for summary in agent.checkpoints(&session).await? {
                println!(
                    "{:>4}  {:<9}  {:>3} msgs  {}",
                    summary.sequence_number,
                    summary.next_action.as_str(),
                    summary.message_count,
                    summary.created_at.to_rfc3339()
                );
            }
        }
    }
    Ok(())
}

/// 运行一轮：后台打印事件，Ctrl+C 取消
async fn run_with_events<'a, F, Fut>(agent: &'a Agent, run: F) -> anyhow::Result<TurnOutcome>
where
    F: FnOnce(mpsc::UnboundedSender<AgentEvent>) -> Fut,
    Fut: std::future::Future<Output = Result<TurnOutcome, waypoint::AgentError>> + 'a,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(print_events(rx));

    let result = tokio::select! {
        result = run(tx) => result,
        _ = tokio::signal::ctrl_c() => {
            agent.cancel();
            Err(waypoint::AgentError::Cancelled)
        }
    };
    // 发送端已随 future 一起 drop，打印任务随后结束
    let streamed = printer.await.unwrap_or(false);

    let outcome = result.context("Turn failed")?;
    if !streamed {
        println!("{}", outcome.answer);
    }
    Ok(outcome)
}

/// 打印事件；返回是否输出过流式增量
async fn print_events(mut rx: mpsc::UnboundedReceiver<AgentEvent>) -> bool {
    let mut streamed = false;
    let mut stdout = std::io::stdout();
    while let Some(event) = rx.recv().await {
        match event {
            AgentEvent::ModelDelta { text } => {
                streamed = true;
                let _ = write!(stdout, "{text}");
                let _ = stdout.flush();
            }
            AgentEvent::ToolStarted { tool, args, .. } => {
                eprintln!("[tool] {tool} {args}");
            }
            AgentEvent::ToolFinished {
                tool,
                is_error,
                preview,
                ..
            } => {
                let mark = if is_error { "error" } else { "ok" };
                eprintln!("[tool] {tool} -> {mark}: {preview}");
            }
            AgentEvent::AssistantMessage { .. } if streamed => {
                let _ = writeln!(stdout);
            }
            AgentEvent::Checkpointed {
                sequence_number,
                next_action,
            } => {
                tracing::debug!(sequence_number, %next_action, "checkpointed");
            }
            AgentEvent::Error { text } => {
                eprintln!("[error] {text}");
            }
            _ => {}
        }
    }
    streamed
}

fn print_message(message: &Message) {
    match message {
        Message::User(m) => println!("user: {}", m.content),
        Message::Assistant(m) => {
            println!("assistant: {}", m.content);
            for request in &m.tool_requests {
                println!("  -> {}({}) [{}]", request.tool_name, request.arguments, request.request_id);
            }
        }
        Message::Tool(r) => {
            let mark = if r.is_error { " (error)" } else { "" };
            println!("tool {} [{}]{}: {}", r.tool_name, r.request_id, mark, r.content);
        }
    }
}
