//! CLI entry point for the assistant relay.

use std::future::Future;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use colored::Colorize;
use dotenvy::dotenv;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tokio::sync::mpsc;

mod assistant;
mod auth;
mod client;
mod config;
mod core;
mod error_taxonomy;
mod errors;
mod executor;
mod frame;
mod logging;
mod models;
mod orchestrator;
mod registry;
mod report;
mod runtime_api;
mod tool_roundtrip;
mod utils;

use crate::client::{RelayClient, RelayTransport};
use crate::config::Config;
use crate::core::{Conversation, ConversationEvent, ConversationSettings, StopHandle, TurnOutcome};
use crate::executor::{CommandToolExecutor, NoopToolExecutor, ToolExecutor};
use crate::runtime_api::RuntimeApiOptions;
use crate::utils::mask_secret;

#[derive(Parser, Debug)]
#[command(
    name = "assistant-relay",
    author,
    version,
    about = "Streaming relay between chat clients and a tool-calling assistant"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Config profile name
    #[arg(long, global = true)]
    profile: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug, Clone)]
enum Commands {
    /// Run the relay HTTP server
    Serve(ServeArgs),
    /// Chat with an assistant through a running relay
    Chat(ChatArgs),
    /// Print the resolved configuration
    Doctor,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args, Debug, Clone)]
struct ServeArgs {
    /// Bind host (overrides config)
    #[arg(long)]
    host: Option<String>,
    /// Bind port (overrides config)
    #[arg(long)]
    port: Option<u16>,
}

#[derive(Args, Debug, Clone, Default)]
struct ChatArgs {
    /// Model requested for the session
    #[arg(long)]
    model: Option<String>,
    /// Assistant greeting shown before the first message
    #[arg(long)]
    intro: Option<String>,
    /// System prompt for the session
    #[arg(long)]
    prompt: Option<String>,
    /// Command run for each tool call (descriptor JSON on stdin)
    #[arg(long)]
    tool_command: Option<String>,
    /// Room to attach the session to
    #[arg(long)]
    room: Option<String>,
    /// Resume an existing relay session
    #[arg(long)]
    session: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match cli.command.clone() {
        Commands::Serve(args) => {
            let config = load_config_from_cli(&cli)?;
            let options = RuntimeApiOptions {
                host: args.host.unwrap_or_else(|| config.server_host()),
                port: args.port.unwrap_or_else(|| config.server_port()),
            };
            runtime_api::run_http_server(config, options).await
        }
        Commands::Chat(args) => {
            let config = load_config_from_cli(&cli)?;
            run_chat(&config, args).await
        }
        Commands::Doctor => run_doctor(&cli),
        Commands::Completions { shell } => {
            generate_completions(shell);
            Ok(())
        }
    }
}

fn load_config_from_cli(cli: &Cli) -> Result<Config> {
    let profile = cli
        .profile
        .clone()
        .or_else(|| std::env::var("ASSISTANT_RELAY_PROFILE").ok());
    Config::load(cli.config.clone(), profile.as_deref())
}

/// Generate shell completions for the given shell
fn generate_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut io::stdout());
}

// === Doctor ===

fn run_doctor(cli: &Cli) -> Result<()> {
    println!("{}", "assistant-relay doctor".bold());
    println!("{}", "======================".dimmed());
    println!("  version: {}", env!("CARGO_PKG_VERSION"));
    println!();

    println!("{}", "Configuration:".bold());
    match config::resolve_load_config_path(cli.config.clone()) {
        Some(path) if path.exists() => {
            println!("  {} config found at {}", "✓".green(), path.display());
        }
        Some(path) => {
            println!(
                "  {} no config at {} (using defaults)",
                "!".yellow(),
                path.display()
            );
        }
        None => println!("  {} no config path resolved", "!".yellow()),
    }

    let config = match load_config_from_cli(cli) {
        Ok(config) => config,
        Err(err) => {
            println!("  {} {err:#}", "✗".red());
            return Ok(());
        }
    };

    let secret = |value: Option<&str>| match value.filter(|v| !v.is_empty()) {
        Some(value) => mask_secret(value),
        None => "(not set)".dimmed().to_string(),
    };

    println!();
    println!("{}", "Assistant service:".bold());
    println!("  base_url: {}", config.base_url());
    println!("  api_key: {}", secret(config.api_key.as_deref()));
    println!("  default_model: {}", config.default_model());
    println!("  assistant_name: {}", config.assistant_name());
    match config.tools_file() {
        Some(path) => match config::load_tool_definitions(&path) {
            Ok(tools) => println!("  tools: {} from {}", tools.len(), path.display()),
            Err(err) => println!("  tools: {} {err:#}", "✗".red()),
        },
        None => println!("  tools: (none)"),
    }

    println!();
    println!("{}", "Relay:".bold());
    println!(
        "  listen: {}:{}",
        config.server_host(),
        config.server_port()
    );
    println!("  secret_key: {}", secret(config.secret_key.as_deref()));
    println!(
        "  site_password: {}",
        secret(config.site_password.as_deref())
    );
    println!(
        "  signature_window: {}s",
        config.signature_window().as_secs()
    );
    println!(
        "  resource_max_age: {}h",
        config.resource_max_age().as_secs() / 3600
    );
    println!("  upload_dir: {}", config.upload_dir().display());
    println!("  sink_capacity: {}", config.sink_capacity());
    match config.report_settings() {
        Some(report) => println!(
            "  reports: {} -> {} (key {})",
            report.from,
            report.to,
            mask_secret(&report.api_key)
        ),
        None => println!("  reports: {}", "disabled".dimmed()),
    }

    println!();
    println!("{}", "Chat client:".bold());
    println!("  relay: {}", config.client_base_url());
    println!(
        "  tool_command: {}",
        config
            .client_tool_command()
            .unwrap_or_else(|| "(none)".to_string())
    );
    if config.secret_key.is_none() {
        println!(
            "\n  {} no secret_key: requests are not signed",
            "!".yellow()
        );
    }
    Ok(())
}

// === Chat ===

#[derive(Debug, Clone, PartialEq, Eq)]
enum ChatCommand {
    Send(String),
    Retry,
    Clear,
    Report(String),
    Export(Option<PathBuf>),
    Help,
    Quit,
    Unknown(String),
}

impl ChatCommand {
    fn parse(line: &str) -> Self {
        let line = line.trim();
        let Some(rest) = line.strip_prefix('/') else {
            return ChatCommand::Send(line.to_string());
        };
        let (name, arg) = match rest.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (rest, ""),
        };
        match name {
            "retry" => ChatCommand::Retry,
            "clear" => ChatCommand::Clear,
            "report" => ChatCommand::Report(arg.to_string()),
            "export" => ChatCommand::Export(Some(arg).filter(|a| !a.is_empty()).map(PathBuf::from)),
            "help" => ChatCommand::Help,
            "quit" | "exit" => ChatCommand::Quit,
            other => ChatCommand::Unknown(other.to_string()),
        }
    }
}

const CHAT_HELP: &str =
    "Commands: /retry, /clear, /report <text>, /export [file], /help, /quit. Ctrl-C stops a reply.";

async fn run_chat(config: &Config, args: ChatArgs) -> Result<()> {
    let transport: Arc<dyn RelayTransport> = Arc::new(RelayClient::from_config(config)?);
    let tool_command = args.tool_command.or_else(|| config.client_tool_command());
    let executor: Arc<dyn ToolExecutor> = match tool_command.as_deref() {
        Some(command) => Arc::new(CommandToolExecutor::new(
            command,
            config.client_tool_timeout(),
        )?),
        None => Arc::new(NoopToolExecutor),
    };
    let settings = ConversationSettings {
        model: args.model.unwrap_or_else(|| config.default_model()),
        system_prompt: args.prompt.unwrap_or_default(),
        intro: args.intro,
        room_id: args.room,
        use_tools: tool_command.is_some(),
        session_id: args.session,
    };

    let (mut conversation, rx_event) = Conversation::connect(transport, executor, settings)
        .await
        .context("Failed to connect to the relay")?;
    let printer = tokio::spawn(print_events(rx_event));

    println!("{}", format!("Session {}", conversation.session_id()).dimmed());
    println!("{}", CHAT_HELP.dimmed());
    for message in conversation.messages() {
        println!("{}", message.content);
    }

    let mut editor = DefaultEditor::new()?;
    loop {
        let line = tokio::task::block_in_place(|| editor.readline("> "));
        let line = match line {
            Ok(line) => line,
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(err) => return Err(err.into()),
        };
        if line.trim().is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(line.as_str());

        match ChatCommand::parse(&line) {
            ChatCommand::Send(text) => {
                stoppable(conversation.stop_handle(), conversation.send(text)).await;
            }
            ChatCommand::Retry => {
                let outcome =
                    stoppable(conversation.stop_handle(), conversation.retry()).await;
                if outcome.is_none() {
                    println!("{}", "Nothing to retry.".dimmed());
                }
            }
            ChatCommand::Clear => {
                conversation.clear();
                for message in conversation.messages() {
                    println!("{}", message.content);
                }
            }
            ChatCommand::Report(text) if text.is_empty() => {
                println!("{}", "Usage: /report <what went wrong>".yellow());
            }
            ChatCommand::Report(text) => match conversation.send_report(text).await {
                Ok(()) => println!("{}", "Report sent.".green()),
                Err(err) => println!("{} {err}", "Report failed:".red()),
            },
            ChatCommand::Export(path) => {
                let json = serde_json::to_string_pretty(&conversation.export_json())?;
                match path {
                    Some(path) => {
                        std::fs::write(&path, json)
                            .with_context(|| format!("Failed to write {}", path.display()))?;
                        println!("{}", format!("Exported to {}", path.display()).dimmed());
                    }
                    None => println!("{json}"),
                }
            }
            ChatCommand::Help => println!("{}", CHAT_HELP.dimmed()),
            ChatCommand::Quit => break,
            ChatCommand::Unknown(name) => {
                println!("{} /{name}. {CHAT_HELP}", "Unknown command".yellow());
            }
        }
    }

    conversation.wait_for_tools().await;
    drop(conversation);
    let _ = printer.await;
    Ok(())
}

/// Run one turn, stopping it on Ctrl-C.
async fn stoppable<F: Future>(stop: StopHandle, turn: F) -> F::Output {
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stop.stop();
        }
    });
    let output = turn.await;
    watcher.abort();
    output
}

async fn print_events(mut rx_event: mpsc::Receiver<ConversationEvent>) {
    while let Some(event) = rx_event.recv().await {
        match event {
            ConversationEvent::TurnStarted | ConversationEvent::ToolCallStarted { .. } => {}
            ConversationEvent::TextDelta { content } => {
                print!("{content}");
                io::stdout().flush().ok();
            }
            ConversationEvent::ToolCallFinished {
                name,
                output,
                success,
                ..
            } => {
                let status = if success { "✓".green() } else { "✗".red() };
                eprintln!(
                    "\n  {status} {name}: {}",
                    utils::truncate_text(&models::tool_output_text(&output), 200).dimmed()
                );
            }
            ConversationEvent::TurnComplete { outcome, error } => {
                println!();
                match (outcome, error) {
                    (TurnOutcome::Aborted, _) => println!("{}", "[stopped]".dimmed()),
                    (_, Some(error)) => println!(
                        "{} {} {}",
                        "Error:".red().bold(),
                        error.message,
                        "(/retry to resend)".dimmed()
                    ),
                    _ => {}
                }
            }
            ConversationEvent::Warning { message } => {
                eprintln!("{} {message}", "warning:".yellow());
            }
        }
    }
}
