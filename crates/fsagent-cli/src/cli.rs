//! CLI entry and dispatch.

use std::io::{IsTerminal, Read, Write};

use anyhow::{Context, Result};
use clap::Parser;
use fsagent_core::config::Config;
use fsagent_core::core::AgentOrchestrator;
use fsagent_core::reasoning::{GeminiClient, GeminiConfig};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "fsagent")]
#[command(version)]
#[command(about = "Chat with a Gemini agent that manages files through an MCP tool server")]
struct Cli {
    /// Directory the tool server is restricted to
    #[arg(long, env = "FSAGENT_ROOT")]
    root: Option<String>,

    /// Override the model from config
    #[arg(short, long)]
    model: Option<String>,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load()?;
    let root = config.resolve_root(cli.root)?;
    let model = cli.model.unwrap_or_else(|| config.model());
    tracing::info!(%root, %model, "starting agent");
    let gemini = GeminiConfig::from_env(
        model,
        config.gemini.api_key.as_deref(),
        config.gemini.base_url.as_deref(),
    )?;

    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    runtime.block_on(run_agent(&config, gemini, &root))
}

async fn run_agent(config: &Config, gemini: GeminiConfig, root: &str) -> Result<()> {
    let client = GeminiClient::new(gemini);
    let command = config.server_command(root);
    let mut agent = AgentOrchestrator::new(client, command, config.channel_options(), root);

    agent.start().await?;

    let result = if std::io::stdin().is_terminal() {
        interactive_loop(&mut agent).await
    } else {
        piped_run(&mut agent).await
    };

    println!("Shutting down agent and MCP server...");
    agent.shutdown().await;
    println!("Cleanup completed.");
    result
}

/// Reads prompts until `exit`/`quit`, EOF, or Ctrl-C.
async fn interactive_loop(agent: &mut AgentOrchestrator<GeminiClient>) -> Result<()> {
    println!("Filesystem Agent is running. Type 'exit' to quit.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("You: ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read from stdin")?,
            _ = tokio::signal::ctrl_c() => {
                println!();
                return Ok(());
            }
        };
        let Some(line) = line else {
            return Ok(()); // EOF
        };

        let message = line.trim();
        if message.is_empty() {
            continue;
        }
        if message.eq_ignore_ascii_case("exit") || message.eq_ignore_ascii_case("quit") {
            return Ok(());
        }

        match agent.ask(message).await {
            Ok(transcript) => println!("Assistant:\n{transcript}\n---"),
            // ask only errs once the channel is unrecoverable
            Err(e) => return Err(e),
        }
    }
}

/// Non-terminal stdin: treat everything piped in as a single prompt.
async fn piped_run(agent: &mut AgentOrchestrator<GeminiClient>) -> Result<()> {
    let mut message = String::new();
    std::io::stdin()
        .read_to_string(&mut message)
        .context("failed to read from stdin")?;
    let message = message.trim();
    if message.is_empty() {
        return Ok(());
    }

    let transcript = agent.ask(message).await?;
    println!("{transcript}");
    Ok(())
}
