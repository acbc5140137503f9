//! Notegraph CLI: drive MCP tool servers from the terminal or over pipes.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use notegraph_commands::McpCommands;
use notegraph_config::{CliOverrides, NotegraphConfig};
use notegraph_mcp::McpManager;
use serde::Serialize;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "notegraph", version, about = "Connect Notegraph to MCP tool servers")]
struct Cli {
    /// Enable verbose/debug logging
    #[arg(long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Path to the MCP server file (overrides NOTEGRAPH_MCP_CONFIG)
    #[arg(long, global = true)]
    mcp_config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List every tool offered by the connected servers
    Tools,
    /// Call a tool by name
    Call {
        name: String,
        /// Tool arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
    },
    /// Show the status of each configured server
    Status,
    /// Serve line-delimited JSON commands on stdin/stdout
    Bridge,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config = NotegraphConfig::load(CliOverrides {
        mcp_config: cli.mcp_config,
        verbose: cli.verbose,
    })
    .context("Failed to load configuration")?;

    init_logging(&config.log_level, cli.log_json);
    for warning in &config.warnings {
        tracing::warn!("{warning}");
    }

    let manager = Arc::new(McpManager::new(config.client_options()));
    let commands = McpCommands::new(manager.clone());

    let outcome = run(cli.command, &config, commands).await;
    manager.disconnect_all().await;
    outcome
}

async fn run(command: Command, config: &NotegraphConfig, commands: McpCommands) -> Result<ExitCode> {
    if let Command::Bridge = command {
        // The bridge starts even without a server file; the host can send
        // `loadConfig` itself.
        if let Some(text) = config.read_mcp_config()? {
            let response = commands.load_config(&text).await;
            if let Some(error) = response.error {
                tracing::warn!("Ignoring {}: {}", config.mcp_config_path.display(), error);
            }
        }
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        notegraph_commands::serve(commands, stdin, tokio::io::stdout())
            .await
            .context("Bridge I/O failed")?;
        return Ok(ExitCode::SUCCESS);
    }

    let path = config.mcp_config_path.display();
    let text = config
        .read_mcp_config()?
        .with_context(|| format!("No MCP server file at {path}"))?;
    commands
        .manager()
        .load_config(&text)
        .await
        .with_context(|| format!("Invalid MCP server file {path}"))?;

    match command {
        Command::Tools => print_json(&commands.get_tools())?,
        Command::Status => print_json(&commands.get_statuses())?,
        Command::Call { name, args } => {
            let arguments: serde_json::Value =
                serde_json::from_str(&args).context("--args must be valid JSON")?;
            let response = commands.call_tool(&name, arguments).await;
            print_json(&response)?;
            if !response.success {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Bridge => {}
    }
    Ok(ExitCode::SUCCESS)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("Failed to encode output")?;
    println!("{text}");
    Ok(())
}

/// Logs go to stderr so stdout stays clean for JSON output.
fn init_logging(level: &str, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .init();
    }
}
