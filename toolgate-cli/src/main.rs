//! Toolgate CLI - Command-line tools for inspecting and calling tool servers

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use toolgate_core::prelude::*;

#[derive(Parser)]
#[command(name = "toolgate")]
#[command(about = "Toolgate tool-server CLI", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (TOML, JSON or YAML)
    #[arg(short, long, global = true, env = "TOOLGATE_CONFIG_PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect the configured servers and show their state
    Servers,
    /// List registered tools
    Tools {
        /// Only show tools matching this query
        #[arg(short, long)]
        query: Option<String>,
    },
    /// Print the function catalog
    Functions {
        /// Print OpenAI-style tool definitions as JSON
        #[arg(long)]
        json: bool,
    },
    /// Call a function, answering consent prompts on the terminal
    Call {
        /// Function name, e.g. mcp_filesystem_read_file
        function: String,
        /// Arguments as a JSON object
        #[arg(short, long, default_value = "{}")]
        args: String,
    },
    /// Connect the configured servers and print the performance report
    Report {
        /// Print the raw metrics export as JSON
        #[arg(long)]
        json: bool,
    },
    /// Version information
    Version,
}

fn load_config(path: Option<&PathBuf>) -> Result<ToolgateConfig> {
    let config = match path {
        Some(path) => ToolgateConfig::from_file(path)
            .with_context(|| format!("Failed to read {}", path.display()))?,
        None => ToolgateConfig::load().context("Failed to load configuration")?,
    };
    Ok(config)
}

async fn start(config: ToolgateConfig) -> Toolgate {
    let toolgate = Toolgate::from_config(config);
    let report = toolgate.start().await;
    for (name, reason) in &report.failed {
        eprintln!("warning: {} failed to connect: {}", name, reason);
    }
    toolgate
}

async fn show_servers(toolgate: &Toolgate) {
    println!("{:<20} {:<10} {:<6} {:<13} TOOLS", "SERVER", "TRANSPORT", "AUTO", "STATE");
    for (name, server) in &toolgate.config().servers {
        let state = match toolgate.client().connection_state(name).await {
            Some(state) => state.to_string(),
            None if !server.enabled => "disabled".to_string(),
            None => "idle".to_string(),
        };
        let tools = toolgate.adapter().server_tools(name).await.len();
        println!(
            "{:<20} {:<10} {:<6} {:<13} {}",
            name,
            server.transport.to_string(),
            server.auto_connect,
            state,
            tools
        );
    }
}

fn show_tools(toolgate: &Toolgate, query: Option<&str>) {
    let registry = toolgate.adapter().registry();
    let tools: Vec<RegisteredTool> = match query {
        Some(query) => registry
            .discover(query, usize::MAX)
            .into_iter()
            .map(|found| found.tool)
            .collect(),
        None => registry.list(),
    };

    if tools.is_empty() {
        println!("No tools registered");
        return;
    }
    for tool in tools {
        println!("{}", tool.id);
        if !tool.description.is_empty() {
            println!("    {}", tool.description);
        }
    }
}

/// Answer consent prompts from stdin until the task is aborted.
fn spawn_consent_prompter(policy: Arc<SecurityPolicy>) -> tokio::task::JoinHandle<()> {
    let mut requests = policy.consent_requests();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let request = match requests.recv().await {
                Ok(request) => request,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Missed consent prompts");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            let mut stderr = tokio::io::stderr();
            let prompt = format!(
                "\n{} risk: {} wants to {} via '{}'\n  params: {}\nAllow? [y]es / [n]o / [a]lways / [d]eny always: ",
                request.risk_level.as_str(),
                request.server_name,
                request.operation.as_str(),
                request.tool_name,
                request.params
            );
            let _ = stderr.write_all(prompt.as_bytes()).await;
            let _ = stderr.flush().await;

            let choice = match lines.next_line().await {
                Ok(Some(line)) => line.parse().unwrap_or(ConsentChoice::Deny),
                _ => ConsentChoice::Deny,
            };
            if let Err(e) = policy
                .handle_consent_response(&request.request_id, choice)
                .await
            {
                tracing::warn!(error = %e, "Consent answer was not delivered");
            }
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Version => {
            println!("toolgate {}", env!("CARGO_PKG_VERSION"));
            println!("toolgate-core {}", toolgate_core::VERSION);
        }
        Commands::Servers => {
            let toolgate = start(load_config(cli.config.as_ref())?).await;
            show_servers(&toolgate).await;
            toolgate.shutdown().await;
        }
        Commands::Tools { query } => {
            let toolgate = start(load_config(cli.config.as_ref())?).await;
            show_tools(&toolgate, query.as_deref());
            toolgate.shutdown().await;
        }
        Commands::Functions { json } => {
            let toolgate = start(load_config(cli.config.as_ref())?).await;
            if json {
                let tools = toolgate.executor().openai_tools().await;
                println!("{}", serde_json::to_string_pretty(&tools)?);
            } else {
                for function in toolgate.executor().get_functions().await {
                    println!("{:<40} {}", function.name, function.description);
                }
            }
            toolgate.shutdown().await;
        }
        Commands::Call { function, args } => {
            let params: serde_json::Value =
                serde_json::from_str(&args).context("--args must be a JSON value")?;
            let toolgate = start(load_config(cli.config.as_ref())?).await;
            let prompter = spawn_consent_prompter(toolgate.policy().clone());

            let outcome = toolgate.executor().execute(&function, params).await;
            prompter.abort();
            toolgate.shutdown().await;

            let result = outcome?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.success {
                std::process::exit(1);
            }
        }
        Commands::Report { json } => {
            let toolgate = start(load_config(cli.config.as_ref())?).await;
            if json {
                let export = toolgate.monitor().export_metrics().await;
                println!("{}", serde_json::to_string_pretty(&export)?);
            } else {
                println!("{}", toolgate.monitor().get_formatted_report().await);
            }
            toolgate.shutdown().await;
        }
    }

    Ok(())
}
