//! fcp-cli - Command-line interface for FCP nodes
//!
//! Provides both a REPL and one-shot command execution.

mod commands;
mod repl;

use clap::{Parser, Subcommand};
use colored::Colorize;
use fcp_client::{Client, ConnectionConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fcp-cli")]
#[command(about = "Command-line interface for Freenet Client Protocol nodes")]
#[command(version)]
struct Cli {
    /// Node address
    #[arg(short, long, env = "FCP_SERVER", default_value = "127.0.0.1:9481")]
    server: SocketAddr,

    /// Client name sent in ClientHello
    #[arg(short = 'n', long, env = "FCP_CLIENT_NAME", default_value = "fcp-cli")]
    client_name: String,

    /// Request timeout in seconds
    #[arg(short, long, env = "FCP_TIMEOUT", default_value = "300")]
    timeout: u64,

    /// Print replies as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start interactive REPL
    Repl,

    /// Show the node's NodeHello
    Hello,

    /// Fetch a key with the data returned inline
    Get {
        /// Key to fetch
        uri: String,

        /// Write the data to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Insert data under a key
    Put {
        /// Target key (e.g. CHK@)
        uri: String,

        /// Data to insert (or @file to read from file)
        data: String,
    },

    /// Generate a fresh SSK keypair
    GenerateSsk,

    /// List the node's peers
    ListPeers,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let config = ConnectionConfig::new(cli.server)
        .with_client_name(cli.client_name.as_str())
        .with_request_timeout(Duration::from_secs(cli.timeout));
    let client = Client::new(config);

    match cli.command {
        Some(Commands::Repl) | None => {
            repl::run(client, cli.server, cli.json).await?;
        }
        Some(cmd) => {
            // Connect for one-shot command
            client.connect().await.map_err(|e| {
                eprintln!("{}: {}", "Connection failed".red(), e);
                e
            })?;

            let result = commands::execute(&client, cmd, cli.json).await;

            match result {
                Ok(output) => {
                    if !output.is_empty() {
                        println!("{}", output);
                    }
                }
                Err(e) => {
                    eprintln!("{}: {}", "Error".red(), e);
                    let _ = client.close().await;
                    std::process::exit(1);
                }
            }

            client.close().await?;
        }
    }

    Ok(())
}
