//! Interactive REPL.

use crate::commands::{
    format_attributes, format_bytes, format_json, format_peers, message_to_json, read_data_arg,
};
use colored::Colorize;
use fcp_client::Client;
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::{Config, Editor};
use std::net::SocketAddr;

const HELP_TEXT: &str = r#"
Available commands:
  help                          Show this help
  hello                         Show the node's NodeHello

  get <uri>                     Fetch a key, data returned inline
  put <uri> <data|@file>        Insert data under a key
  ssk                           Generate an SSK keypair
  peers                         List the node's peers

  json                          Toggle JSON output

  quit, exit                    Exit the REPL
"#;

pub async fn run(
    client: Client,
    addr: SocketAddr,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", "FCP CLI".bold().cyan());
    println!("Connecting to {}...", addr);

    client.connect().await?;
    let hello = client.node_hello().await?;
    println!(
        "{} (FCP {}, node {})",
        "Connected!".green(),
        hello.get("FCPVersion").unwrap_or("?"),
        hello.get("Version").unwrap_or("?")
    );

    // Create readline editor
    let config = Config::builder()
        .history_ignore_space(true)
        .auto_add_history(true)
        .build();
    let mut rl: Editor<(), DefaultHistory> = Editor::with_config(config)?;

    // Load history
    let history_path = std::env::var("HOME")
        .map(|h| std::path::PathBuf::from(h).join(".fcp_history"))
        .unwrap_or_else(|_| ".fcp_history".into());
    let _ = rl.load_history(&history_path);

    println!("Type 'help' for available commands.\n");

    let mut json = json;
    loop {
        let prompt = format!("{} ", "fcp>".cyan());
        match rl.readline(&prompt) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line == "json" {
                    json = !json;
                    println!("JSON output {}\n", if json { "on" } else { "off" });
                    continue;
                }

                match execute_repl_command(&client, line, json).await {
                    Ok(Some(output)) => println!("{}\n", output),
                    Ok(None) => break, // Exit command
                    Err(e) => println!("{}: {}\n", "Error".red(), e),
                }
                if !client.is_connected() {
                    println!("{}", "Connection lost.".red());
                    break;
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("^D");
                break;
            }
            Err(err) => {
                println!("{}: {:?}", "Error".red(), err);
                break;
            }
        }
    }

    // Save history
    let _ = rl.save_history(&history_path);

    // Disconnect
    let _ = client.close().await;
    println!("{}", "Disconnected.".dimmed());

    Ok(())
}

async fn execute_repl_command(
    client: &Client,
    line: &str,
    json: bool,
) -> Result<Option<String>, Box<dyn std::error::Error>> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.is_empty() {
        return Ok(Some(String::new()));
    }

    let cmd = parts[0].to_lowercase();
    let args = &parts[1..];

    match cmd.as_str() {
        "help" | "?" => Ok(Some(HELP_TEXT.to_string())),

        "quit" | "exit" | "q" => Ok(None),

        "hello" => {
            let hello = client.node_hello().await?;
            if json {
                return Ok(Some(format_json(&message_to_json(&hello))));
            }
            Ok(Some(format_attributes(hello.attributes())))
        }

        "get" | "g" => {
            if args.is_empty() {
                return Ok(Some("Usage: get <uri>".to_string()));
            }
            let reply = client.get_direct(args[0]).await?;
            if json {
                return Ok(Some(format_json(&message_to_json(&reply))));
            }
            let data = reply.body().cloned().unwrap_or_default();
            Ok(Some(String::from_utf8_lossy(&data).into_owned()))
        }

        "put" | "p" => {
            if args.len() < 2 {
                return Ok(Some("Usage: put <uri> <data|@file>".to_string()));
            }
            let data = read_data_arg(&args[1..].join(" "))?;
            let size = data.len() as u64;
            let reply = client.put_direct(args[0], data).await?;
            if json {
                return Ok(Some(format_json(&message_to_json(&reply))));
            }
            Ok(Some(format!(
                "{} {} as {}",
                "Inserted".green(),
                format_bytes(size),
                reply.get("URI").unwrap_or("?").cyan()
            )))
        }

        "ssk" | "generate-ssk" => {
            let (insert_uri, request_uri) = client.get_ssk_keypair().await?;
            Ok(Some(format!(
                "  {}: {}\n  {}: {}",
                "Insert URI".bold(),
                insert_uri.yellow(),
                "Request URI".bold(),
                request_uri.cyan()
            )))
        }

        "peers" | "list-peers" => {
            let peers = client.list_peers().await?;
            Ok(Some(format_peers(&peers)))
        }

        _ => Ok(Some(format!(
            "Unknown command: {}. Type 'help' for help.",
            cmd
        ))),
    }
}
