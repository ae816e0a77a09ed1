//! Command execution.

use crate::Commands;
use colored::Colorize;
use fcp_client::Client;
use fcp_protocol::{Attributes, Message};
use serde_json::{Map, Value};

/// Executes a command and returns the formatted output.
pub async fn execute(
    client: &Client,
    cmd: Commands,
    json: bool,
) -> Result<String, Box<dyn std::error::Error>> {
    match cmd {
        Commands::Repl => unreachable!(),

        Commands::Hello => {
            let hello = client.node_hello().await?;
            if json {
                return Ok(format_json(&message_to_json(&hello)));
            }
            Ok(format!(
                "{}\n{}",
                "NodeHello".green().bold(),
                format_attributes(hello.attributes())
            ))
        }

        Commands::Get { uri, output } => {
            let reply = client.get_direct(&uri).await?;
            if json {
                return Ok(format_json(&message_to_json(&reply)));
            }

            let data = reply.body().cloned().unwrap_or_default();
            match output {
                Some(path) => {
                    std::fs::write(&path, &data)?;
                    Ok(format!(
                        "{} {} ({}) to {}",
                        "Fetched".green(),
                        uri.cyan(),
                        format_bytes(data.len() as u64),
                        path.display()
                    ))
                }
                None => Ok(String::from_utf8_lossy(&data).into_owned()),
            }
        }

        Commands::Put { uri, data } => {
            let data = read_data_arg(&data)?;
            let size = data.len() as u64;
            let reply = client.put_direct(&uri, data).await?;
            if json {
                return Ok(format_json(&message_to_json(&reply)));
            }
            Ok(format!(
                "{} {} as {}",
                "Inserted".green(),
                format_bytes(size),
                reply.get("URI").unwrap_or("?").cyan()
            ))
        }

        Commands::GenerateSsk => {
            let (insert_uri, request_uri) = client.get_ssk_keypair().await?;
            if json {
                let value = serde_json::json!({
                    "InsertURI": insert_uri,
                    "RequestURI": request_uri,
                });
                return Ok(format_json(&value));
            }
            Ok(format!(
                "  {}: {}\n  {}: {}",
                "Insert URI".bold(),
                insert_uri.yellow(),
                "Request URI".bold(),
                request_uri.cyan()
            ))
        }

        Commands::ListPeers => {
            let peers = client.list_peers().await?;
            if json {
                let items = peers.iter().map(attributes_to_json).collect();
                return Ok(format_json(&Value::Array(items)));
            }
            Ok(format_peers(&peers))
        }
    }
}

/// Formats a peer list, one peer per line.
pub fn format_peers(peers: &[Attributes]) -> String {
    if peers.is_empty() {
        return "No peers".yellow().to_string();
    }

    let mut output = String::new();
    for (i, peer) in peers.iter().enumerate() {
        let identity = peer.get("identity").unwrap_or("?");
        let address = peer.get("physical.udp").unwrap_or("-");
        output.push_str(&format!(
            "[{:>3}] {} {}\n",
            i.to_string().cyan(),
            identity.yellow(),
            address.dimmed()
        ));
    }
    output
}

/// Formats attributes as `key: value` lines.
pub fn format_attributes(attributes: &Attributes) -> String {
    attributes
        .iter()
        .map(|(key, value)| format!("  {}: {}", key.bold(), value))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Converts attributes to a JSON object, keeping their order.
pub fn attributes_to_json(attributes: &Attributes) -> Value {
    let map: Map<String, Value> = attributes
        .iter()
        .map(|(key, value)| (key.to_string(), Value::String(value.to_string())))
        .collect();
    Value::Object(map)
}

/// Converts a message to JSON: its name, attributes and body as text.
pub fn message_to_json(message: &Message) -> Value {
    let mut value = serde_json::json!({
        "name": message.name(),
        "attributes": attributes_to_json(message.attributes()),
    });
    if let Some(body) = message.body() {
        value["body"] = Value::String(String::from_utf8_lossy(body).into_owned());
    }
    value
}

/// Reads a data argument (either inline text or @file).
pub fn read_data_arg(arg: &str) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    match arg.strip_prefix('@') {
        Some(path) => Ok(std::fs::read(path)?),
        None => Ok(arg.as_bytes().to_vec()),
    }
}

/// Formats bytes as human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    if bytes >= 1024 * 1024 * 1024 {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    } else if bytes >= 1024 * 1024 {
        format!("{:.2} MB", bytes as f64 / (1024.0 * 1024.0))
    } else if bytes >= 1024 {
        format!("{:.2} KB", bytes as f64 / 1024.0)
    } else {
        format!("{} B", bytes)
    }
}

/// Formats JSON for display.
pub fn format_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
