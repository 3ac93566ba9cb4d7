#![forbid(unsafe_code)]

//! `agent-continuity-ctl`: command-line client for `agent-continuity`.
//!
//! Connects to the WebSocket transport, sends one command, and prints the
//! JSON frames the server returns.

use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message};

#[derive(Debug, Parser)]
#[command(
    name = "agent-continuity-ctl",
    about = "Command-line client for the agent-continuity server",
    version,
    long_about = None
)]
struct Cli {
    /// WebSocket endpoint of the server.
    #[arg(long, default_value = "ws://127.0.0.1:3100/ws")]
    url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Subscribe to one or more agents and stream their events.
    Subscribe {
        /// Agent ids to follow.
        #[arg(required = true)]
        agent_ids: Vec<String>,
    },

    /// Stream events for every agent.
    SubscribeAll,

    /// Send a ping and exit after the pong.
    Ping,
}

impl Command {
    fn request(&self) -> serde_json::Value {
        match self {
            Self::Subscribe { agent_ids } => {
                serde_json::json!({ "type": "subscribe", "agentIds": agent_ids })
            }
            Self::SubscribeAll => serde_json::json!({ "type": "subscribe_all" }),
            Self::Ping => serde_json::json!({ "type": "ping" }),
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = Cli::parse();

    if let Err(err) = run(&args).await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

async fn run(args: &Cli) -> Result<(), String> {
    let (socket, _) = connect_async(args.url.as_str())
        .await
        .map_err(|err| format!("failed to connect to {}: {err}", args.url))?;
    let (mut sink, mut stream) = socket.split();

    let request = args.command.request().to_string();
    sink.send(Message::Text(request))
        .await
        .map_err(|err| format!("failed to send command: {err}"))?;

    let exit_on_pong = matches!(args.command, Command::Ping);

    while let Some(frame) = stream.next().await {
        let frame = frame.map_err(|err| format!("connection error: {err}"))?;
        let text = match frame {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(value) => {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&value).unwrap_or_else(|_| text.clone())
                );
                if exit_on_pong && value.get("type").and_then(|t| t.as_str()) == Some("pong") {
                    break;
                }
            }
            Err(_) => println!("{text}"),
        }
    }

    let _ = sink.close().await;
    Ok(())
}
