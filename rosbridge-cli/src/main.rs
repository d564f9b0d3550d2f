//! rosbridge-cli - Command-line interface for rosbridge-compatible servers.
//!
//! One-shot execution of the client operations: publish, echo, service
//! calls, actions, and remote CLI commands.

mod commands;

use clap::{Parser, Subcommand};
use rosbridge_client::{Client, ClientConfig};
use rosbridge_protocol::Codec;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rosbridge-cli")]
#[command(about = "Command-line interface for rosbridge-compatible servers")]
#[command(version)]
struct Cli {
    /// Server URL
    #[arg(short, long, default_value = "ws://127.0.0.1:9090", env = "ROSBRIDGE_URL")]
    url: String,

    /// Envelope codec: json, cbor, or auto
    #[arg(short, long, default_value = "auto", env = "ROSBRIDGE_CODEC")]
    codec: String,

    /// Timeout for calls, in seconds
    #[arg(short, long, default_value_t = 30)]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish a message to a topic
    Publish {
        /// Topic name
        topic: String,

        /// Message JSON (or @file.json to read from file)
        message: String,
    },

    /// Print messages arriving on a topic
    Echo {
        /// Topic name
        topic: String,

        /// Message type
        msg_type: String,

        /// Compression hint (none, png, cbor, cbor-raw)
        #[arg(long)]
        compression: Option<String>,

        /// Number of messages to print before exiting
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u64,
    },

    /// Call a service and print the response values
    Call {
        /// Service name
        service: String,

        /// Service type
        srv_type: String,

        /// Arguments JSON (or @file.json to read from file)
        #[arg(default_value = "{}")]
        args: String,
    },

    /// Send an action goal, streaming feedback until the result arrives
    Action {
        /// Action name
        action: String,

        /// Action type
        action_type: String,

        /// Goal JSON (or @file.json to read from file)
        #[arg(default_value = "{}")]
        goal: String,

        /// Session id for correlating concurrent goals
        #[arg(long)]
        session: Option<String>,
    },

    /// Cancel an action goal
    Cancel {
        /// Action name
        action: String,

        /// Action type
        action_type: String,

        /// Session id of the goal to cancel
        #[arg(long)]
        session: Option<String>,
    },

    /// Run a CLI command on the remote side
    Exec {
        /// Full command line
        command: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let codec = Codec::resolve(&cli.codec)?;
    let config = ClientConfig::new()
        .with_codec(codec)
        .with_call_timeout(Duration::from_secs(cli.timeout));
    let client = Client::new(config);
    client.connect(&cli.url).await?;

    let result = commands::execute(&client, cli.command).await;
    let _ = client.close().await;

    match result {
        Ok(output) => {
            if !output.is_empty() {
                println!("{}", output);
            }
            Ok(())
        }
        Err(e) => Err(e),
    }
}
