//! courier: operator CLI
//!
//! ```text
//! courier publish <queue> <json>   connect, publish one message, close
//! courier listen <queue>           log and ack messages until Ctrl+C
//! ```
//!
//! ## Configuration
//! - `courier.yaml` in the working directory, or the file named by COURIER_CONFIG
//! - COURIER__HOSTNAME, COURIER__USERNAME, ... override file values
//! - COURIER_LOG: tracing filter (default "info")

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use courier::utils::bootstrap::init_tracing;
use courier::{Ack, ClientEvent, ClientOptions, Courier, Handler};

/// Publish to or listen on a configured queue or event.
#[derive(Parser, Debug)]
#[command(name = "courier")]
#[command(about = "Operator CLI for courier-managed queues and events")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect, publish one JSON message, close
    Publish {
        /// Configured queue or published event
        queue: String,
        /// JSON message body
        json: String,
    },
    /// Log and ack messages until Ctrl+C
    Listen {
        /// Configured queue or subscribed event
        queue: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing();

    let config = ClientOptions::load(None)
        .and_then(ClientOptions::validate)
        .map_err(|e| {
            error!("Failed to load configuration: {}", e);
            e
        })?;
    let client = Courier::amqp(config);

    let mut events = client.events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let ClientEvent::Error(fault) = event {
                warn!(%fault, "Client error");
            }
        }
    });

    match cli.command {
        Command::Publish { queue, json } => {
            client.publish(&queue, json).await?;
            client.connect().await?;
            info!(queue = %queue, "Published message");
        }
        Command::Listen { queue } => {
            let handler = Handler::from_fn("cli", |payload, ack: Ack| async move {
                info!(delivery_tag = ack.delivery_tag(), %payload, "Received message");
                ack.ack().await;
            });
            client.subscribe(&queue, handler.clone()).await?;
            client.connect().await?;
            info!(queue = %queue, "Listening, press Ctrl+C to exit");

            tokio::signal::ctrl_c().await?;

            if let Err(e) = client.unsubscribe(&queue, Some(&handler)).await {
                warn!(error = %e, "Unsubscribe failed");
            }
        }
    }

    client.close().await?;
    Ok(())
}
