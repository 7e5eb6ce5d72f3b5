//! Example: Echo Server and Client over a Named Endpoint
//!
//! Starts a server that echoes every message, connects a client, sends a few
//! notes and prints what comes back. Ctrl+C stops the server early.
//!
//! Configuration is read from `PIPE_MESSAGING_*` environment variables.
//!
//! Run with: `cargo run --example echo`

#![allow(clippy::uninlined_format_args)]

use std::time::Duration;

use futures::StreamExt;
use pipe_messaging::core::serialization::SerdeCodec;
use pipe_messaging::utils::logging::init_logging;
use pipe_messaging::utils::metrics::global_metrics;
use pipe_messaging::{Client, ClientEvent, IpcConfig, PipeSecurity, Server, ServerEvent};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Note {
    id: u32,
    text: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = IpcConfig::from_env()?;
    config.validate_strict()?;
    init_logging(&config.logging)?;

    let codec = SerdeCodec::<Note>::new(config.transport.serialization_format);
    let token = CancellationToken::new();

    let (server, mut server_events) = Server::new(codec.clone(), &config);
    server
        .start_configured(Some(PipeSecurity::owner_only()))
        .await?;

    let echo_token = token.clone();
    tokio::spawn(async move {
        while let Some(event) = server_events.next().await {
            match event {
                ServerEvent::ClientConnected(connection) => {
                    info!(connection = %connection.id(), identity = ?connection.identity(), "Client connected");
                }
                ServerEvent::MessageReceived {
                    connection,
                    message,
                } => {
                    if let Err(e) = connection.send(&message, &echo_token).await {
                        warn!(error = %e, "Echo failed");
                    }
                }
                ServerEvent::Exception { connection, error } => {
                    warn!(connection = ?connection.map(|c| c.id()), error = %error, "Server exception");
                }
                ServerEvent::ClientDisconnected(connection) => {
                    info!(connection = %connection.id(), "Client disconnected");
                }
            }
        }
    });

    let (client, mut client_events) = Client::new(codec, &config);
    client.connect(&token).await?;

    for (id, text) in ["hello", "named", "pipes"].into_iter().enumerate() {
        let note = Note {
            id: id as u32 + 1,
            text: text.to_string(),
        };
        client.send(&note, &token).await?;
    }

    let mut echoed = 0;
    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received CTRL+C signal, shutting down");
                break;
            }
            event = tokio::time::timeout(Duration::from_secs(5), client_events.next()) => event,
        };

        match event {
            Ok(Some(ClientEvent::MessageReceived { message, .. })) => {
                println!("echo #{}: {}", message.id, message.text);
                echoed += 1;
                if echoed == 3 {
                    break;
                }
            }
            Ok(Some(ClientEvent::Exception { error, .. })) => warn!(error = %error, "Client exception"),
            Ok(Some(ClientEvent::Disconnected(_))) | Ok(None) => break,
            Ok(Some(ClientEvent::Connected(_))) => {}
            Err(_) => {
                warn!("Timed out waiting for echoes");
                break;
            }
        }
    }

    client.dispose();
    server.shutdown().await;
    global_metrics().log_metrics();
    Ok(())
}
