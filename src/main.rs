//! Minimal binary demonstrating `crosswire` usage.
//!
//! Serves a bridge over newline-delimited JSON frames on a TCP listener,
//! backed by an in-process bus. Real deployments embed the library behind
//! their own transport instead.

mod cli;

use std::{fs, sync::Arc};

use clap::Parser;
use crosswire::{Bridge, BridgeOptions, ClientSocket, LocalBus};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Enable structured logging for the demo server.
    // Applications embedding the library should install their own subscriber.
    tracing_subscriber::fmt::init();

    let cli = cli::Cli::parse();
    let options: BridgeOptions = match &cli.config {
        Some(path) => serde_json::from_slice(&fs::read(path)?)?,
        None => BridgeOptions::default(),
    };

    let bus = Arc::new(LocalBus::new());
    let bridge = Bridge::builder(bus).options(options).build();

    let listener = TcpListener::bind(&cli.listen).await?;
    log::info!("bridge listening on {}", cli.listen);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let bridge = bridge.clone();
                tokio::spawn(async move {
                    if let Err(err) = serve_connection(bridge, stream).await {
                        log::error!("connection from {peer} failed: {err}");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

/// Run one client connection until its stream ends.
async fn serve_connection(bridge: Bridge, stream: TcpStream) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let (socket, mut writes) = ClientSocket::channel(64);
    let session = bridge.attach(socket);

    let writer = tokio::spawn(async move {
        while let Some(bytes) = writes.recv().await {
            if write_half.write_all(&bytes).await.is_err()
                || write_half.write_all(b"\n").await.is_err()
            {
                break;
            }
        }
    });

    let mut lines = BufReader::new(read_half).lines();
    while let Some(line) = lines.next_line().await? {
        if line.is_empty() {
            continue;
        }
        if let Err(err) = session.handle_data(line.as_bytes()).await {
            log::error!("client protocol error: {err}");
        }
    }

    session.close().await;
    writer.abort();
    Ok(())
}
