//! Echo server.
//!
//! Demonstrates:
//! - Building a server with connection, message and close callbacks
//! - Echoing every message back on the same session
//! - Graceful shutdown on Ctrl+C
//!
//! Usage:
//!   cargo run --example echo_server
//!   cargo run --example echo_server -- --debug
//!   cargo run --example echo_server -- --port 4000

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use engineio_server::{Result, Server};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

// ============================================================================
// Types
// ============================================================================

/// Command-line arguments.
#[derive(Debug, Clone)]
struct Args {
    debug: bool,
    port: u16,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let port = args
            .iter()
            .position(|a| a == "--port")
            .and_then(|i| args.get(i + 1))
            .and_then(|p| p.parse().ok())
            .unwrap_or(3000);

        Self {
            debug: args.iter().any(|a| a == "--debug"),
            port,
        }
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.debug);

    if let Err(e) = run(args).await {
        eprintln!("\n[ERROR] {e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let server = Server::builder()
        .ping_interval(Duration::from_secs(25))
        .ping_timeout(Duration::from_secs(20))
        .http_compression(true)
        .on_connection(|socket| info!(sid = %socket.id(), "Client connected"))
        .on_message(|socket, data, is_binary| {
            let socket = socket.clone();
            tokio::spawn(async move {
                socket.send_message(data, is_binary).await;
            });
        })
        .on_close(|socket| info!(sid = %socket.id(), "Client disconnected"))
        .build()?;

    let listener = TcpListener::bind(("127.0.0.1", args.port)).await?;
    println!(
        "=== Echo server on http://127.0.0.1:{}{} ===",
        args.port,
        server.options().path
    );
    println!("Press Ctrl+C to exit...");

    let serving = {
        let server = server.clone();
        tokio::spawn(async move { server.serve(listener).await })
    };

    tokio::signal::ctrl_c().await?;
    server.shutdown().await;

    match serving.await {
        Ok(result) => result,
        Err(e) => {
            eprintln!("[ERROR] Serve task failed: {e}");
            Ok(())
        }
    }
}

/// Initialize tracing/logging.
fn init_logging(debug: bool) {
    let filter = if debug {
        "engineio_server=debug"
    } else {
        "engineio_server=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .init();
}
