//! capmuxd - the capture agent daemon.
//!
//! Serves live captures from this host as pcap streams on GET /capture.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::{TcpListener, UnixListener};
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::EnvFilter;

use capmux::agent::{self, filter::self_exclusion, AgentState};
use capmux::capture::{list_interfaces, LiveOpener};
use capmux::error::ConfigError;

const DEFAULT_LISTEN: &str = "0.0.0.0:8475";

#[derive(Parser)]
#[command(name = "capmuxd")]
#[command(about = "Capture agent daemon - streams live captures over HTTP")]
struct Args {
    /// Address to listen on: HOST:PORT, :PORT, or unix:/path/to/socket
    #[arg(short, long, default_value = DEFAULT_LISTEN)]
    listen: String,

    /// List capture-capable interfaces and exit
    #[arg(long)]
    list_interfaces: bool,
}

/// Where the agent binds. The form matters beyond wiring: a TCP bind needs a
/// self-exclusion filter clause, a unix socket does not.
#[derive(Debug, PartialEq, Eq)]
enum ListenAddr {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

fn parse_listen(raw: &str) -> Result<ListenAddr, ConfigError> {
    if let Some(path) = raw.strip_prefix("unix:") {
        if path.is_empty() {
            return Err(ConfigError::InvalidListenAddr(raw.to_string()));
        }
        return Ok(ListenAddr::Unix(PathBuf::from(path)));
    }
    // ":8475" is shorthand for a wildcard bind.
    let full = if raw.starts_with(':') {
        format!("0.0.0.0{}", raw)
    } else {
        raw.to_string()
    };
    full.parse()
        .map(ListenAddr::Tcp)
        .map_err(|_| ConfigError::InvalidListenAddr(raw.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logging goes to stderr; the daemon's stdout is unused but keeping the
    // two apart matches the client, where stdout carries the capture.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    if args.list_interfaces {
        for line in list_interfaces().context("failed to list interfaces")? {
            println!("{}", line);
        }
        return Ok(());
    }

    let listen = parse_listen(&args.listen)?;
    let opener = Arc::new(LiveOpener);

    match listen {
        ListenAddr::Tcp(addr) => {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind {}", addr))?;
            // The exclusion derives from the resolved address, so ":0" binds
            // still exclude the right port.
            let bound = listener.local_addr().context("failed to resolve bound address")?;
            let exclusion = self_exclusion(&bound);
            tracing::info!("listening on {} (excluding {:?})", bound, exclusion);

            let app = agent::router(AgentState::new(opener, Some(exclusion)));
            axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(shutdown_signal())
                .await
                .context("server failed")?;
        }
        ListenAddr::Unix(path) => {
            // A previous run may have left its socket file behind.
            match std::fs::remove_file(&path) {
                Ok(()) => tracing::debug!("removed stale socket {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("failed to remove stale socket {}", path.display()))
                }
            }
            let listener = UnixListener::bind(&path)
                .with_context(|| format!("failed to bind {}", path.display()))?;
            tracing::info!("listening on unix:{} (no self-exclusion)", path.display());

            let app = agent::router(AgentState::new(opener, None));
            axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(shutdown_signal())
                .await
                .context("server failed")?;
        }
    }

    tracing::info!("agent stopped");
    Ok(())
}

async fn shutdown_signal() {
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
        _ = sigint.recv() => tracing::info!("received SIGINT, shutting down"),
    }
}
