//! capmux - the merging capture client.
//!
//! Connects to one or more capmuxd agents and merges their capture streams
//! into a single pcap file (or stdout).

use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use capmux::merger::{StreamEnd, StreamMerger};
use capmux::stream::{RemoteTarget, StreamClient, TlsSettings};

#[derive(Parser)]
#[command(name = "capmux")]
#[command(about = "Merge live captures from remote agents into one pcap stream")]
struct Args {
    /// Agent URLs, e.g. http://host:8475 or https://host:8475/capture?filter=port+53
    #[arg(required = true)]
    targets: Vec<String>,

    /// Output file for the merged pcap; "-" writes to stdout
    #[arg(short = 'w', long = "output", default_value = "-")]
    output: String,

    /// PEM bundle of extra trust roots for https agents
    #[arg(long)]
    tls_ca: Option<PathBuf>,

    /// Client certificate for mutual TLS (requires --tls-key)
    #[arg(long)]
    tls_cert: Option<PathBuf>,

    /// Client private key for mutual TLS (requires --tls-cert)
    #[arg(long)]
    tls_key: Option<PathBuf>,
}

enum Output {
    Stdout(io::Stdout),
    File(File),
}

impl Write for Output {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        match self {
            Output::Stdout(out) => out.write(data),
            Output::File(file) => file.write(data),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Output::Stdout(out) => out.flush(),
            Output::File(file) => file.flush(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // stdout may carry the capture itself, so all logging goes to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    // Every target must parse before any connection is opened.
    let targets = args
        .targets
        .iter()
        .map(|raw| RemoteTarget::parse(raw))
        .collect::<Result<Vec<_>, _>>()?;

    let tls = TlsSettings {
        ca_bundle: args.tls_ca,
        client_cert: args.tls_cert,
        client_key: args.tls_key,
    };
    let client = StreamClient::new(&tls)?;

    let output = match args.output.as_str() {
        "-" => Output::Stdout(io::stdout()),
        path => Output::File(
            File::create(path).with_context(|| format!("failed to create output file {}", path))?,
        ),
    };

    let mut merger = StreamMerger::new();
    for target in targets {
        tracing::info!("adding target {}", target);
        merger.add_target(&client, target);
    }

    let handle = merger.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, stopping capture");
            handle.close();
        }
    });

    let summary = merger.start(output).await.context("merge failed")?;

    tracing::info!(
        "merge finished: {} frames written, {} discarded during shutdown",
        summary.frames_written,
        summary.frames_discarded
    );
    for stream in &summary.streams {
        match &stream.end {
            StreamEnd::Eof => {
                tracing::info!("{}: {} frames, stream ended", stream.label, stream.frames)
            }
            StreamEnd::Cancelled => {
                tracing::info!("{}: {} frames, stopped", stream.label, stream.frames)
            }
            StreamEnd::Failed(e) => {
                tracing::warn!("{}: {} frames, failed: {}", stream.label, stream.frames, e)
            }
        }
    }

    Ok(())
}
