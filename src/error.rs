use std::io;
use std::path::PathBuf;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Configuration failures. Fatal at startup, never retried.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unsupported scheme '{scheme}' in target url '{url}'")]
    UnsupportedScheme { scheme: String, url: String },

    #[error("invalid target url '{url}': {reason}")]
    InvalidTarget { url: String, reason: String },

    #[error("invalid listen address '{0}': expected HOST:PORT, :PORT or unix:PATH")]
    InvalidListenAddr(String),

    #[error("TLS client certificate and key must be provided together")]
    IncompleteKeyPair,

    #[error("failed to read TLS file {}: {source}", path.display())]
    TlsFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid TLS material in {}: {source}", path.display())]
    TlsMaterial {
        path: PathBuf,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),
}

/// Live capture failures on the agent side.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("failed to open capture on '{interface}': {source}")]
    Open {
        interface: String,
        #[source]
        source: pcap::Error,
    },

    #[error("invalid capture filter '{filter}': {source}")]
    Filter {
        filter: String,
        #[source]
        source: pcap::Error,
    },

    #[error("capture read failed: {0}")]
    Read(#[source] pcap::Error),

    #[error("failed to list interfaces: {0}")]
    Devices(#[source] pcap::Error),

    #[error("capture task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("capture source ended")]
    SourceEnded,
}

/// Malformed container data. Guards the client decoder; the agent is a
/// well-formed writer so these never originate locally.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("bad magic number {0:#010x}")]
    BadMagic(u32),

    #[error("unsupported pcap version {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },

    #[error("snapshot length {0} exceeds the supported maximum")]
    SnaplenTooLarge(u32),

    #[error("record length {length} exceeds snapshot length {snaplen}")]
    OversizedRecord { length: u32, snaplen: u32 },

    #[error("stream ended mid-record")]
    Truncated,
}

/// One remote stream's failure as seen by the merger. Never fatal to the
/// merge; recorded per stream in the summary.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("stream error: {0}")]
    Io(#[from] io::Error),
}

/// Fatal merge failure. Everything past the header is contained per stream.
#[derive(Error, Debug)]
pub enum MergeError {
    #[error("failed to write output header: {0}")]
    Header(#[source] io::Error),
}

impl IntoResponse for CaptureError {
    fn into_response(self) -> Response {
        let status = match &self {
            CaptureError::Filter { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = self.to_string();

        tracing::error!("{}: {}", status, message);
        (status, message).into_response()
    }
}
