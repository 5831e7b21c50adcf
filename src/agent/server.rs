//! Capture endpoint handler.
//!
//! GET /capture?interface=eth0&filter=port+53
//! Opens a live capture and streams it back as a pcap body until the client
//! disconnects.

use std::convert::Infallible;
use std::io::Write;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::agent::filter::effective_filter;
use crate::agent::flush::{FlushedSink, FLUSH_INTERVAL};
use crate::capture::{CaptureSpec, PacketSource, SourceOpener, DEFAULT_INTERFACE};
use crate::codec::{FrameWriter, MAX_FRAME_LENGTH};
use crate::error::CaptureError;

/// Media type for the streamed capture body.
pub const PCAP_CONTENT_TYPE: &str = "application/vnd.tcpdump.pcap";

/// Route the capture endpoint is served on.
pub const CAPTURE_PATH: &str = "/capture";

/// Chunks in flight between the capture session and the HTTP body.
const BODY_CHANNEL_CAPACITY: usize = 8;

/// Shared state for the capture endpoint.
#[derive(Clone)]
pub struct AgentState {
    opener: Arc<dyn SourceOpener>,
    exclusion: Option<String>,
}

impl AgentState {
    /// `exclusion` is the filter clause keeping the agent's own control
    /// traffic out of its captures, None when serving on a unix socket.
    pub fn new(opener: Arc<dyn SourceOpener>, exclusion: Option<String>) -> Self {
        Self { opener, exclusion }
    }
}

/// Query parameters for the capture endpoint.
#[derive(Debug, Deserialize, Default)]
pub struct CaptureParams {
    pub interface: Option<String>,
    pub filter: Option<String>,
}

/// HTTP request logging middleware.
///
/// Logs each request in format: "METHOD PATH - STATUS"
async fn request_logging(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();

    let response = next.run(request).await;

    let status = response.status();
    tracing::info!("{} {} - {}", method, uri, status.as_u16());

    response
}

/// Create the agent router.
pub fn router(state: AgentState) -> Router {
    Router::new()
        .route(CAPTURE_PATH, get(handle_capture))
        .layer(middleware::from_fn(request_logging))
        .with_state(state)
}

/// Handle GET /capture
///
/// Opens the requested interface, then streams pcap data until the peer hangs
/// up. The open happens before the response status is committed, so filter
/// and interface errors still surface as proper error responses.
pub async fn handle_capture(
    State(state): State<AgentState>,
    Query(params): Query<CaptureParams>,
) -> Result<Response, CaptureError> {
    let interface = params
        .interface
        .unwrap_or_else(|| DEFAULT_INTERFACE.to_string());
    let filter = effective_filter(
        params.filter.as_deref().unwrap_or_default(),
        state.exclusion.as_deref(),
    );
    tracing::info!("capture request: interface={}, filter={:?}", interface, filter);

    let spec = CaptureSpec::new(interface, filter);
    let opener = Arc::clone(&state.opener);
    let source = task::spawn_blocking(move || opener.open(&spec)).await??;

    let (tx, rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
    let sink = FlushedSink::new(tx, FLUSH_INTERVAL);
    task::spawn_blocking(move || {
        if let Err(e) = run_session(source, sink) {
            tracing::error!("capture session ended: {}", e);
        }
    });

    let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
    let body = Body::from_stream(stream);

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, PCAP_CONTENT_TYPE)
        .body(body)
        .unwrap())
}

/// Pump frames from an open source into the response sink.
///
/// Sink errors mean the client went away; that is the normal way a session
/// ends and is not reported upward. Idle poll windows flush buffered data and
/// double as a liveness probe, so a session with no matching traffic still
/// notices a dead peer within a poll interval.
fn run_session<W: Write>(mut source: Box<dyn PacketSource>, sink: W) -> Result<(), CaptureError> {
    let mut writer = FrameWriter::new(sink);
    if let Err(e) = writer.write_header(MAX_FRAME_LENGTH, source.link_type()) {
        tracing::debug!("capture stream closed before header: {}", e);
        return Ok(());
    }
    loop {
        match source.next_frame()? {
            Some(frame) => {
                if let Err(e) = writer.write_frame(&frame) {
                    tracing::debug!("capture stream closed: {}", e);
                    return Ok(());
                }
            }
            None => {
                if let Err(e) = writer.flush() {
                    tracing::debug!("capture stream closed: {}", e);
                    return Ok(());
                }
            }
        }
    }
}
