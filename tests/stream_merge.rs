//! End-to-end merges: scripted agents served over loopback HTTP, real
//! connections through the stream client, fan-in through the merger.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::codec::Decoder;

use capmux::agent::{router, AgentState, PCAP_CONTENT_TYPE};
use capmux::capture::{CaptureSpec, PacketSource, SourceOpener};
use capmux::codec::{CapturedFrame, FrameDecoder, FrameWriter, LinkType, MAX_FRAME_LENGTH};
use capmux::error::CaptureError;
use capmux::merger::{StreamEnd, StreamMerger};
use capmux::stream::{RemoteTarget, StreamClient, TlsSettings};

/// Capture backend that plays back a fixed frame list.
struct ScriptedOpener {
    frames: Vec<CapturedFrame>,
    /// After the script: keep ticking like an idle live capture, or die the
    /// way a real source does when its interface goes away.
    idle_after: bool,
    seen: Mutex<Vec<CaptureSpec>>,
}

impl ScriptedOpener {
    fn new(frames: Vec<CapturedFrame>, idle_after: bool) -> Arc<Self> {
        Arc::new(Self {
            frames,
            idle_after,
            seen: Mutex::new(Vec::new()),
        })
    }

    fn seen_specs(&self) -> Vec<CaptureSpec> {
        self.seen.lock().unwrap().clone()
    }
}

impl SourceOpener for ScriptedOpener {
    fn open(&self, spec: &CaptureSpec) -> Result<Box<dyn PacketSource>, CaptureError> {
        self.seen.lock().unwrap().push(spec.clone());
        Ok(Box::new(ScriptedSource {
            frames: self.frames.clone().into(),
            idle_after: self.idle_after,
        }))
    }
}

struct ScriptedSource {
    frames: VecDeque<CapturedFrame>,
    idle_after: bool,
}

impl PacketSource for ScriptedSource {
    fn link_type(&self) -> LinkType {
        LinkType::ETHERNET
    }

    fn next_frame(&mut self) -> Result<Option<CapturedFrame>, CaptureError> {
        match self.frames.pop_front() {
            Some(frame) => Ok(Some(frame)),
            None if self.idle_after => {
                thread::sleep(Duration::from_millis(20));
                Ok(None)
            }
            None => Err(CaptureError::SourceEnded),
        }
    }
}

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn frame(payload: &[u8]) -> CapturedFrame {
    CapturedFrame::new(
        UNIX_EPOCH + Duration::from_secs(1_700_000_000),
        payload.len() as u32,
        Bytes::copy_from_slice(payload),
    )
}

async fn spawn_agent(opener: Arc<dyn SourceOpener>, exclusion: Option<String>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(AgentState::new(opener, exclusion));
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service()).await.unwrap();
    });
    addr
}

/// A fake agent that answers one request with a stream cut mid-record.
async fn spawn_truncating_agent(frames: &[CapturedFrame]) -> SocketAddr {
    let mut body = Vec::new();
    {
        let mut writer = FrameWriter::new(&mut body);
        writer
            .write_header(MAX_FRAME_LENGTH, LinkType::ETHERNET)
            .unwrap();
        for frame in frames {
            writer.write_frame(frame).unwrap();
        }
    }
    body.truncate(body.len() - 1);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = [0u8; 1024];
        let _ = socket.read(&mut request).await;
        socket
            .write_all(b"HTTP/1.1 200 OK\r\nconnection: close\r\n\r\n")
            .await
            .unwrap();
        socket.write_all(&body).await.unwrap();
        socket.shutdown().await.unwrap();
    });
    addr
}

fn decode_all(bytes: &[u8]) -> (LinkType, Vec<CapturedFrame>) {
    let mut decoder = FrameDecoder::new();
    let mut buf = BytesMut::from(bytes);
    let mut frames = Vec::new();
    while let Some(frame) = decoder.decode(&mut buf).unwrap() {
        frames.push(frame);
    }
    assert!(decoder.decode_eof(&mut buf).unwrap().is_none());
    (decoder.header().unwrap().link_type, frames)
}

fn plain_client() -> StreamClient {
    StreamClient::new(&TlsSettings::default()).unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_one_failed_target_leaves_others_complete() {
    let opener_a = ScriptedOpener::new(vec![frame(b"a1"), frame(b"a2")], false);
    let addr_a = spawn_agent(opener_a, None).await;
    let addr_b = spawn_truncating_agent(&[frame(b"b1"), frame(b"b2")]).await;

    let client = plain_client();
    let mut merger = StreamMerger::new();
    merger.add_target(
        &client,
        RemoteTarget::parse(&format!("http://{}", addr_a)).unwrap(),
    );
    merger.add_target(
        &client,
        RemoteTarget::parse(&format!("http://{}", addr_b)).unwrap(),
    );

    let out = SharedBuf::default();
    let summary = timeout(Duration::from_secs(10), merger.start(out.clone()))
        .await
        .expect("merge did not finish")
        .unwrap();

    assert!(matches!(summary.streams[0].end, StreamEnd::Eof));
    assert_eq!(summary.streams[0].frames, 2);
    assert!(matches!(summary.streams[1].end, StreamEnd::Failed(_)));
    assert_eq!(summary.streams[1].frames, 1);
    assert_eq!(summary.frames_written, 3);

    let (link_type, frames) = decode_all(&out.contents());
    assert_eq!(link_type, LinkType::LINUX_SLL);
    let payloads: Vec<_> = frames.iter().map(|f| f.payload.as_ref()).collect();
    assert_eq!(payloads.len(), 3);
    let a1 = payloads.iter().position(|p| *p == b"a1").unwrap();
    let a2 = payloads.iter().position(|p| *p == b"a2").unwrap();
    assert!(a1 < a2);
    assert!(payloads.contains(&b"b1".as_ref()));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unreachable_target_leaves_others_complete() {
    let opener = ScriptedOpener::new(vec![frame(b"only")], false);
    let addr = spawn_agent(opener, None).await;

    // Grab a loopback port, then free it so connecting gets refused.
    let dead_addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };

    let client = plain_client();
    let mut merger = StreamMerger::new();
    merger.add_target(
        &client,
        RemoteTarget::parse(&format!("http://{}", addr)).unwrap(),
    );
    merger.add_target(
        &client,
        RemoteTarget::parse(&format!("http://{}", dead_addr)).unwrap(),
    );

    let out = SharedBuf::default();
    let summary = timeout(Duration::from_secs(10), merger.start(out.clone()))
        .await
        .expect("merge did not finish")
        .unwrap();

    assert!(matches!(summary.streams[0].end, StreamEnd::Eof));
    assert!(matches!(summary.streams[1].end, StreamEnd::Failed(_)));
    assert_eq!(summary.streams[1].frames, 0);

    let (_, frames) = decode_all(&out.contents());
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].payload.as_ref(), b"only");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_close_before_any_frame_yields_header_only() {
    let opener = ScriptedOpener::new(Vec::new(), true);
    let addr = spawn_agent(Arc::clone(&opener) as Arc<dyn SourceOpener>, None).await;

    let client = plain_client();
    let mut merger = StreamMerger::new();
    merger.add_target(
        &client,
        RemoteTarget::parse(&format!("http://{}", addr)).unwrap(),
    );
    let handle = merger.shutdown_handle();

    let out = SharedBuf::default();
    let run = tokio::spawn({
        let out = out.clone();
        async move { merger.start(out).await }
    });

    // Wait for the agent to have opened its capture session, so the close
    // lands on a live connection rather than short-circuiting the connect.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while opener.seen_specs().is_empty() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "agent never saw the request"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    handle.close();
    let summary = timeout(Duration::from_secs(5), run)
        .await
        .expect("merge did not stop")
        .unwrap()
        .unwrap();

    assert_eq!(summary.frames_written, 0);
    assert!(matches!(summary.streams[0].end, StreamEnd::Cancelled));
    assert_eq!(out.contents().len(), 24, "only the header goes out");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_query_params_and_exclusion_reach_the_capture() {
    let opener = ScriptedOpener::new(Vec::new(), true);
    let exclusion = "not (tcp and port 8475)".to_string();
    let addr = spawn_agent(
        Arc::clone(&opener) as Arc<dyn SourceOpener>,
        Some(exclusion),
    )
    .await;

    let url = format!("http://{}/capture?interface=eth1&filter=udp", addr);
    let response = reqwest::get(&url).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        PCAP_CONTENT_TYPE
    );
    drop(response);

    let specs = opener.seen_specs();
    assert_eq!(specs.len(), 1);
    assert_eq!(specs[0].interface, "eth1");
    assert_eq!(specs[0].filter, "(udp) and (not (tcp and port 8475))");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bad_filter_is_rejected_before_streaming() {
    struct RejectingOpener;

    impl SourceOpener for RejectingOpener {
        fn open(&self, spec: &CaptureSpec) -> Result<Box<dyn PacketSource>, CaptureError> {
            Err(CaptureError::Filter {
                filter: spec.filter.clone(),
                source: pcap::Error::PcapError("syntax error".to_string()),
            })
        }
    }

    let addr = spawn_agent(Arc::new(RejectingOpener), None).await;
    let url = format!("http://{}/capture?filter=no+such+primitive", addr);
    let response = reqwest::get(&url).await.unwrap();
    assert_eq!(response.status(), 400);
}
