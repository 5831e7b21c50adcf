//! Fan-in of capture streams into a single output container.
//!
//! Each input stream gets a reader task that decodes frames and hands them
//! over a bounded channel; one supervisor loop pulls from all channels and
//! writes records in arrival order. A stream that dies takes only itself
//! down. Channel backpressure propagates to the remote agents through the
//! unread HTTP bodies, so a slow output disk throttles every capture at its
//! source instead of buffering without bound.

use std::io::{self, Write};

use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{StreamExt, StreamMap};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use crate::codec::{CapturedFrame, FrameDecoder, FrameWriter, LinkType, MAX_FRAME_LENGTH};
use crate::error::{MergeError, StreamError};
use crate::stream::{RemoteTarget, StreamClient};

/// Frames buffered per input stream before backpressure kicks in.
const STREAM_CHANNEL_CAPACITY: usize = 64;

/// How one input stream finished.
#[derive(Debug)]
pub enum StreamEnd {
    /// The agent closed the stream after a well-formed final record.
    Eof,
    /// The stream was still live when the merge shut down.
    Cancelled,
    /// The stream died on its own: transport error or malformed data.
    Failed(StreamError),
}

impl StreamEnd {
    pub fn is_clean(&self) -> bool {
        !matches!(self, StreamEnd::Failed(_))
    }
}

/// Per-stream accounting for the merge summary.
#[derive(Debug)]
pub struct StreamReport {
    pub label: String,
    /// Frames from this stream that made it into the output.
    pub frames: u64,
    pub end: StreamEnd,
}

/// What a finished merge run did.
#[derive(Debug, Default)]
pub struct MergeSummary {
    pub frames_written: u64,
    /// Frames pulled from input channels after shutdown began.
    pub frames_discarded: u64,
    pub streams: Vec<StreamReport>,
}

struct StreamHandle {
    label: String,
    rx: Option<mpsc::Receiver<CapturedFrame>>,
    done: JoinHandle<StreamEnd>,
}

/// Supervisor for a set of capture streams merging into one output.
///
/// Add inputs, then [`start`](Self::start) to run until every stream ends or
/// [`close`](Self::close) is called. Dropping the merger cancels any reader
/// tasks it spawned.
pub struct StreamMerger {
    streams: Vec<StreamHandle>,
    cancel: CancellationToken,
}

impl StreamMerger {
    pub fn new() -> Self {
        Self {
            streams: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Connect to an agent and feed its stream into the merge.
    ///
    /// The connection is made in the background; a target that cannot be
    /// reached shows up as a failed stream in the summary rather than
    /// blocking the others.
    pub fn add_target(&mut self, client: &StreamClient, target: RemoteTarget) {
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let token = self.cancel.clone();
        let client = client.clone();
        let label = target.to_string();
        let done = tokio::spawn(async move {
            let reader = tokio::select! {
                biased;
                _ = token.cancelled() => return StreamEnd::Cancelled,
                opened = client.open(&target) => match opened {
                    Ok(reader) => reader,
                    Err(e) => return StreamEnd::Failed(e),
                },
            };
            run_stream(reader, tx, token).await
        });
        self.streams.push(StreamHandle {
            label,
            rx: Some(rx),
            done,
        });
    }

    /// Feed an already-open stream into the merge.
    pub fn add_reader<R>(&mut self, label: impl Into<String>, reader: R)
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let token = self.cancel.clone();
        let done = tokio::spawn(run_stream(reader, tx, token));
        self.streams.push(StreamHandle {
            label: label.into(),
            rx: Some(rx),
            done,
        });
    }

    /// A handle that stops the merge from another task.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.cancel.clone())
    }

    /// Stop the merge. Safe to call from any task, any number of times.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Run the merge until every input ends or the merger is closed.
    ///
    /// The output header is the only fatal write: after it, a failing output
    /// shuts the merge down and still yields a summary. On shutdown, frames
    /// already decoded but not yet written are discarded, never half-written,
    /// so the output always ends on a record boundary.
    pub async fn start<W: Write>(&mut self, out: W) -> Result<MergeSummary, MergeError> {
        let mut writer = FrameWriter::new(out);
        writer
            .write_header(MAX_FRAME_LENGTH, LinkType::LINUX_SLL)
            .map_err(MergeError::Header)?;

        let mut inputs = StreamMap::new();
        for (id, stream) in self.streams.iter_mut().enumerate() {
            if let Some(rx) = stream.rx.take() {
                inputs.insert(id, ReceiverStream::new(rx));
            }
        }
        let mut counts = vec![0u64; self.streams.len()];
        let mut summary = MergeSummary::default();

        loop {
            let (id, frame) = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                next = inputs.next() => match next {
                    Some(pair) => pair,
                    None => break,
                },
            };
            // The frame that hit the failing write is lost, not drained; it
            // stays out of the discard tally.
            if let Err(e) = writer.write_frame(&frame) {
                tracing::error!("output write failed: {}", e);
                self.cancel.cancel();
                break;
            }
            summary.frames_written += 1;
            counts[id] += 1;
        }

        self.cancel.cancel();

        // Unblock reader tasks parked on full channels and account for what
        // they had already decoded.
        while inputs.next().await.is_some() {
            summary.frames_discarded += 1;
        }

        if let Err(e) = writer.flush() {
            tracing::debug!("output flush failed: {}", e);
        }

        for (id, stream) in self.streams.drain(..).enumerate() {
            let end = match stream.done.await {
                Ok(end) => end,
                Err(e) => StreamEnd::Failed(StreamError::Io(io::Error::other(e))),
            };
            match &end {
                StreamEnd::Failed(e) => tracing::warn!("stream {} failed: {}", stream.label, e),
                _ => tracing::debug!("stream {} ended", stream.label),
            }
            summary.streams.push(StreamReport {
                label: stream.label,
                frames: counts[id],
                end,
            });
        }

        Ok(summary)
    }
}

impl Default for StreamMerger {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for StreamMerger {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Clonable handle that stops a running merge.
#[derive(Clone)]
pub struct ShutdownHandle(CancellationToken);

impl ShutdownHandle {
    pub fn close(&self) {
        self.0.cancel();
    }
}

/// Decode frames off one reader and forward them to the supervisor.
async fn run_stream<R>(
    reader: R,
    tx: mpsc::Sender<CapturedFrame>,
    token: CancellationToken,
) -> StreamEnd
where
    R: AsyncRead + Send + Unpin,
{
    let mut frames = FramedRead::new(reader, FrameDecoder::new());
    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => return StreamEnd::Cancelled,
            next = frames.next() => next,
        };
        match next {
            Some(Ok(frame)) => {
                let sent = tokio::select! {
                    biased;
                    _ = token.cancelled() => return StreamEnd::Cancelled,
                    sent = tx.send(frame) => sent,
                };
                if sent.is_err() {
                    return StreamEnd::Cancelled;
                }
            }
            Some(Err(e)) => return StreamEnd::Failed(e),
            None => return StreamEnd::Eof,
        }
    }
}
