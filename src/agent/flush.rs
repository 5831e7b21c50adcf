//! Periodic flushing for the streaming response body.

use std::io::{self, Write};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};

/// Flush cadence for pending capture data.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Pending bytes above this trigger an immediate flush instead of waiting for
/// the next tick.
const HIGH_WATER: usize = 64 * 1024;

/// `io::Write` decorator over the response-body channel.
///
/// Writes land in an internal buffer; a scoped flush task owned by the sink
/// forwards buffered bytes to the channel once per interval, or sooner past
/// the high-water mark. A writer that outruns a stalled peer blocks until the
/// flusher catches up, so backpressure reaches the capture session instead of
/// growing the buffer. Dropping the sink stops the task after a final flush.
pub struct FlushedSink {
    shared: Arc<Shared>,
    _stop: DropGuard,
}

struct Shared {
    state: Mutex<Pending>,
    drained: Condvar,
    kick: Notify,
}

struct Pending {
    buf: BytesMut,
    closed: bool,
}

impl FlushedSink {
    /// Create the sink and start its flush task on the current runtime.
    pub fn new(tx: mpsc::Sender<Bytes>, interval: Duration) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(Pending {
                buf: BytesMut::new(),
                closed: false,
            }),
            drained: Condvar::new(),
            kick: Notify::new(),
        });
        let stop = CancellationToken::new();
        tokio::spawn(flush_loop(Arc::clone(&shared), tx, interval, stop.clone()));
        Self {
            shared,
            _stop: stop.drop_guard(),
        }
    }
}

impl Shared {
    fn lock(&self) -> io::Result<MutexGuard<'_, Pending>> {
        self.state
            .lock()
            .map_err(|_| io::Error::other("flush state poisoned"))
    }

    /// Take everything buffered, waking any writer waiting for space.
    fn take_pending(&self) -> io::Result<Option<Bytes>> {
        let mut state = self.lock()?;
        let chunk = if state.buf.is_empty() {
            None
        } else {
            Some(state.buf.split().freeze())
        };
        drop(state);
        if chunk.is_some() {
            self.drained.notify_all();
        }
        Ok(chunk)
    }

    fn mark_closed(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.closed = true;
        }
        self.drained.notify_all();
    }
}

/// Marks the sink closed even if the flush task is dropped mid-await, so no
/// writer stays blocked on the condvar.
struct ClosedOnDrop(Arc<Shared>);

impl Drop for ClosedOnDrop {
    fn drop(&mut self) {
        self.0.mark_closed();
    }
}

async fn flush_loop(
    shared: Arc<Shared>,
    tx: mpsc::Sender<Bytes>,
    interval: Duration,
    stop: CancellationToken,
) {
    let _closed = ClosedOnDrop(Arc::clone(&shared));
    let mut tick = time::interval(interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            // An idle session buffers nothing, so a send would never happen;
            // watching the receiver is the only way it learns the peer left.
            _ = tx.closed() => return,
            _ = tick.tick() => {}
            _ = shared.kick.notified() => {}
        }
        match shared.take_pending() {
            Ok(Some(chunk)) => {
                if tx.send(chunk).await.is_err() {
                    return;
                }
            }
            Ok(None) => {}
            Err(_) => return,
        }
    }

    // Sink dropped: hand off whatever is still buffered.
    if let Ok(Some(chunk)) = shared.take_pending() {
        let _ = tx.send(chunk).await;
    }
}

impl Write for FlushedSink {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut state = self.shared.lock()?;
        loop {
            if state.closed {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "stream receiver closed",
                ));
            }
            if state.buf.len() < HIGH_WATER {
                state.buf.extend_from_slice(data);
                if state.buf.len() >= HIGH_WATER {
                    self.shared.kick.notify_one();
                }
                return Ok(data.len());
            }
            state = self
                .shared
                .drained
                .wait(state)
                .map_err(|_| io::Error::other("flush state poisoned"))?;
        }
    }

    /// Request an early flush. Errors once the peer is gone, which doubles as
    /// the liveness probe for idle capture sessions.
    fn flush(&mut self) -> io::Result<()> {
        let state = self.shared.lock()?;
        if state.closed {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "stream receiver closed",
            ));
        }
        if !state.buf.is_empty() {
            self.shared.kick.notify_one();
        }
        Ok(())
    }
}
