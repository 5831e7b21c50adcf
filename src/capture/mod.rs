//! Live capture abstraction.
//!
//! The agent reaches the OS capture machinery only through the narrow
//! `SourceOpener`/`PacketSource` traits, so capture sessions can be driven by
//! scripted sources in tests and the libpcap backend stays swappable.

mod live;

pub use live::{list_interfaces, LiveCapture, LiveOpener};

use std::time::Duration;

use crate::codec::{CapturedFrame, LinkType, MAX_FRAME_LENGTH};
use crate::error::CaptureError;

/// Default capture interface: the "any" pseudo-device (all interfaces).
pub const DEFAULT_INTERFACE: &str = "any";

/// How long one `next_frame` call may block before yielding a keepalive tick.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Parameters for one live capture session.
#[derive(Debug, Clone)]
pub struct CaptureSpec {
    pub interface: String,
    /// BPF filter expression, opaque to this crate. Empty captures everything.
    pub filter: String,
    pub snaplen: u32,
    pub promiscuous: bool,
    pub poll_timeout: Duration,
}

impl CaptureSpec {
    pub fn new(interface: impl Into<String>, filter: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            filter: filter.into(),
            snaplen: MAX_FRAME_LENGTH,
            promiscuous: true,
            poll_timeout: POLL_TIMEOUT,
        }
    }
}

/// An open capture session: a lazy, unbounded sequence of frames.
pub trait PacketSource: Send {
    /// Native encapsulation of this source's frames.
    fn link_type(&self) -> LinkType;

    /// Pull the next frame. `Ok(None)` is a poll-timeout tick, not the end;
    /// a live capture only stops by failing.
    fn next_frame(&mut self) -> Result<Option<CapturedFrame>, CaptureError>;
}

/// Opens capture sessions from a [`CaptureSpec`].
pub trait SourceOpener: Send + Sync {
    fn open(&self, spec: &CaptureSpec) -> Result<Box<dyn PacketSource>, CaptureError>;
}
