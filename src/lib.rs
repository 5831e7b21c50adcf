//! capmux - distributed packet capture.
//!
//! A `capmuxd` agent on each remote host serves its live traffic as a pcap
//! stream over HTTP(S); the `capmux` client connects to any number of agents
//! and merges their streams into one pcap output.
//!
//! Library layout mirrors the two sides of the wire: [`codec`] is the shared
//! container format, [`capture`] and [`agent`] are the daemon side, [`stream`]
//! and [`merger`] are the client side.

pub mod agent;
pub mod capture;
pub mod codec;
pub mod error;
pub mod merger;
pub mod stream;

pub use codec::{CapturedFrame, ContainerHeader, FrameDecoder, FrameWriter, LinkType};
pub use error::{CaptureError, ConfigError, MergeError, ProtocolError, StreamError};
pub use merger::{MergeSummary, StreamEnd, StreamMerger};
pub use stream::{RemoteTarget, StreamClient, TlsSettings};
