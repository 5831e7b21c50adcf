//! Agent side: serves live captures over HTTP.

pub mod filter;
pub mod flush;
pub mod server;

pub use filter::{effective_filter, self_exclusion};
pub use flush::{FlushedSink, FLUSH_INTERVAL};
pub use server::{router, AgentState, CaptureParams, CAPTURE_PATH, PCAP_CONTENT_TYPE};
