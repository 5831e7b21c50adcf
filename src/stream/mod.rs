//! Client side: connects to agents and reads their capture streams.

mod client;
mod tls;

pub use client::{RemoteTarget, StreamClient};
pub use tls::TlsSettings;
