//! Capture filter assembly.
//!
//! The agent must never capture its own response traffic: streaming captured
//! bytes produces more traffic, and capturing that traffic would amplify the
//! stream without bound. Every session filter therefore carries a clause
//! excluding the agent's own listener.

use std::net::SocketAddr;

/// Exclusion clause for a TCP listener bound at `addr`.
///
/// A wildcard bind excludes by port alone; a specific bind excludes only
/// traffic to or from that address and port. Unix-socket listeners produce no
/// network traffic and need no clause.
pub fn self_exclusion(addr: &SocketAddr) -> String {
    if addr.ip().is_unspecified() {
        format!("not (tcp and port {})", addr.port())
    } else {
        format!("not (host {} and tcp and port {})", addr.ip(), addr.port())
    }
}

/// Combine the caller's filter with the agent's exclusion clause.
pub fn effective_filter(requested: &str, exclusion: Option<&str>) -> String {
    match (requested.is_empty(), exclusion) {
        (true, Some(exclusion)) => exclusion.to_string(),
        (true, None) => String::new(),
        (false, Some(exclusion)) => format!("({}) and ({})", requested, exclusion),
        (false, None) => requested.to_string(),
    }
}
