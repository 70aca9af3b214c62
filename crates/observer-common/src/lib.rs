//! Types and wire helpers shared by the observer agent and server.

pub mod compress;
pub mod crypto;
pub mod duration;
pub mod sign;
pub mod types;

/// Header carrying the agent's own address, checked against the server's
/// trusted subnet.
pub const REAL_IP_HEADER: &str = "x-real-ip";
