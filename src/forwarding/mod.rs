//! Port Forwarding Module
//!
//! Serves `direct-tcpip` channels. Each forward gets its own broker
//! port-forwarding session, a relay helper listening on a free local port,
//! and a socket connected to that port which the channel is pumped through.

mod forward;
pub mod port;
mod tunnel;

pub use forward::{pump, spawn_forward, PumpStats, DEFAULT_CHUNK_SIZE};
pub use port::{base_port, next_free_port, next_free_port_with, DEFAULT_PORT_OFFSET, DEFAULT_PORT_TRIES};
pub use tunnel::{run_tunnel, SsmTunnelOpener, Tunnel, TunnelOpener};
