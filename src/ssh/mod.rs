//! SSH module - the server side of the bridge
//!
//! This module runs an SSH server using the russh library over the process's
//! standard streams.
//!
//! # Features
//! - Stdio transport for `ProxyCommand` use
//! - Trivial authentication (the pipe is the trust boundary)
//! - Shell and exec channels relayed through the relay helper
//! - Direct-tcpip forwarding through broker port-forwarding sessions
//! - Channel registrar resolving channel ids to channel handles

pub mod channel;
pub mod context;
mod error;
pub mod registrar;
mod server;
mod transport;

pub use channel::{ChannelCloser, Identified, RelayChannel};
pub use context::{RelayContext, RelaySettings};
pub use error::BridgeError;
pub use registrar::{ChannelAcceptor, ChannelRegistrar, DEFAULT_ACCEPT_ATTEMPTS, DEFAULT_ACCEPT_TIMEOUT};
pub use server::{
    dispatch_open, BridgeHandler, BridgeServer, ConnectionState, OpenOutcome, OpenRequest, Refusal,
    ShutdownHandle, StateCell, BANNER,
};
pub use transport::StdioTransport;
