//! Local port allocation for forwarding sessions
//!
//! The relay helper binds the local end of each forward itself, so the bridge
//! can only guess a free port by probing. A later bind by the helper can still
//! lose the race; that surfaces as a forwarding failure.

use std::future::Future;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::debug;

use crate::ssh::BridgeError;

/// Offset added to the destination port to pick the first candidate
pub const DEFAULT_PORT_OFFSET: u16 = 3000;

/// Consecutive ports probed before giving up
pub const DEFAULT_PORT_TRIES: u16 = 20;

/// Lowest candidate when the offset port would overflow
const LOWEST_PORT: u32 = 1024;

const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// First candidate port for forwards to `remote_port`.
///
/// Different destinations start at different bases so parallel forwards
/// rarely compete for the same ports. Bases that would leave no room for
/// `tries` probes are folded back into the unprivileged range.
pub fn base_port(remote_port: u16, offset: u16, tries: u16) -> u16 {
    let ceiling = (u16::MAX as u32).saturating_sub(tries as u32).max(LOWEST_PORT + 1);
    let raw = remote_port as u32 + offset as u32;
    let base = if raw < ceiling {
        raw.max(LOWEST_PORT)
    } else {
        LOWEST_PORT + raw % (ceiling - LOWEST_PORT)
    };
    base as u16
}

/// Return the first port in `[base, base + tries)` the probe reports free.
///
/// `probe` resolves to `true` when something is already listening.
pub async fn next_free_port_with<F, Fut>(base: u16, tries: u16, mut probe: F) -> Result<u16, BridgeError>
where
    F: FnMut(u16) -> Fut,
    Fut: Future<Output = bool>,
{
    for offset in 0..tries {
        let Some(port) = base.checked_add(offset) else {
            break;
        };
        if !probe(port).await {
            debug!(port, "Found free local port");
            return Ok(port);
        }
        debug!(port, "Local port in use");
    }

    Err(BridgeError::ForwardEstablish(format!(
        "no free local port in {} tries from {}",
        tries, base
    )))
}

/// Probe loopback ports by connecting; a refused connect means free
pub async fn next_free_port(base: u16, tries: u16) -> Result<u16, BridgeError> {
    next_free_port_with(base, tries, |port| async move {
        matches!(
            tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await,
            Ok(Ok(_))
        )
    })
    .await
}
