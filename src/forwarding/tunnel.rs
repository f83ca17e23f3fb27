//! Tunnels: local sockets connected into a broker port-forwarding session

use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncBufReadExt;
use tokio::net::TcpStream;
use tokio::process::Child;
use tracing::{debug, info, warn};

use super::port::{base_port, next_free_port};
use crate::broker::{SessionBroker, SessionRequest};
use crate::session::HelperInvocation;
use crate::ssh::{BridgeError, RelaySettings};

/// Connect attempts once the helper reports it is listening
const CONNECT_ATTEMPTS: usize = 10;

const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// A connected local socket plus whatever keeps the far end alive
#[derive(Debug)]
pub struct Tunnel {
    pub stream: TcpStream,
    pub host: String,
    pub remote_port: u16,
    pub local_port: u16,
    /// Relay helper serving the local port; killed when dropped
    pub helper: Option<Child>,
}

impl Tunnel {
    /// A tunnel whose listener is not owned by the bridge
    pub fn unmanaged(stream: TcpStream, host: impl Into<String>, remote_port: u16, local_port: u16) -> Self {
        Self {
            stream,
            host: host.into(),
            remote_port,
            local_port,
            helper: None,
        }
    }

    pub fn destination(&self) -> String {
        format!("{}:{}", self.host, self.remote_port)
    }
}

/// Produces connected sockets for direct-tcpip requests
#[async_trait]
pub trait TunnelOpener: Send + Sync {
    /// Connect to `host:port` as seen from the target instance
    async fn open(&self, host: &str, port: u16) -> Result<Tunnel, BridgeError>;
}

/// Opens tunnels by starting a port-forwarding broker session and a relay
/// helper listening on a free local port
pub struct SsmTunnelOpener {
    target: String,
    broker: Arc<dyn SessionBroker>,
    settings: RelaySettings,
}

impl SsmTunnelOpener {
    pub fn new(target: impl Into<String>, broker: Arc<dyn SessionBroker>, settings: RelaySettings) -> Self {
        Self {
            target: target.into(),
            broker,
            settings,
        }
    }
}

#[async_trait]
impl TunnelOpener for SsmTunnelOpener {
    async fn open(&self, host: &str, port: u16) -> Result<Tunnel, BridgeError> {
        let base = base_port(port, self.settings.port_offset, self.settings.port_tries);
        let local_port = next_free_port(base, self.settings.port_tries).await?;
        info!(local_port, "Opening tunnel to {}:{}", host, port);

        let request = SessionRequest::port_forward(&self.target, host, port, local_port);
        let helper = start_forward_helper(self.broker.as_ref(), &self.settings, &request).await?;
        let stream = connect_with_retry(local_port).await?;

        Ok(Tunnel {
            stream,
            host: host.to_string(),
            remote_port: port,
            local_port,
            helper: Some(helper),
        })
    }
}

/// Start a port-forwarding session and a relay helper for it, returning
/// once the helper's listener is up
async fn start_forward_helper(
    broker: &dyn SessionBroker,
    settings: &RelaySettings,
    request: &SessionRequest,
) -> Result<Child, BridgeError> {
    let descriptor = broker.start_session(request).await?;
    info!(session_id = %descriptor.session_id, "Port forwarding session started");

    let mut helper = HelperInvocation::new(&settings.helper_path, &descriptor, broker.context(), request)?
        .with_leading_args(&settings.helper_args)
        .spawn()?;

    match tokio::time::timeout(settings.startup_timeout, helper.wait_until_listening()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            return Err(BridgeError::ForwardEstablish(format!(
                "helper not listening after {}s",
                settings.startup_timeout.as_secs()
            )))
        }
    }

    // Keep reading so per-connection chatter never fills the pipe. The
    // helper's stdin stays open for as long as it keeps talking.
    let stdin = helper.stdin;
    let mut lines = helper.stdout.lines();
    tokio::spawn(async move {
        let _stdin = stdin;
        while let Ok(Some(line)) = lines.next_line().await {
            debug!("Helper: {}", line);
        }
    });

    Ok(helper.child)
}

/// Forward `local_port` on this machine to `host:remote_port` as seen from
/// `target`, until the helper exits.
///
/// Without a local port one is allocated the same way direct-tcpip forwards
/// get theirs.
pub async fn run_tunnel(
    broker: &dyn SessionBroker,
    target: &str,
    host: &str,
    remote_port: u16,
    local_port: Option<u16>,
    settings: &RelaySettings,
) -> Result<ExitStatus, BridgeError> {
    let local_port = match local_port {
        Some(port) => port,
        None => {
            let base = base_port(remote_port, settings.port_offset, settings.port_tries);
            next_free_port(base, settings.port_tries).await?
        }
    };

    let request = SessionRequest::port_forward(target, host, remote_port, local_port);
    let mut helper = start_forward_helper(broker, settings, &request).await?;
    info!(
        "Forwarding localhost:{} to {}:{} via {}",
        local_port, host, remote_port, target
    );

    let status = helper.wait().await?;
    info!("Tunnel helper exited with {}", status);
    Ok(status)
}

/// Connect to the helper's listener, which may lag behind its ready line
async fn connect_with_retry(local_port: u16) -> Result<TcpStream, BridgeError> {
    let mut last_error = None;
    for attempt in 0..CONNECT_ATTEMPTS {
        match TcpStream::connect(("127.0.0.1", local_port)).await {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                return Ok(stream);
            }
            Err(e) => {
                debug!(local_port, attempt, "Tunnel connect failed: {}", e);
                last_error = Some(e);
                tokio::time::sleep(CONNECT_RETRY_DELAY).await;
            }
        }
    }

    warn!(local_port, "Giving up on tunnel connect");
    Err(BridgeError::ForwardEstablish(format!(
        "could not connect to local port {}: {}",
        local_port,
        last_error.map(|e| e.to_string()).unwrap_or_default()
    )))
}
