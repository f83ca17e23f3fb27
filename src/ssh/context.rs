//! Shared state for the relays of one bridge connection

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::channel::Identified;
use super::registrar::{ChannelAcceptor, ChannelRegistrar};
use crate::broker::SessionBroker;
use crate::config::BridgeConfig;
use crate::forwarding::TunnelOpener;

/// Tunables for relays, resolved from [`BridgeConfig`]
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub helper_path: PathBuf,
    pub helper_args: Vec<String>,
    pub chunk_size: usize,
    pub startup_timeout: Duration,
    pub accept_timeout: Duration,
    pub accept_attempts: usize,
    pub port_offset: u16,
    pub port_tries: u16,
}

impl From<&BridgeConfig> for RelaySettings {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            helper_path: config.helper_path.clone(),
            helper_args: config.helper_args.clone(),
            chunk_size: config.chunk_size.max(1),
            startup_timeout: Duration::from_secs(config.startup_timeout_secs),
            accept_timeout: Duration::from_secs(config.channel_accept_timeout_secs),
            accept_attempts: config.channel_accept_attempts.max(1),
            port_offset: config.port_offset,
            port_tries: config.port_tries.max(1),
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self::from(&BridgeConfig::default())
    }
}

/// Everything a relay task needs besides its own channel
pub struct RelayContext<C: Identified> {
    /// Instance every session lands on
    pub target: String,
    pub registrar: ChannelRegistrar<C>,
    pub broker: Arc<dyn SessionBroker>,
    pub tunnels: Arc<dyn TunnelOpener>,
    pub settings: RelaySettings,
}

impl<C: Identified> RelayContext<C> {
    /// Build the context and the acceptor feeding its registrar
    pub fn new(
        target: impl Into<String>,
        broker: Arc<dyn SessionBroker>,
        tunnels: Arc<dyn TunnelOpener>,
        settings: RelaySettings,
    ) -> (Self, ChannelAcceptor<C>) {
        let (registrar, acceptor) =
            ChannelRegistrar::new(settings.accept_timeout, settings.accept_attempts);
        let context = Self {
            target: target.into(),
            registrar,
            broker,
            tunnels,
            settings,
        };
        (context, acceptor)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Relay contexts wired to fakes

    use super::*;
    use crate::forwarding::{Tunnel, TunnelOpener};
    use crate::ssh::channel::testing::PipeChannel;
    use crate::ssh::BridgeError;
    use async_trait::async_trait;
    use std::path::Path;
    use tokio::net::{TcpListener, TcpStream};

    /// Settings that run `script` through `/bin/sh` as the helper
    pub(crate) fn settings(script: &Path) -> RelaySettings {
        RelaySettings {
            helper_path: PathBuf::from("/bin/sh"),
            helper_args: vec![script.display().to_string()],
            startup_timeout: Duration::from_secs(5),
            accept_timeout: Duration::from_millis(200),
            ..RelaySettings::default()
        }
    }

    /// Connects every tunnel to a local echo server, or refuses them all
    pub(crate) struct EchoTunnels {
        pub refuse: bool,
    }

    #[async_trait]
    impl TunnelOpener for EchoTunnels {
        async fn open(&self, host: &str, port: u16) -> Result<Tunnel, BridgeError> {
            if self.refuse {
                return Err(BridgeError::ForwardEstablish(format!("{}:{} unreachable", host, port)));
            }

            let listener = TcpListener::bind("127.0.0.1:0").await?;
            let local_port = listener.local_addr()?.port();
            tokio::spawn(async move {
                if let Ok((mut socket, _)) = listener.accept().await {
                    let (mut rx, mut tx) = socket.split();
                    let _ = tokio::io::copy(&mut rx, &mut tx).await;
                }
            });

            let stream = TcpStream::connect(("127.0.0.1", local_port)).await?;
            Ok(Tunnel::unmanaged(stream, host, port, local_port))
        }
    }

    pub(crate) fn relay_context(
        broker: Arc<dyn SessionBroker>,
        script: &Path,
    ) -> (Arc<RelayContext<PipeChannel>>, ChannelAcceptor<PipeChannel>) {
        let (context, acceptor) = RelayContext::new(
            "i-test",
            broker,
            Arc::new(EchoTunnels { refuse: false }),
            settings(script),
        );
        (Arc::new(context), acceptor)
    }
}
