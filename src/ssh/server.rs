//! SSH server side of the bridge
//!
//! One [`BridgeServer`] serves exactly one SSH connection, normally over the
//! process's stdin/stdout. Its russh handler turns channel requests into
//! relays: session channels become shell or exec relays once the client asks
//! for one, direct-tcpip channels become forwards through a tunnel.
//!
//! Every authentication attempt succeeds. The transport is the stdio of a
//! single local `ProxyCommand` invocation that the operator already started,
//! so there is no one else to keep out. Serving this handler on a network
//! socket would let anyone in.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use russh::keys::{PrivateKey, PublicKey};
use russh::server::{Auth, Config, Handler, Msg, Session};
use russh::{Channel, ChannelId, MethodKind, MethodSet};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, error, info, warn};

use super::channel::{ChannelCloser, RelayChannel};
use super::context::{RelayContext, RelaySettings};
use super::error::BridgeError;
use super::registrar::ChannelAcceptor;
use super::transport::StdioTransport;
use crate::broker::SessionBroker;
use crate::forwarding::{spawn_forward, TunnelOpener};
use crate::session::{spawn_shell, ShellMode};

/// Sent to the client once per connection
pub const BANNER: &str = "SSM CLI - ProxyCommand SSH server\r\n";

/// A channel-open request, by kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenRequest {
    Session,
    DirectTcpIp {
        host: String,
        port: u32,
        originator: String,
        originator_port: u32,
    },
    /// Any other channel type, by name
    Unsupported(String),
}

/// Why a channel open was turned down.
///
/// The reason is logged. On the wire russh answers every refused open with
/// `SSH_OPEN_ADMINISTRATIVELY_PROHIBITED`: its handler only returns a bool and
/// never sees the client's channel number, so no other status can be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Refusal {
    /// Channel kind the bridge does not serve
    Prohibited(String),
    /// No tunnel could be opened to the destination
    ConnectFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenOutcome {
    Accepted,
    Refused(Refusal),
}

/// Decide a channel-open request and start whatever serves it.
///
/// Session channels are queued for the shell or exec request that follows.
/// Direct-tcpip channels get their tunnel opened here, before the open is
/// confirmed, and a forward task that claims the channel afterwards.
pub async fn dispatch_open<C>(
    context: &Arc<RelayContext<C>>,
    acceptor: &ChannelAcceptor<C>,
    closer: Arc<dyn ChannelCloser<C::Id>>,
    channel: C,
    request: OpenRequest,
) -> OpenOutcome
where
    C: RelayChannel,
{
    let id = channel.channel_id();
    match request {
        OpenRequest::Session => match acceptor.offer(channel) {
            Ok(()) => OpenOutcome::Accepted,
            Err(e) => OpenOutcome::Refused(Refusal::Prohibited(e.to_string())),
        },
        OpenRequest::DirectTcpIp {
            host,
            port,
            originator,
            originator_port,
        } => {
            debug!(
                "Forward request from {}:{} to {}:{}",
                originator, originator_port, host, port
            );
            let Ok(port) = u16::try_from(port) else {
                return OpenOutcome::Refused(Refusal::ConnectFailed(format!("invalid port {}", port)));
            };

            let tunnel = match context.tunnels.open(&host, port).await {
                Ok(tunnel) => tunnel,
                Err(e) => {
                    warn!("No tunnel to {}:{}: {}", host, port, e);
                    return OpenOutcome::Refused(Refusal::ConnectFailed(e.to_string()));
                }
            };
            if let Err(e) = acceptor.offer(channel) {
                return OpenOutcome::Refused(Refusal::ConnectFailed(e.to_string()));
            }
            spawn_forward(context.clone(), closer, id, tunnel);
            OpenOutcome::Accepted
        }
        OpenRequest::Unsupported(kind) => OpenOutcome::Refused(Refusal::Prohibited(kind)),
    }
}

/// Where a connection is in its life, for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Listening,
    Authenticated,
    /// The transport ended or shutdown was requested
    Closed,
}

/// Shared view of a connection's [`ConnectionState`]
#[derive(Debug, Clone)]
pub struct StateCell(Arc<Mutex<ConnectionState>>);

impl Default for StateCell {
    fn default() -> Self {
        Self(Arc::new(Mutex::new(ConnectionState::Listening)))
    }
}

impl StateCell {
    pub fn get(&self) -> ConnectionState {
        *self.lock()
    }

    fn set(&self, state: ConnectionState) {
        *self.lock() = state;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ConnectionState> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// russh handler for the single bridge connection
pub struct BridgeHandler {
    context: Arc<RelayContext<Channel<Msg>>>,
    acceptor: ChannelAcceptor<Channel<Msg>>,
    state: StateCell,
    /// Terminal type per channel, from pty requests
    ptys: HashMap<ChannelId, String>,
}

impl BridgeHandler {
    pub fn new(
        context: Arc<RelayContext<Channel<Msg>>>,
        acceptor: ChannelAcceptor<Channel<Msg>>,
        state: StateCell,
    ) -> Self {
        Self {
            context,
            acceptor,
            state,
            ptys: HashMap::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Every method and credential is accepted. The transport is the stdio of
    /// the process that launched the bridge, so only that caller can reach it.
    /// Do not reuse this handler on a network listener.
    fn accept(&mut self, method: &str, user: &str) -> Auth {
        if self.state.get() == ConnectionState::Listening {
            info!("Accepting {} authentication for {:?}", method, user);
            self.state.set(ConnectionState::Authenticated);
        }
        Auth::Accept
    }

    async fn open(
        &mut self,
        channel: Channel<Msg>,
        request: OpenRequest,
        session: &mut Session,
    ) -> Result<bool, BridgeError> {
        let id = channel.id();
        let closer: Arc<dyn ChannelCloser<ChannelId>> = Arc::new(session.handle());

        match dispatch_open(&self.context, &self.acceptor, closer, channel, request).await {
            OpenOutcome::Accepted => {
                debug!("Channel {:?} opened", id);
                Ok(true)
            }
            OpenOutcome::Refused(reason) => {
                warn!("Refusing channel {:?}: {:?}", id, reason);
                Ok(false)
            }
        }
    }

    /// Start a shell relay and answer the request once it is ready or failed
    async fn start_shell(
        &mut self,
        channel_id: ChannelId,
        mode: ShellMode,
        session: &mut Session,
    ) -> Result<(), BridgeError> {
        match self.ptys.get(&channel_id) {
            Some(term) => info!("Starting {:?} relay on {:?} with terminal {}", mode, channel_id, term),
            None => info!("Starting {:?} relay on {:?} without a terminal", mode, channel_id),
        }
        let closer: Arc<dyn ChannelCloser<ChannelId>> = Arc::new(session.handle());
        let ready = spawn_shell(self.context.clone(), closer, channel_id, mode);

        if wait_ready(ready).await {
            session.channel_success(channel_id)?;
        } else {
            session.channel_failure(channel_id)?;
        }
        Ok(())
    }
}

async fn wait_ready(ready: oneshot::Receiver<Result<(), BridgeError>>) -> bool {
    match ready.await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            error!("Shell failed to start: {}", e);
            false
        }
        Err(_) => {
            error!("Shell task ended before signalling readiness");
            false
        }
    }
}

impl Handler for BridgeHandler {
    type Error = BridgeError;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        Ok(self.accept("none", user))
    }

    async fn auth_password(&mut self, user: &str, _password: &str) -> Result<Auth, Self::Error> {
        Ok(self.accept("password", user))
    }

    async fn auth_publickey_offered(
        &mut self,
        _user: &str,
        _public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        Ok(Auth::Accept)
    }

    async fn auth_publickey(&mut self, user: &str, _public_key: &PublicKey) -> Result<Auth, Self::Error> {
        Ok(self.accept("publickey", user))
    }

    async fn authentication_banner(&mut self) -> Result<Option<String>, Self::Error> {
        Ok(Some(BANNER.to_string()))
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.open(channel, OpenRequest::Session, session).await
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let request = OpenRequest::DirectTcpIp {
            host: host_to_connect.to_string(),
            port: port_to_connect,
            originator: originator_address.to_string(),
            originator_port,
        };
        self.open(channel, request, session).await
    }

    async fn channel_open_x11(
        &mut self,
        channel: Channel<Msg>,
        _originator_address: &str,
        _originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.open(channel, OpenRequest::Unsupported("x11".into()), session).await
    }

    async fn pty_request(
        &mut self,
        channel_id: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(
            "PTY request on {:?}: term={}, cols={}, rows={}",
            channel_id, term, col_width, row_height
        );
        self.ptys.insert(channel_id, term.to_string());
        session.channel_success(channel_id)?;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.start_shell(channel_id, ShellMode::Interactive, session).await
    }

    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).to_string();
        debug!("Exec request on channel {:?}: {}", channel_id, command);
        self.start_shell(channel_id, ShellMode::Exec(command), session).await
    }

    async fn channel_close(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.ptys.remove(&channel_id);
        debug!("Channel {:?} closed by client", channel_id);
        Ok(())
    }
}

/// Makes [`BridgeServer::run`] return early
#[derive(Clone, Default)]
pub struct ShutdownHandle {
    notify: Arc<Notify>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        self.notify.notify_one();
    }
}

/// SSH server for one connection
pub struct BridgeServer {
    config: Arc<Config>,
    context: Arc<RelayContext<Channel<Msg>>>,
    acceptor: ChannelAcceptor<Channel<Msg>>,
    shutdown: ShutdownHandle,
    state: StateCell,
}

impl BridgeServer {
    pub fn new(
        host_key: PrivateKey,
        target: impl Into<String>,
        broker: Arc<dyn SessionBroker>,
        tunnels: Arc<dyn TunnelOpener>,
        settings: RelaySettings,
    ) -> Self {
        let config = Config {
            methods: MethodSet::from(&[MethodKind::None, MethodKind::Password, MethodKind::PublicKey][..]),
            keys: vec![host_key],
            ..Default::default()
        };
        let (context, acceptor) = RelayContext::new(target, broker, tunnels, settings);

        Self {
            config: Arc::new(config),
            context: Arc::new(context),
            acceptor,
            shutdown: ShutdownHandle::default(),
            state: StateCell::default(),
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn state(&self) -> StateCell {
        self.state.clone()
    }

    /// Serve one connection over `stream` until it ends or shutdown is
    /// triggered
    pub async fn run<S>(self, stream: S) -> Result<(), BridgeError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let handler = BridgeHandler::new(
            self.context.clone(),
            self.acceptor.clone(),
            self.state.clone(),
        );
        let config = self.config.clone();
        info!("Bridge for {} listening", self.context.target);

        let serve = async move {
            let session = russh::server::run_stream(config, stream, handler).await?;
            session.await
        };

        let result = tokio::select! {
            result = serve => {
                match &result {
                    Ok(()) => info!("SSH session ended"),
                    Err(e) => error!("SSH session failed: {}", e),
                }
                result
            }
            _ = self.shutdown.notify.notified() => {
                info!("Bridge shutdown requested");
                Ok(())
            }
        };
        self.state.set(ConnectionState::Closed);
        result
    }

    /// Serve the connection on the process's stdin/stdout
    pub async fn run_stdio(self) -> Result<(), BridgeError> {
        self.run(StdioTransport::new()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::testing::FakeBroker;
    use crate::ssh::channel::testing::{PipeChannel, RecordingCloser};
    use crate::ssh::context::testing::{relay_context, settings, EchoTunnels};
    use russh::keys::ssh_key::rand_core::OsRng;
    use russh::keys::ssh_key::Algorithm;
    use std::path::Path;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn host_key() -> PrivateKey {
        PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap()
    }

    fn handler() -> BridgeHandler {
        let (context, acceptor) = RelayContext::new(
            "i-test",
            Arc::new(FakeBroker::default()),
            Arc::new(EchoTunnels { refuse: false }),
            RelaySettings::default(),
        );
        BridgeHandler::new(Arc::new(context), acceptor, StateCell::default())
    }

    fn forward_request(port: u32) -> OpenRequest {
        OpenRequest::DirectTcpIp {
            host: "db.internal".into(),
            port,
            originator: "127.0.0.1".into(),
            originator_port: 50000,
        }
    }

    // Accepting everything is deliberate: the transport is a local pipe
    #[tokio::test]
    async fn test_every_authentication_succeeds() {
        let mut handler = handler();
        assert_eq!(handler.state(), ConnectionState::Listening);

        assert!(matches!(handler.auth_none("").await.unwrap(), Auth::Accept));
        assert_eq!(handler.state(), ConnectionState::Authenticated);
        assert!(matches!(handler.auth_none("root").await.unwrap(), Auth::Accept));
        assert!(matches!(handler.auth_password("", "").await.unwrap(), Auth::Accept));
        assert!(matches!(
            handler.auth_password("ec2-user", "wrong").await.unwrap(),
            Auth::Accept
        ));

        let key = host_key();
        assert!(matches!(
            handler.auth_publickey_offered("anyone", key.public_key()).await.unwrap(),
            Auth::Accept
        ));
        assert!(matches!(
            handler.auth_publickey("anyone", key.public_key()).await.unwrap(),
            Auth::Accept
        ));
    }

    #[tokio::test]
    async fn test_banner() {
        let mut handler = handler();
        assert_eq!(
            handler.authentication_banner().await.unwrap().as_deref(),
            Some("SSM CLI - ProxyCommand SSH server\r\n")
        );
    }

    #[tokio::test]
    async fn test_session_open_is_queued_for_claim() {
        let (context, acceptor) = relay_context(Arc::new(FakeBroker::default()), Path::new("/bin/true"));
        let closer = Arc::new(RecordingCloser::default());
        let (channel, _client) = PipeChannel::pair(2);

        let outcome = dispatch_open(&context, &acceptor, closer, channel, OpenRequest::Session).await;
        assert_eq!(outcome, OpenOutcome::Accepted);
        assert_eq!(context.registrar.get_channel(2).await.unwrap().id, 2);
    }

    #[tokio::test]
    async fn test_unsupported_kind_is_refused() {
        let (context, acceptor) = relay_context(Arc::new(FakeBroker::default()), Path::new("/bin/true"));
        let closer = Arc::new(RecordingCloser::default());
        let (channel, _client) = PipeChannel::pair(0);

        let outcome = dispatch_open(
            &context,
            &acceptor,
            closer,
            channel,
            OpenRequest::Unsupported("x11".into()),
        )
        .await;
        assert_eq!(outcome, OpenOutcome::Refused(Refusal::Prohibited("x11".into())));
        assert_eq!(context.registrar.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_forward_open_relays_through_tunnel() {
        let (context, acceptor) = relay_context(Arc::new(FakeBroker::default()), Path::new("/bin/true"));
        let closer = Arc::new(RecordingCloser::default());
        let (channel, mut client) = PipeChannel::pair(5);

        let outcome =
            dispatch_open(&context, &acceptor, closer.clone(), channel, forward_request(5432)).await;
        assert_eq!(outcome, OpenOutcome::Accepted);

        client.write_all(b"SELECT 1").await.unwrap();
        let mut echoed = [0u8; 8];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"SELECT 1");

        client.shutdown().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(closer.closed(), vec![5]);
    }

    #[tokio::test]
    async fn test_forward_without_tunnel_is_connect_failure() {
        let (context, acceptor) = RelayContext::new(
            "i-test",
            Arc::new(FakeBroker::default()),
            Arc::new(EchoTunnels { refuse: true }),
            RelaySettings::default(),
        );
        let context = Arc::new(context);
        let closer = Arc::new(RecordingCloser::default());
        let (channel, _client) = PipeChannel::pair(1);

        let outcome = dispatch_open(&context, &acceptor, closer, channel, forward_request(22)).await;
        assert!(matches!(outcome, OpenOutcome::Refused(Refusal::ConnectFailed(_))));
        assert_eq!(context.registrar.pending_count().await, 0);
    }

    struct TrustingClient;

    impl russh::client::Handler for TrustingClient {
        type Error = russh::Error;

        async fn check_server_key(&mut self, _key: &PublicKey) -> Result<bool, Self::Error> {
            Ok(true)
        }
    }

    // russh reports every refused open as administratively prohibited
    #[tokio::test]
    async fn test_client_sees_refused_forward() {
        let server = BridgeServer::new(
            host_key(),
            "i-test",
            Arc::new(FakeBroker::default()),
            Arc::new(EchoTunnels { refuse: true }),
            settings(Path::new("/bin/true")),
        );
        let shutdown = server.shutdown_handle();
        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let serving = tokio::spawn(server.run(server_io));

        let mut client = russh::client::connect_stream(
            Arc::new(russh::client::Config::default()),
            client_io,
            TrustingClient,
        )
        .await
        .unwrap();
        assert!(client.authenticate_none("ec2-user").await.unwrap().success());

        let err = client
            .channel_open_direct_tcpip("db.internal", 5432, "127.0.0.1", 50000)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            russh::Error::ChannelOpenFailure(russh::ChannelOpenFailure::AdministrativelyProhibited)
        ));

        // The connection survives the refusal
        let err = client
            .channel_open_direct_tcpip("db.internal", 70000, "127.0.0.1", 50001)
            .await
            .unwrap_err();
        assert!(matches!(err, russh::Error::ChannelOpenFailure(_)));

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(5), serving)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_forward_port_out_of_range() {
        let (context, acceptor) = relay_context(Arc::new(FakeBroker::default()), Path::new("/bin/true"));
        let closer = Arc::new(RecordingCloser::default());
        let (channel, _client) = PipeChannel::pair(1);

        let outcome = dispatch_open(&context, &acceptor, closer, channel, forward_request(70000)).await;
        assert!(matches!(outcome, OpenOutcome::Refused(Refusal::ConnectFailed(_))));
    }

    #[tokio::test]
    async fn test_wait_ready_requires_success() {
        let (tx, rx) = oneshot::channel();
        tx.send(Ok(())).unwrap();
        assert!(wait_ready(rx).await);

        let (tx, rx) = oneshot::channel();
        tx.send(Err(BridgeError::RelayStartup("no banner".into()))).unwrap();
        assert!(!wait_ready(rx).await);

        let (tx, rx) = oneshot::channel::<Result<(), BridgeError>>();
        drop(tx);
        assert!(!wait_ready(rx).await);
    }

    #[tokio::test]
    async fn test_shutdown_ends_run() {
        let server = BridgeServer::new(
            host_key(),
            "i-test",
            Arc::new(FakeBroker::default()),
            Arc::new(EchoTunnels { refuse: false }),
            settings(Path::new("/bin/true")),
        );
        let shutdown = server.shutdown_handle();
        let state = server.state();

        // Nobody ever speaks SSH on the other end
        let (stream, _peer) = tokio::io::duplex(4096);
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(5), server.run(stream))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.get(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_transport_eof_ends_run() {
        let server = BridgeServer::new(
            host_key(),
            "i-test",
            Arc::new(FakeBroker::default()),
            Arc::new(EchoTunnels { refuse: false }),
            settings(Path::new("/bin/true")),
        );

        let (stream, peer) = tokio::io::duplex(4096);
        drop(peer);
        let result = tokio::time::timeout(Duration::from_secs(5), server.run(stream)).await;
        assert!(result.is_ok());
    }
}
