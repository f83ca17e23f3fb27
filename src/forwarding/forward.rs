//! Forward task: pumps a direct-tcpip channel through a tunnel socket

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::tunnel::Tunnel;
use crate::ssh::{BridgeError, ChannelCloser, RelayChannel, RelayContext};

/// Default size of a single relayed read
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Bytes moved in each direction by one pump
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpStats {
    pub channel_to_socket: u64,
    pub socket_to_channel: u64,
}

/// Relay bytes between `channel` and `socket` until either side reaches
/// EOF or fails, then shut both down.
///
/// Partial writes are not retried; an I/O error ends the pump.
pub async fn pump<A, B>(channel: A, socket: B, chunk_size: usize) -> Result<PumpStats, BridgeError>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut channel_rx, mut channel_tx) = tokio::io::split(channel);
    let (mut socket_rx, mut socket_tx) = tokio::io::split(socket);
    let mut from_channel = vec![0u8; chunk_size];
    let mut from_socket = vec![0u8; chunk_size];
    let mut stats = PumpStats::default();

    let result = loop {
        tokio::select! {
            read = channel_rx.read(&mut from_channel) => match read {
                Ok(0) => {
                    debug!("Channel reached EOF");
                    break Ok(());
                }
                Ok(n) => {
                    if let Err(e) = socket_tx.write_all(&from_channel[..n]).await {
                        break Err(e);
                    }
                    stats.channel_to_socket += n as u64;
                }
                Err(e) => break Err(e),
            },
            read = socket_rx.read(&mut from_socket) => match read {
                Ok(0) => {
                    debug!("Socket reached EOF");
                    break Ok(());
                }
                Ok(n) => {
                    if let Err(e) = channel_tx.write_all(&from_socket[..n]).await {
                        break Err(e);
                    }
                    stats.socket_to_channel += n as u64;
                }
                Err(e) => break Err(e),
            },
        }
    };

    let _ = socket_tx.shutdown().await;
    let _ = channel_tx.shutdown().await;

    result
        .map(|()| stats)
        .map_err(|e| BridgeError::SubprocessIo(format!("forward pump: {}", e)))
}

/// Start a forward for channel `channel_id` over an established tunnel.
///
/// The channel is resolved from the registrar inside the task, after the
/// open request has already been confirmed to the client.
pub fn spawn_forward<C>(
    context: Arc<RelayContext<C>>,
    closer: Arc<dyn ChannelCloser<C::Id>>,
    channel_id: C::Id,
    tunnel: Tunnel,
) -> JoinHandle<()>
where
    C: RelayChannel,
{
    tokio::spawn(async move {
        let channel = match context.registrar.get_channel(channel_id).await {
            Ok(channel) => channel,
            Err(e) => {
                // Already confirmed to the client, so it must not stay open
                warn!("Forward to {} abandoned: {}", tunnel.destination(), e);
                drop(tunnel);
                closer.close_channel(channel_id).await;
                return;
            }
        };

        let destination = tunnel.destination();
        info!(
            local_port = tunnel.local_port,
            "Forwarding channel {:?} to {}", channel_id, destination
        );

        let Tunnel { stream, helper, .. } = tunnel;
        match pump(channel.into_stream(), stream, context.settings.chunk_size).await {
            Ok(stats) => info!(
                "Forward to {} finished ({} bytes out, {} bytes in)",
                destination, stats.channel_to_socket, stats.socket_to_channel
            ),
            Err(e) => warn!("Forward to {} ended with error: {}", destination, e),
        }

        // Dropping the helper terminates its session
        drop(helper);
        closer.close_channel(channel_id).await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::testing::FakeBroker;
    use crate::ssh::channel::testing::{PipeChannel, RecordingCloser};
    use crate::ssh::context::testing::relay_context;
    use std::path::Path;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};

    #[tokio::test]
    async fn test_bytes_relayed_in_order_both_ways() {
        let (channel, mut client) = tokio::io::duplex(4096);
        let (socket, mut remote) = tokio::io::duplex(4096);
        let relay = tokio::spawn(pump(channel, socket, 16));

        let payload: Vec<u8> = (0..=255u8).cycle().take(3000).collect();
        client.write_all(&payload).await.unwrap();
        let mut received = vec![0u8; payload.len()];
        remote.read_exact(&mut received).await.unwrap();
        assert_eq!(received, payload);

        remote.write_all(b"pong").await.unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"pong");

        drop(remote);
        let stats = relay.await.unwrap().unwrap();
        assert_eq!(stats.channel_to_socket, 3000);
        assert_eq!(stats.socket_to_channel, 4);

        // the channel side was shut down once the socket went away
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_channel_eof_closes_socket() {
        let (channel, mut client) = tokio::io::duplex(4096);
        let (socket, mut remote) = tokio::io::duplex(4096);
        let relay = tokio::spawn(pump(channel, socket, DEFAULT_CHUNK_SIZE));

        client.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
        client.shutdown().await.unwrap();

        let mut request = Vec::new();
        remote.read_to_end(&mut request).await.unwrap();
        assert_eq!(request, b"GET / HTTP/1.0\r\n\r\n");
        relay.await.unwrap().unwrap();
    }

    async fn tunnel_to_echo_server() -> Tunnel {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let (mut rx, mut tx) = socket.split();
            let _ = tokio::io::copy(&mut rx, &mut tx).await;
        });

        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        Tunnel::unmanaged(stream, "db.internal", 5432, port)
    }

    #[tokio::test]
    async fn test_spawned_forward_closes_channel_once() {
        let (context, acceptor) =
            relay_context(Arc::new(FakeBroker::default()), Path::new("/nonexistent"));
        let closer = Arc::new(RecordingCloser::default());

        let tunnel = tunnel_to_echo_server().await;
        let task = spawn_forward(context, closer.clone(), 7, tunnel);

        let (channel, mut client) = PipeChannel::pair(7);
        acceptor.offer(channel).unwrap();

        client.write_all(b"hello").await.unwrap();
        let mut echoed = [0u8; 5];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"hello");

        client.shutdown().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(closer.closed(), vec![7]);
    }

    #[tokio::test]
    async fn test_unresolved_channel_is_closed() {
        let (context, _acceptor) =
            relay_context(Arc::new(FakeBroker::default()), Path::new("/nonexistent"));
        let closer = Arc::new(RecordingCloser::default());

        let tunnel = tunnel_to_echo_server().await;
        spawn_forward(context, closer.clone(), 3, tunnel).await.unwrap();
        assert_eq!(closer.closed(), vec![3]);
    }
}
