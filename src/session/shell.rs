//! Shell and exec relays
//!
//! A shell or exec channel is served by a relay helper running an
//! interactive broker session. Exec requests get no true non-interactive
//! mode from the helper, so the requested command is fed through a small
//! shell loop with terminal echo turned off.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use super::helper::{read_line, HelperInvocation, RelayHelper, ECHO_OFF_MARKER};
use crate::broker::SessionRequest;
use crate::ssh::{BridgeError, ChannelCloser, RelayChannel, RelayContext};

/// Ctrl+D, written to the helper when the SSH client sends EOF
pub const EOF_MARKER: u8 = 0x04;

/// Pause after startup so the remote shell settles before input arrives
const SETTLE_DELAY: Duration = Duration::from_millis(100);

/// What the channel asked for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellMode {
    Interactive,
    Exec(String),
}

impl ShellMode {
    /// Broker session backing this mode
    pub fn session_request(&self, target: &str) -> SessionRequest {
        match self {
            ShellMode::Interactive => SessionRequest::interactive(target),
            ShellMode::Exec(_) => SessionRequest::interactive_command(target),
        }
    }
}

/// Shell loop that runs `command` over the channel's input lines.
///
/// A `read` loop is used instead of `cat` because the EOF marker would stop
/// `cat` before the last line is flushed through.
pub fn exec_snippet(command: &str) -> String {
    format!(
        "stty -echo; while IFS= read line; do echo \"$line\"; done | {}\n",
        command
    )
}

/// A started helper whose output is now pure session payload
pub struct ShellTask {
    helper: RelayHelper,
    chunk_size: usize,
}

impl ShellTask {
    /// Spawn the helper, consume its banner and, for exec, complete the
    /// echo-suppression handshake. Bounded by `startup_timeout`.
    pub async fn start(
        invocation: &HelperInvocation,
        mode: &ShellMode,
        startup_timeout: Duration,
        chunk_size: usize,
    ) -> Result<Self, BridgeError> {
        let mut helper = invocation.spawn()?;

        let handshake = async {
            helper.expect_session_banner().await?;

            if let ShellMode::Exec(command) = mode {
                info!("Starting exec forwarder for {:?}", command);
                helper
                    .stdin
                    .write_all(exec_snippet(command).as_bytes())
                    .await
                    .map_err(|e| BridgeError::RelayStartup(format!("snippet write: {}", e)))?;
                helper
                    .stdin
                    .flush()
                    .await
                    .map_err(|e| BridgeError::RelayStartup(format!("snippet flush: {}", e)))?;

                let echoed = read_line(&mut helper.stdout).await?;
                if !echoed.contains(ECHO_OFF_MARKER) {
                    return Err(BridgeError::RelayStartup(format!(
                        "exec handshake not echoed, got {:?}",
                        echoed.trim_end()
                    )));
                }
            }

            tokio::time::sleep(SETTLE_DELAY).await;
            Ok::<(), BridgeError>(())
        };

        match tokio::time::timeout(startup_timeout, handshake).await {
            Ok(Ok(())) => Ok(Self { helper, chunk_size }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(BridgeError::RelayStartup(format!(
                "helper not ready after {}s",
                startup_timeout.as_secs()
            ))),
        }
    }

    /// Pump bytes until the helper exits.
    ///
    /// Helper output goes to the channel; channel input goes to the helper,
    /// followed by [`EOF_MARKER`] once the client sends EOF. An I/O error on
    /// either side kills the helper and ends both pumps.
    pub async fn run<S>(self, channel: S) -> Result<(), BridgeError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let RelayHelper {
            mut child,
            mut stdin,
            mut stdout,
        } = self.helper;
        let chunk_size = self.chunk_size;
        let (mut channel_rx, mut channel_tx) = tokio::io::split(channel);

        let result = {
            let input = async {
                let mut buf = vec![0u8; chunk_size];
                loop {
                    let n = channel_rx.read(&mut buf).await.map_err(subprocess_io)?;
                    if n == 0 {
                        break;
                    }
                    stdin.write_all(&buf[..n]).await.map_err(subprocess_io)?;
                    stdin.flush().await.map_err(subprocess_io)?;
                }

                debug!("Sending EOF to relay helper");
                stdin.write_all(&[EOF_MARKER]).await.map_err(subprocess_io)?;
                stdin.shutdown().await.map_err(subprocess_io)
            };

            let output = async {
                let mut buf = vec![0u8; chunk_size];
                loop {
                    let n = stdout.read(&mut buf).await.map_err(subprocess_io)?;
                    if n == 0 {
                        return Ok::<(), BridgeError>(());
                    }
                    channel_tx.write_all(&buf[..n]).await.map_err(subprocess_io)?;
                    channel_tx.flush().await.map_err(subprocess_io)?;
                }
            };

            tokio::pin!(input, output);
            tokio::select! {
                res = &mut output => res,
                res = &mut input => match res {
                    // Client is done sending; keep relaying until the helper exits
                    Ok(()) => output.await,
                    Err(e) => Err(e),
                },
            }
        };

        if let Err(e) = &result {
            warn!("Shell relay failed, stopping helper: {}", e);
            let _ = child.start_kill();
        }
        match child.wait().await {
            Ok(status) => info!("Relay helper exited with {}", status),
            Err(e) => warn!("Failed to reap relay helper: {}", e),
        }

        let _ = channel_tx.shutdown().await;
        result
    }
}

fn subprocess_io(e: std::io::Error) -> BridgeError {
    BridgeError::SubprocessIo(e.to_string())
}

/// Start a shell relay for channel `channel_id` in the background.
///
/// The returned receiver resolves once the relay is ready (or failed to
/// become ready); the relay itself keeps running until the helper exits.
pub fn spawn_shell<C>(
    context: Arc<RelayContext<C>>,
    closer: Arc<dyn ChannelCloser<C::Id>>,
    channel_id: C::Id,
    mode: ShellMode,
) -> oneshot::Receiver<Result<(), BridgeError>>
where
    C: RelayChannel,
{
    let (ready_tx, ready_rx) = oneshot::channel();

    tokio::spawn(async move {
        info!("Starting shell on channel {:?}", channel_id);

        let startup = async {
            let channel = context.registrar.get_channel(channel_id).await?;

            let request = mode.session_request(&context.target);
            let descriptor = context.broker.start_session(&request).await?;
            let invocation = HelperInvocation::new(
                &context.settings.helper_path,
                &descriptor,
                context.broker.context(),
                &request,
            )?
            .with_leading_args(&context.settings.helper_args);

            let task = ShellTask::start(
                &invocation,
                &mode,
                context.settings.startup_timeout,
                context.settings.chunk_size,
            )
            .await?;
            Ok::<_, BridgeError>((channel, task))
        };

        let (channel, task) = match startup.await {
            Ok(started) => started,
            Err(e) => {
                error!("Shell on channel {:?} failed to start: {}", channel_id, e);
                let _ = ready_tx.send(Err(e));
                return;
            }
        };

        debug!("Shell on channel {:?} is ready", channel_id);
        let _ = ready_tx.send(Ok(()));

        if let Err(e) = task.run(channel.into_stream()).await {
            warn!("Shell on channel {:?} ended with error: {}", channel_id, e);
        }
        closer.close_channel(channel_id).await;
        debug!("Shell on channel {:?} finished", channel_id);
    });

    ready_rx
}
