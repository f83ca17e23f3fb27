//! Relay helper subprocess
//!
//! The helper (`session-manager-plugin`) turns a broker session descriptor
//! into either a byte stream on its stdin/stdout (shell sessions) or a local
//! listening socket (port forwards). Its stdout starts with diagnostic lines
//! that must be consumed before any payload.
//!
//! The marker strings below are an external contract with the helper and
//! should be re-checked whenever the helper version changes.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::{debug, info};

use crate::broker::{BrokerContext, SessionDescriptor, SessionRequest};
use crate::ssh::BridgeError;

/// Default helper executable, resolved through `PATH`
pub const DEFAULT_HELPER: &str = "session-manager-plugin";

/// Operation name passed as the helper's third argument
pub const START_SESSION_OPERATION: &str = "StartSession";

/// Second stdout line of a healthy shell session starts with this
pub const SESSION_STARTED_MARKER: &str = "Starting session with SessionId";

/// Printed by the helper once its forwarding listener is up
pub const LISTENING_MARKER: &str = "Waiting for connections...";

/// The echoed exec snippet contains this; that line is swallowed
pub const ECHO_OFF_MARKER: &str = "stty -echo; ";

/// Fixed positional arguments for one helper invocation
#[derive(Debug, Clone)]
pub struct HelperInvocation {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl HelperInvocation {
    /// Build the argument list: descriptor, region, operation, profile,
    /// request parameters, endpoint
    pub fn new(
        program: impl Into<PathBuf>,
        descriptor: &SessionDescriptor,
        context: &BrokerContext,
        request: &SessionRequest,
    ) -> Result<Self, BridgeError> {
        let descriptor_json = serde_json::to_string(descriptor)
            .map_err(|e| BridgeError::RelayStartup(format!("descriptor encoding: {}", e)))?;
        let request_json = serde_json::to_string(request)
            .map_err(|e| BridgeError::RelayStartup(format!("parameter encoding: {}", e)))?;

        Ok(Self {
            program: program.into(),
            args: vec![
                descriptor_json,
                context.region.clone(),
                START_SESSION_OPERATION.to_string(),
                context.profile.clone(),
                request_json,
                context.endpoint(),
            ],
        })
    }

    /// Put `leading` in front of the helper's own arguments, for helpers
    /// launched through a wrapper or interpreter
    pub fn with_leading_args(mut self, leading: &[String]) -> Self {
        if !leading.is_empty() {
            self.args.splice(0..0, leading.iter().cloned());
        }
        self
    }

    /// Start the helper with all three standard streams piped.
    ///
    /// The child is killed if its handle is dropped.
    pub fn spawn(&self) -> Result<RelayHelper, BridgeError> {
        info!("Spawning relay helper {}", self.program.display());
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                BridgeError::RelayStartup(format!(
                    "failed to spawn {}: {}",
                    self.program.display(),
                    e
                ))
            })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take().map(BufReader::new);
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(stderr));
        }

        match (stdin, stdout) {
            (Some(stdin), Some(stdout)) => Ok(RelayHelper {
                child,
                stdin,
                stdout,
            }),
            _ => Err(BridgeError::RelayStartup("helper pipes unavailable".into())),
        }
    }

    /// Start the helper on this process's own terminal, for sessions the
    /// operator drives directly
    pub fn spawn_attached(&self) -> Result<Child, BridgeError> {
        info!("Attaching relay helper {}", self.program.display());
        Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                BridgeError::RelayStartup(format!(
                    "failed to spawn {}: {}",
                    self.program.display(),
                    e
                ))
            })
    }
}

/// A running helper with its pipes
pub struct RelayHelper {
    pub child: Child,
    pub stdin: ChildStdin,
    pub stdout: BufReader<ChildStdout>,
}

impl RelayHelper {
    /// Consume the shell-mode banner: one throwaway line, then the
    /// session-started marker
    pub async fn expect_session_banner(&mut self) -> Result<(), BridgeError> {
        let first = read_line(&mut self.stdout).await?;
        debug!("Helper banner: {:?}", first.trim_end());

        let marker = read_line(&mut self.stdout).await?;
        if !marker.starts_with(SESSION_STARTED_MARKER) {
            return Err(BridgeError::RelayStartup(format!(
                "unexpected helper banner {:?}",
                marker.trim_end()
            )));
        }
        debug!("Helper session started: {}", marker.trim_end());
        Ok(())
    }

    /// Read stdout lines until the forwarding listener reports ready
    pub async fn wait_until_listening(&mut self) -> Result<(), BridgeError> {
        loop {
            let line = read_line(&mut self.stdout).await.map_err(|e| {
                BridgeError::ForwardEstablish(format!("helper never started listening: {}", e))
            })?;
            debug!("Helper: {}", line.trim_end());
            if line.trim_end() == LISTENING_MARKER {
                return Ok(());
            }
        }
    }
}

/// Read one line, treating EOF as a startup failure
pub(crate) async fn read_line<R>(reader: &mut BufReader<R>) -> Result<String, BridgeError>
where
    R: AsyncRead + Unpin,
{
    let mut line = String::new();
    let n = reader
        .read_line(&mut line)
        .await
        .map_err(|e| BridgeError::SubprocessIo(e.to_string()))?;
    if n == 0 {
        return Err(BridgeError::RelayStartup("helper closed its output".into()));
    }
    Ok(line)
}

async fn drain_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("Helper stderr: {}", line);
    }
}
