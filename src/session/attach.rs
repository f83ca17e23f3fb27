//! Interactive sessions on the operator's own terminal

use std::process::ExitStatus;

use tracing::info;

use super::helper::HelperInvocation;
use crate::broker::{SessionBroker, SessionRequest};
use crate::ssh::{BridgeError, RelaySettings};

/// Start an interactive session on `target` and hand the terminal to the
/// relay helper until it exits
pub async fn run_interactive(
    broker: &dyn SessionBroker,
    target: &str,
    settings: &RelaySettings,
) -> Result<ExitStatus, BridgeError> {
    let request = SessionRequest::interactive(target);
    let descriptor = broker.start_session(&request).await?;
    info!(session_id = %descriptor.session_id, "Connecting to {}", target);

    let mut child = HelperInvocation::new(
        &settings.helper_path,
        &descriptor,
        broker.context(),
        &request,
    )?
    .with_leading_args(&settings.helper_args)
    .spawn_attached()?;

    let status = child.wait().await?;
    info!("Session to {} ended with {}", target, status);
    Ok(status)
}
