//! ssm-bridge - an SSH server over stdio that relays to SSM sessions
//!
//! Used as an SSH `ProxyCommand`, the bridge speaks SSH on its own
//! stdin/stdout and serves shell, exec and direct-tcpip channels by starting
//! broker sessions and running the relay helper for each.

pub mod broker;
pub mod config;
pub mod forwarding;
pub mod session;
pub mod signal;
pub mod ssh;

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Where log lines go
#[derive(Debug, Clone)]
pub enum LogTarget {
    Stderr,
    /// Appended to a file; used whenever stdout carries the SSH transport
    File(PathBuf),
}

/// Initialize logging. `RUST_LOG` wins over `default_level`.
pub fn init_logging(default_level: &str, target: LogTarget) -> std::io::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    match target {
        LogTarget::Stderr => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
        LogTarget::File(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(Mutex::new(file)),
                )
                .init();
        }
    }
    Ok(())
}
