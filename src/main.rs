use std::io::IsTerminal;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use ssm_bridge::broker::{SessionBroker, SsmBroker};
use ssm_bridge::config::{log_dir, BridgeConfig, ConfigStorage, HostKeyStore};
use ssm_bridge::forwarding::{run_tunnel, SsmTunnelOpener};
use ssm_bridge::session::run_interactive;
use ssm_bridge::signal::SignalGuard;
use ssm_bridge::ssh::{BridgeServer, RelaySettings};
use ssm_bridge::{init_logging, LogTarget};

#[derive(Parser)]
#[command(name = "ssm-bridge", version, about = "SSH over SSM sessions, as a ProxyCommand")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the config directory, default settings and the host key
    Setup {
        /// Overwrite the existing settings and host key
        #[arg(long)]
        replace: bool,
    },

    /// Serve SSH on stdin/stdout for one instance (use as ProxyCommand)
    Proxycommand {
        /// Instance id, e.g. i-0123456789abcdef0
        target: String,

        /// Credential profile (overrides the config file)
        #[arg(long)]
        profile: Option<String>,

        /// Region (overrides the config file)
        #[arg(long)]
        region: Option<String>,
    },

    /// Open an interactive shell on an instance
    Shell {
        /// Instance id, e.g. i-0123456789abcdef0
        target: String,

        /// Credential profile (overrides the config file)
        #[arg(long)]
        profile: Option<String>,

        /// Region (overrides the config file)
        #[arg(long)]
        region: Option<String>,
    },

    /// Forward a local port to a host reachable from an instance
    Tunnel {
        /// Instance id the tunnel goes through
        target: String,

        /// Host to connect to, as seen from the instance
        #[arg(long)]
        remote: String,

        /// Port on the remote host
        #[arg(long)]
        remote_port: u16,

        /// Local port to listen on (allocated when omitted)
        #[arg(long)]
        local_port: Option<u16>,

        /// Credential profile (overrides the config file)
        #[arg(long)]
        profile: Option<String>,

        /// Region (overrides the config file)
        #[arg(long)]
        region: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let storage = ConfigStorage::new().context("Failed to locate config directory")?;

    match cli.command {
        Commands::Setup { replace } => {
            init_logging("info", LogTarget::Stderr).context("Failed to initialize logging")?;
            run_setup(&storage, replace).await
        }
        Commands::Proxycommand {
            target,
            profile,
            region,
        } => {
            if std::io::stdin().is_terminal() {
                bail!(
                    "proxycommand speaks SSH on stdin/stdout and must not be run from a terminal; \
                     use it as a ProxyCommand, e.g. `ssh -o ProxyCommand='ssm-bridge proxycommand %h' {}`",
                    target
                );
            }

            let config = load_config(&storage).await?;
            let log_file = log_dir()
                .context("Failed to locate log directory")?
                .join("bridge.log");
            init_logging(&config.log_level, LogTarget::File(log_file))
                .context("Failed to initialize logging")?;

            run_proxycommand(config, target, profile, region).await
        }
        Commands::Shell {
            target,
            profile,
            region,
        } => {
            let config = load_config(&storage).await?;
            init_logging(&config.log_level, LogTarget::Stderr).context("Failed to initialize logging")?;
            run_shell(config, target, profile, region).await
        }
        Commands::Tunnel {
            target,
            remote,
            remote_port,
            local_port,
            profile,
            region,
        } => {
            let config = load_config(&storage).await?;
            init_logging(&config.log_level, LogTarget::Stderr).context("Failed to initialize logging")?;
            let broker = connect_broker(&config, profile, region).await?;
            let status = run_tunnel(
                &broker,
                &target,
                &remote,
                remote_port,
                local_port,
                &RelaySettings::from(&config),
            )
            .await
            .context("Tunnel failed")?;
            if !status.success() {
                bail!("Tunnel helper exited with {}", status);
            }
            Ok(())
        }
    }
}

async fn load_config(storage: &ConfigStorage) -> Result<BridgeConfig> {
    storage
        .load()
        .await
        .with_context(|| format!("Failed to load {}", storage.path().display()))
}

async fn connect_broker(
    config: &BridgeConfig,
    profile: Option<String>,
    region: Option<String>,
) -> Result<SsmBroker> {
    SsmBroker::connect(profile.or(config.profile.clone()), region.or(config.region.clone()))
        .await
        .context("Failed to set up the session broker")
}

async fn run_setup(storage: &ConfigStorage, replace: bool) -> Result<()> {
    if replace || !storage.exists().await {
        storage
            .save(&BridgeConfig::default())
            .await
            .with_context(|| format!("Failed to write {}", storage.path().display()))?;
        info!("Wrote default settings to {}", storage.path().display());
    }

    let keys = HostKeyStore::new().context("Failed to locate host key path")?;
    let path = keys.path().to_path_buf();
    let created = tokio::task::spawn_blocking(move || keys.ensure(replace))
        .await
        .context("Host key generation panicked")?
        .context("Failed to create host key")?;
    if !created {
        info!("Keeping existing host key at {}", path.display());
    }
    Ok(())
}

async fn run_proxycommand(
    config: BridgeConfig,
    target: String,
    profile: Option<String>,
    region: Option<String>,
) -> Result<()> {
    let _signals = SignalGuard::acquire().context("Failed to ignore terminal signals")?;

    let host_key = HostKeyStore::new()
        .context("Failed to locate host key path")?
        .load()
        .context("Failed to load host key")?;

    let broker: Arc<dyn SessionBroker> = Arc::new(connect_broker(&config, profile, region).await?);
    let settings = RelaySettings::from(&config);
    let tunnels = Arc::new(SsmTunnelOpener::new(&target, broker.clone(), settings.clone()));

    info!(target = %target, "Starting bridge");
    BridgeServer::new(host_key, target, broker, tunnels, settings)
        .run_stdio()
        .await
        .context("Bridge failed")?;
    Ok(())
}

async fn run_shell(
    config: BridgeConfig,
    target: String,
    profile: Option<String>,
    region: Option<String>,
) -> Result<()> {
    let broker = connect_broker(&config, profile, region).await?;

    // Interrupts belong to the remote shell
    let _signals = SignalGuard::acquire().context("Failed to ignore terminal signals")?;
    let status = run_interactive(&broker, &target, &RelaySettings::from(&config))
        .await
        .context("Shell failed")?;
    if !status.success() {
        bail!("Session helper exited with {}", status);
    }
    Ok(())
}
