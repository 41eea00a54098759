use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{LevelFilter, info, warn};

use hostwarden::channel::{ChannelConfig, ControlChannel};
use hostwarden::identity::{IdentityStore, LinuxIdentityStore};
use hostwarden::provision::Provisioner;
use hostwarden::reconcile::Reconciler;
use hostwarden::registry::{HostAuthRegistry, RegistryClient};
use hostwarden::runtime::{ContainerRuntime, ContainerRuntimeApi};
use hostwarden::settings::{AgentConfig, EnrollmentSettings};
use hostwarden::telemetry::HealthTelemetry;

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.common);

    let config = AgentConfig::load(cli.common.config.as_deref()).context("loading agent config")?;

    match cli.command {
        Command::Serve => async_serve(config),
        Command::Enroll(cmd) => handle_enroll(&config, cmd),
    }
}

#[tokio::main]
async fn async_serve(config: AgentConfig) -> Result<()> {
    serve(config).await
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Hostwarden - host-side agent for the container hosting platform.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Reconcile local state and serve the control channel
    Serve,
    /// Store this machine's enrollment secret
    Enroll(EnrollCommand),
}

#[derive(Debug, Args)]
struct EnrollCommand {
    /// Enrollment secret issued by the control plane
    #[arg(long, env = "HOSTWARDEN_ENROLL_HASH")]
    hash: String,
}

fn init_logging(common: &CommonOpts) {
    let level = if common.quiet {
        LevelFilter::Error
    } else {
        match common.verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

fn handle_enroll(config: &AgentConfig, cmd: EnrollCommand) -> Result<()> {
    let settings = EnrollmentSettings { hash: cmd.hash };
    settings
        .save(&config.settings_path)
        .with_context(|| format!("writing {}", config.settings_path.display()))?;
    println!("enrollment saved to {}", config.settings_path.display());
    Ok(())
}

async fn serve(config: AgentConfig) -> Result<()> {
    let settings = EnrollmentSettings::load(&config.settings_path)?;

    let client = RegistryClient::new(&config.registry_url, &settings.hash);
    let machine = client
        .resolve_machine()
        .await
        .context("resolving machine identity")?;
    info!("enrolled as machine {} ({})", machine.id, machine.name);

    let hosts = client
        .fetch_authorized_hosts(&machine.id)
        .await
        .context("fetching authorized hosts")?;
    info!("authorized for {} host(s)", hosts.len());

    let registry = HostAuthRegistry::new();
    let refused = registry.replace_all(hosts).await;
    if refused > 0 {
        warn!("refused {refused} authorized host(s) with malformed uuids");
    }

    let runtime: Arc<dyn ContainerRuntimeApi> = match config.runtime {
        Some(kind) => Arc::new(ContainerRuntime::with_type(kind)),
        None => Arc::new(ContainerRuntime::new()),
    };
    // No point serving anything if the runtime is down
    let version = runtime.ping().await.context("container runtime health check")?;
    info!("container runtime reachable: {}", version.trim());

    let identity: Arc<dyn IdentityStore> =
        Arc::new(LinuxIdentityStore::new(config.identity.clone()));

    let reconciler = Reconciler::new(
        Arc::clone(&runtime),
        Arc::clone(&identity),
        registry.clone(),
        config.hosted_root.clone(),
        config.quarantine_root.clone(),
    );
    let report = reconciler.run().await.context("initial reconciliation")?;
    info!(
        "reconciliation: removed {} container(s), quarantined {} dir(s), {} error(s)",
        report.removed_containers.len(),
        report.quarantined.len(),
        report.errors.len()
    );
    for error in &report.errors {
        warn!("reconciliation: {error}");
    }

    let telemetry = Arc::new(HealthTelemetry::new(Arc::clone(&runtime)));
    let attached = telemetry
        .attach_existing()
        .await
        .context("attaching telemetry to running hosts")?;
    info!("telemetry attached to {attached} running host(s)");

    let provisioner = Arc::new(Provisioner::new(
        Arc::clone(&runtime),
        identity,
        Arc::clone(&telemetry),
        config.hosted_root.clone(),
        config.service_port,
    ));

    let channel = Arc::new(ControlChannel::new(
        ChannelConfig {
            port: config.listen_port,
            admin_origins: config.admin_origins.clone(),
            enrollment_hash: settings.hash,
            cert_root: config.cert_root.clone(),
        },
        registry,
        provisioner,
        telemetry,
        runtime,
    ));

    channel.serve().await
}
