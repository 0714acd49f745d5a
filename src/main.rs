use anyhow::Result;
use caretsync::config::{self, FileConfig, DEFAULT_HOST, DEFAULT_PORT};
use caretsync::protocol::PeerRole;
use caretsync::{daemon::Daemon, logging};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tokio::signal;
use tracing::{info, warn};

const DEFAULT_SOCKET_PATH: &str = "/tmp/caretsync";

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Which of the two front-ends this daemon drives. Role `a` listens,
    /// role `b` dials.
    #[arg(long, value_enum)]
    role: Option<CliRole>,
    /// Host to dial when running as role `b`.
    #[arg(long)]
    host: Option<String>,
    /// TCP port shared between both peers.
    #[arg(long)]
    port: Option<u16>,
    /// Path to the Unix domain socket to use for communication between
    /// daemon and editor plugin.
    #[arg(short, long, default_value = DEFAULT_SOCKET_PATH)]
    socket_path: PathBuf,
    /// Start with synchronization disabled, until the plugin enables it.
    #[arg(long)]
    disabled: bool,
    /// Enable verbose debug output.
    #[arg(short, long, action)]
    debug: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum CliRole {
    A,
    B,
}

#[tokio::main]
async fn main() -> Result<()> {
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));

    let cli = Cli::parse();

    logging::initialize(cli.debug);

    let file_config = match config::default_config_file() {
        Some(config_file) => FileConfig::load(&config_file)?,
        None => FileConfig::default(),
    };

    let mut role = cli.role.map(|role| match role {
        CliRole::A => "a".to_string(),
        CliRole::B => "b".to_string(),
    });
    let mut host = cli.host;
    let mut port = cli.port;
    if let Some(conf_role) = file_config.role {
        role.get_or_insert(conf_role);
    }
    if let Some(conf_host) = file_config.host {
        host.get_or_insert(conf_host);
    }
    if let Some(conf_port) = file_config.port {
        port.get_or_insert(conf_port);
    }

    let role = match role.as_deref() {
        Some("a") => PeerRole::PeerA,
        Some("b") => PeerRole::PeerB,
        Some(other) => {
            anyhow::bail!("Unknown role '{other}' (expected 'a' or 'b')");
        }
        None => {
            anyhow::bail!("Missing role: pass --role or put role=a|b in the config file");
        }
    };
    let host = host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = port.unwrap_or(DEFAULT_PORT);

    info!("Starting caretsync as {role} on port {port}");
    Daemon::new(role, host, port, &cli.socket_path, !cli.disabled);

    match signal::ctrl_c().await {
        Ok(()) => {}
        Err(err) => {
            warn!("Unable to listen for shutdown signal: {err}");
            // still shut down.
        }
    }
    Ok(())
}
