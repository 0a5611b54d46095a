//! vdagent CLI - runs either the session agent or the system daemon.
//!
//! See the `vdagent` library for the transport and dispatch logic.

use std::os::unix::io::RawFd;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, ExitCode};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use vdagent::agent::{self, Agent, AgentExit};
use vdagent::constants::RESTART_DELAY;
use vdagent::{daemon, Config, Dispatcher, VERSION};

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Global flag for signal-triggered shutdown (as Arc for signal-hook compatibility)
static SHUTDOWN_FLAG: std::sync::LazyLock<Arc<AtomicBool>> =
    std::sync::LazyLock::new(|| Arc::new(AtomicBool::new(false)));

#[derive(Parser)]
#[command(name = "vdagent")]
#[command(version = VERSION)]
#[command(about = "Guest session agent and daemon for the display channel")]
struct Cli {
    /// Debug logging and per-message tracing
    #[arg(long, short, global = true)]
    debug: bool,

    /// Daemon socket path
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    /// Virtio-serial port node
    #[arg(long, global = true)]
    virtio_port: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the per-session agent
    Agent,
    /// Run the system daemon
    Daemon {
        /// Drive connections from the tokio reactor instead of a poll loop
        #[arg(long)]
        watch: bool,

        /// Use an already listening socket on this descriptor
        #[arg(long)]
        listen_fd: Option<RawFd>,
    },
}

fn register_signals() -> Result<()> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
    use signal_hook::flag;
    flag::register(SIGINT, Arc::clone(&SHUTDOWN_FLAG))?;
    flag::register(SIGTERM, Arc::clone(&SHUTDOWN_FLAG))?;
    flag::register(SIGHUP, Arc::clone(&SHUTDOWN_FLAG))?;
    flag::register(SIGQUIT, Arc::clone(&SHUTDOWN_FLAG))?;
    Ok(())
}

fn run_agent(config: Config) -> Result<ExitCode> {
    if !agent::virtio_port_present(&config.virtio_port_path) {
        log::error!(
            "[Agent] {} does not exist, not running inside a virtual machine with the display channel",
            config.virtio_port_path.display()
        );
        return Ok(ExitCode::FAILURE);
    }

    let mut agent = Agent::new(config, Dispatcher::new(VERSION), Arc::clone(&SHUTDOWN_FLAG))
        .context("Failed to set up agent event loop")?;

    match agent.run() {
        AgentExit::Quit => Ok(ExitCode::SUCCESS),
        AgentExit::GaveUp => Ok(ExitCode::FAILURE),
        AgentExit::Restart => {
            drop(agent);
            restart()
        }
    }
}

/// Replace this process with a fresh copy of the installed binary.
fn restart() -> Result<ExitCode> {
    log::info!("[Agent] Daemon version differs, restarting in {:?}", RESTART_DELAY);
    std::thread::sleep(RESTART_DELAY);

    let exe = std::env::current_exe().context("Cannot locate own executable")?;
    let err = Command::new(&exe).args(std::env::args_os().skip(1)).exec();
    Err(err).with_context(|| format!("Failed to re-execute {}", exe.display()))
}

fn run_daemon(config: &Config, watch: bool, listen_fd: Option<RawFd>) -> Result<ExitCode> {
    let mut server = daemon::bind(config, listen_fd, VERSION)?;
    if watch {
        daemon::run_watch(&mut server, None, Arc::clone(&SHUTDOWN_FLAG))?;
    } else {
        daemon::run_poll(&mut server, None, &SHUTDOWN_FLAG)?;
    }
    Ok(ExitCode::SUCCESS)
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let (mut config, ignored) = Config::load()?;
    if let Some(socket) = cli.socket {
        config.socket_path = socket;
    }
    if let Some(port) = cli.virtio_port {
        config.virtio_port_path = port;
    }
    config.debug |= cli.debug;

    let default_filter = if config.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format_timestamp_secs()
        .init();
    for item in &ignored {
        log::warn!("Ignoring {item}");
    }

    register_signals()?;

    match cli.command {
        Commands::Agent => run_agent(config),
        Commands::Daemon { watch, listen_fd } => run_daemon(&config, watch, listen_fd),
    }
}
