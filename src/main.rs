//! Muxbot CLI entry point.

use clap::{Parser, Subcommand};

use muxbot::config::BridgeConfig;
use muxbot::daemon::{self, DaemonPaths, IpcCommand, IpcResponse};
use muxbot::state::{FileStateStore, StateStore};

use std::sync::Arc;

#[derive(Parser)]
#[command(name = "muxbot", version)]
#[command(about = "Bridge terminal-hosted coding agents to Discord and Slack")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to the projects state file (defaults to the data directory)
    #[arg(short, long, global = true)]
    state: Option<std::path::PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Start the daemon (default when no subcommand is given)
    Start {
        /// Run in the foreground instead of daemonizing
        #[arg(short, long)]
        foreground: bool,
    },
    /// Stop the running daemon
    Stop,
    /// Restart the daemon (stop + start)
    Restart {
        /// Run in the foreground instead of daemonizing
        #[arg(short, long)]
        foreground: bool,
    },
    /// Show status of the running daemon
    Status,
    /// Check the local environment (tmux, state file, hook port)
    Doctor {
        /// Create missing directories and an empty state file
        #[arg(long)]
        fix: bool,
    },
    /// Check for a newer release
    Update {
        /// Pull the latest source via git instead of just checking
        #[arg(long)]
        git: bool,
    },
}

fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();

    let cli = Cli::parse();
    let paths = DaemonPaths::resolve();

    match cli.command.unwrap_or(Command::Start { foreground: false }) {
        Command::Start { foreground } => start(&paths, cli.state, cli.debug, foreground),
        Command::Restart { foreground } => {
            stop(&paths)?;
            start(&paths, cli.state, cli.debug, foreground)
        }
        Command::Stop => stop(&paths),
        Command::Status => status(&paths),
        Command::Doctor { fix } => doctor(cli.state, fix),
        Command::Update { git } => update(git),
    }
}

fn start(
    paths: &DaemonPaths,
    state_path: Option<std::path::PathBuf>,
    debug: bool,
    foreground: bool,
) -> anyhow::Result<()> {
    if let Some(pid) = daemon::running_pid(paths) {
        println!("muxbot is already running (pid {pid})");
        return Ok(());
    }

    let config = BridgeConfig::load()?;
    config.platform()?;

    if foreground {
        daemon::init_tracing(debug, None);
    } else {
        daemon::detach(paths)?;
        daemon::init_tracing(debug, Some(&paths.log_dir));
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let store: Arc<dyn StateStore> = Arc::new(FileStateStore::open(
            state_path.unwrap_or_else(FileStateStore::default_path),
        )?);

        let (shutdown_rx, _ipc_handle) = daemon::serve_ipc(paths).await?;

        let result = muxbot::bridge::run(config, store, shutdown_rx).await;
        daemon::cleanup(paths);
        result
    })
}

fn stop(paths: &DaemonPaths) -> anyhow::Result<()> {
    let Some(pid) = daemon::running_pid(paths) else {
        println!("muxbot is not running");
        return Ok(());
    };

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(daemon::call(paths, IpcCommand::Shutdown))?;

    if daemon::wait_for_exit(pid) {
        println!("muxbot stopped");
    } else {
        println!("muxbot (pid {pid}) did not exit within 10s");
    }
    Ok(())
}

fn status(paths: &DaemonPaths) -> anyhow::Result<()> {
    if daemon::running_pid(paths).is_none() {
        println!("muxbot is not running");
        return Ok(());
    }

    let runtime = tokio::runtime::Runtime::new()?;
    match runtime.block_on(daemon::call(paths, IpcCommand::Status))? {
        IpcResponse::Status { pid, uptime_secs } => {
            println!("muxbot is running (pid {pid}, up {uptime_secs}s)");
        }
        IpcResponse::Ok => println!("muxbot is running"),
    }
    Ok(())
}

fn doctor(state_path: Option<std::path::PathBuf>, fix: bool) -> anyhow::Result<()> {
    let mut healthy = true;

    match std::process::Command::new("tmux").arg("-V").output() {
        Ok(output) if output.status.success() => {
            println!("ok: {}", String::from_utf8_lossy(&output.stdout).trim());
        }
        _ => {
            healthy = false;
            println!("missing: tmux is not on PATH");
        }
    }

    let state_path = state_path.unwrap_or_else(FileStateStore::default_path);
    match FileStateStore::open(&state_path) {
        Ok(_) => println!("ok: state file at {}", state_path.display()),
        Err(error) => {
            healthy = false;
            println!("broken: state file {}: {error}", state_path.display());
            if fix {
                if let Some(parent) = state_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&state_path, "")?;
                println!("fixed: wrote empty state file");
            }
        }
    }

    let config = BridgeConfig::load()?;
    match std::net::TcpListener::bind(("127.0.0.1", config.hook_port)) {
        Ok(_) => println!("ok: hook port {} is free", config.hook_port),
        Err(_) => println!(
            "note: hook port {} is in use (daemon already running?)",
            config.hook_port
        ),
    }

    if config.platform().is_err() {
        healthy = false;
        println!("missing: no chat platform token configured");
    }

    if healthy {
        println!("all checks passed");
    }
    Ok(())
}

fn update(git: bool) -> anyhow::Result<()> {
    if git {
        let status = std::process::Command::new("git").arg("pull").status()?;
        if !status.success() {
            anyhow::bail!("git pull failed");
        }
        println!("pulled latest source; rebuild with `cargo install --path .`");
        return Ok(());
    }

    let runtime = tokio::runtime::Runtime::new()?;
    match runtime.block_on(muxbot::update::check_latest()) {
        Ok(check) if check.update_available() => {
            println!("update available: v{} → v{}", check.current, check.latest);
        }
        Ok(check) => println!("up to date (v{})", check.current),
        Err(error) => println!("update check failed: {error}"),
    }
    Ok(())
}
