//! Background-process plumbing: PID bookkeeping, log redirection, and the
//! control socket the CLI talks to.
//!
//! The daemon leaves two files in the data directory while it runs: a PID
//! file and a Unix socket. `running_pid` treats them as claims to verify,
//! not facts; leftovers from a crashed run are swept on the next probe.

use anyhow::{Context as _, anyhow};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Requests the CLI can put on the control socket, one JSON object per line.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum IpcCommand {
    Shutdown,
    Status,
}

/// Single-line JSON replies from the daemon.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum IpcResponse {
    Ok,
    Status { pid: u32, uptime_secs: u64 },
}

/// Locations of the daemon's runtime files.
pub struct DaemonPaths {
    pub pid_file: PathBuf,
    pub socket: PathBuf,
    pub log_dir: PathBuf,
}

impl DaemonPaths {
    pub fn in_dir(data_dir: &Path) -> Self {
        Self {
            pid_file: data_dir.join("muxbot.pid"),
            socket: data_dir.join("muxbot.sock"),
            log_dir: data_dir.join("logs"),
        }
    }

    /// Paths under the platform data directory.
    pub fn resolve() -> Self {
        let data_dir = dirs::data_dir()
            .map(|dir| dir.join("muxbot"))
            .unwrap_or_else(|| PathBuf::from("./data"));
        Self::in_dir(&data_dir)
    }

    fn recorded_pid(&self) -> Option<u32> {
        std::fs::read_to_string(&self.pid_file)
            .ok()?
            .trim()
            .parse()
            .ok()
    }

    /// Drop both runtime files, ignoring whichever is already gone.
    fn forget(&self) {
        let _ = std::fs::remove_file(&self.pid_file);
        let _ = std::fs::remove_file(&self.socket);
    }
}

/// PID of a live daemon, if one is actually serving.
///
/// The PID file alone is not trusted: the recorded process must answer a
/// signal probe, and a socket that exists but refuses connections marks a
/// crashed run whose files get swept here. A live PID with no socket at all
/// is a daemon still starting up.
pub fn running_pid(paths: &DaemonPaths) -> Option<u32> {
    let pid = paths.recorded_pid()?;

    if !process_exists(pid) {
        paths.forget();
        return None;
    }

    match std::os::unix::net::UnixStream::connect(&paths.socket) {
        Ok(_probe) => Some(pid),
        Err(_) if paths.socket.exists() => {
            paths.forget();
            None
        }
        Err(_) => Some(pid),
    }
}

/// Fork into the background, writing the PID file and pointing stdio at log
/// files. Only the child returns from this; the parent exits inside
/// `Daemonize::start`.
pub fn detach(paths: &DaemonPaths) -> anyhow::Result<()> {
    std::fs::create_dir_all(&paths.log_dir)
        .with_context(|| format!("cannot create {}", paths.log_dir.display()))?;

    let open_log = |name: &str| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(paths.log_dir.join(name))
            .with_context(|| format!("cannot open log file {name}"))
    };

    daemonize::Daemonize::new()
        .pid_file(&paths.pid_file)
        .chown_pid_file(true)
        .stdout(open_log("daemon.out")?)
        .stderr(open_log("daemon.err")?)
        .start()
        .map_err(|error| anyhow!("could not move into the background: {error}"))?;

    Ok(())
}

/// Install the tracing subscriber. With a log directory the output goes to a
/// daily-rolling file; without one it stays on the terminal.
pub fn init_tracing(debug: bool, log_dir: Option<&Path>) {
    let fallback = if debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(fallback));

    match log_dir {
        Some(dir) => {
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "muxbot.log"));
            // The writer guard has to outlive every log call, which for a
            // daemon means the whole process.
            std::mem::forget(guard);
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false)
                        .compact(),
                )
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().compact())
                .init();
        }
    }
}

/// Bind the control socket and serve it until a shutdown request arrives.
///
/// Returns the shutdown receiver the main loop selects on. The serving task
/// owns the socket file and unlinks it as its last act, so a clean exit
/// leaves nothing behind for the next start to trip over.
pub async fn serve_ipc(
    paths: &DaemonPaths,
) -> anyhow::Result<(watch::Receiver<bool>, tokio::task::JoinHandle<()>)> {
    if let Some(dir) = paths.socket.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("cannot create {}", dir.display()))?;
    }
    if paths.socket.exists() {
        // A socket left by a crashed run would make the bind fail.
        std::fs::remove_file(&paths.socket)
            .with_context(|| format!("cannot clear stale socket {}", paths.socket.display()))?;
    }
    let listener = UnixListener::bind(&paths.socket)
        .with_context(|| format!("cannot bind control socket {}", paths.socket.display()))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let started = Instant::now();
    let socket = paths.socket.clone();
    let mut stop_rx = shutdown_rx.clone();

    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                stopped = stop_rx.wait_for(|stop| *stop) => {
                    let _ = stopped;
                    break;
                }
                accepted = listener.accept() => {
                    let stream = match accepted {
                        Ok((stream, _peer)) => stream,
                        Err(error) => {
                            tracing::warn!(%error, "control socket accept failed");
                            continue;
                        }
                    };
                    let shutdown_tx = shutdown_tx.clone();
                    tokio::spawn(async move {
                        if let Err(error) = answer(stream, shutdown_tx, started).await {
                            tracing::warn!(%error, "control request failed");
                        }
                    });
                }
            }
        }
        let _ = std::fs::remove_file(&socket);
    });

    Ok((shutdown_rx, handle))
}

/// Serve one control connection: read a request line, act, reply.
async fn answer(
    stream: UnixStream,
    shutdown_tx: watch::Sender<bool>,
    started: Instant,
) -> anyhow::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut request = String::new();
    tokio::io::BufReader::new(read_half)
        .read_line(&mut request)
        .await?;

    let command: IpcCommand = serde_json::from_str(request.trim())
        .with_context(|| format!("unrecognized control request: {}", request.trim()))?;

    let reply = match command {
        IpcCommand::Status => IpcResponse::Status {
            pid: std::process::id(),
            uptime_secs: started.elapsed().as_secs(),
        },
        IpcCommand::Shutdown => {
            tracing::info!("shutdown requested over the control socket");
            let _ = shutdown_tx.send(true);
            IpcResponse::Ok
        }
    };

    let mut encoded = serde_json::to_string(&reply)?;
    encoded.push('\n');
    write_half.write_all(encoded.as_bytes()).await?;
    write_half.flush().await?;
    Ok(())
}

/// Put one command on a running daemon's control socket and wait for the
/// reply.
pub async fn call(paths: &DaemonPaths, command: IpcCommand) -> anyhow::Result<IpcResponse> {
    let mut stream = UnixStream::connect(&paths.socket)
        .await
        .context("no muxbot daemon is listening; start one with `muxbot start`")?;

    let mut encoded = serde_json::to_string(&command)?;
    encoded.push('\n');
    stream.write_all(encoded.as_bytes()).await?;

    let mut reply = String::new();
    let mut reader = tokio::io::BufReader::new(stream);
    reader.read_line(&mut reply).await?;
    serde_json::from_str(reply.trim())
        .with_context(|| format!("daemon sent an unparseable reply: {}", reply.trim()))
}

/// Remove the PID file and socket on shutdown.
pub fn cleanup(paths: &DaemonPaths) {
    for file in [&paths.pid_file, &paths.socket] {
        match std::fs::remove_file(file) {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => {
                tracing::warn!(%error, path = %file.display(), "could not remove runtime file");
            }
        }
    }
}

/// Signal 0 probes for existence without delivering anything.
fn process_exists(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

/// Block until the given PID is gone, giving up after ten seconds.
pub fn wait_for_exit(pid: u32) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if !process_exists(pid) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    false
}
