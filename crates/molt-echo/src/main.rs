//! molt-echo: an echo server that survives binary upgrades.
//!
//! Start it, connect with `nc 127.0.0.1 7070`, then `kill -USR2 <pid>`:
//! a successor adopts the listeners, tells this process to quit, and open
//! connections drain while new ones go to the successor.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use molt::{
    Controller, HandoffConfig, HandoffEnv, Hooks, Lineage, ProcessLauncher, Profile, Registry,
    Signal,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

mod telemetry;

/// Echo server with zero-downtime listener handoff
#[derive(Parser, Debug)]
#[command(name = "molt-echo")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TCP addresses to listen on
    #[arg(
        long = "tcp",
        env = "MOLT_ECHO_TCP",
        value_delimiter = ',',
        default_value = "127.0.0.1:7070"
    )]
    tcp: Vec<String>,

    /// Unix socket path to listen on
    #[arg(long, env = "MOLT_ECHO_UNIX")]
    unix: Option<PathBuf>,

    /// Seconds to wait for open connections before exiting
    #[arg(long, env = "MOLT_ECHO_DRAIN_TIMEOUT_SECS", default_value_t = 30)]
    drain_timeout_secs: u64,

    /// Replace the process image in place on SIGHUP
    #[arg(long)]
    reexec_on_reload: bool,

    /// Human-readable logs instead of JSON
    #[arg(long)]
    pretty: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    telemetry::init(cli.pretty).map_err(|e| anyhow::anyhow!("Failed to init telemetry: {}", e))?;

    info!("molt-echo starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = HandoffConfig::from_env();
    config.log_config();
    let platform = config.profile.platform();
    let lineage = Lineage::from_env();

    let inherited = HandoffEnv::from_env()
        .decode(platform.as_ref())
        .context("Failed to adopt inherited listeners")?;
    if !inherited.is_empty() {
        info!(services = ?inherited.names(), "Inherited listeners from predecessor");
    }

    let registry = Arc::new(Registry::new());
    let stop = CancellationToken::new();
    let tracker = TaskTracker::new();

    for (i, addr) in cli.tcp.iter().enumerate() {
        let name = format!("echo-tcp-{i}");
        let listener = Arc::new(adopt_tcp(&inherited, &name, addr)?);
        registry.put(name.clone(), Arc::clone(&listener))?;
        tracker.spawn(serve_tcp(name, listener, stop.clone(), tracker.clone()));
    }

    if let Some(path) = &cli.unix {
        let name = "echo-unix".to_string();
        let listener = Arc::new(adopt_unix(&inherited, &name, path)?);
        registry.put(name.clone(), Arc::clone(&listener))?;
        tracker.spawn(serve_unix(name, listener, stop.clone(), tracker.clone()));
    }

    if !inherited.is_empty() {
        warn!(services = ?inherited.names(), "Closing inherited listeners that are no longer configured");
        if let Err(e) = inherited.close() {
            warn!(error = %e, "Failed to close unused inherited listeners");
        }
    }

    // A successor that is serving tells its predecessor to stop.
    if lineage.spawner.is_some() {
        match lineage.signal_peer(platform.as_ref()) {
            Ok(Some(pid)) => info!(pid, "Predecessor told to stop"),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Failed to signal predecessor"),
        }
    }

    // One launcher: the reload hook's re-exec must see a successor spawned
    // on SIGUSR2.
    let launcher = ProcessLauncher::new(Arc::clone(&platform));
    let reload_launcher = cli.reexec_on_reload.then(|| launcher.clone());
    let hooks = build_hooks(&config, &stop, reload_launcher);
    let mut controller = Controller::with_launcher(&config, Arc::clone(&registry), launcher)
        .with_hooks(hooks)
        .before_fork(|| debug!("About to spawn successor"));

    let exit = controller
        .run()
        .await
        .context("Failed to install signal handlers")?;
    info!(signal = %exit.signal, "Signal loop finished");

    stop.cancel();
    if let Err(e) = registry.close() {
        warn!(error = %e, "Failed to close listeners");
    }

    tracker.close();
    let drain_timeout = Duration::from_secs(cli.drain_timeout_secs);
    if tokio::time::timeout(drain_timeout, tracker.wait()).await.is_err() {
        warn!(
            remaining = tracker.len(),
            timeout_secs = drain_timeout.as_secs(),
            "Drain timeout reached, abandoning connections"
        );
    } else {
        info!("All connections drained");
    }

    match exit.error {
        Some(e) => Err(e).context("Handoff failed"),
        None => Ok(()),
    }
}

fn build_hooks(
    config: &HandoffConfig,
    stop: &CancellationToken,
    launcher: Option<ProcessLauncher>,
) -> Hooks {
    let quit_stop = stop.clone();
    let terminate_stop = stop.clone();
    if config.profile == Profile::Reduced && launcher.is_none() {
        info!("Reduced profile: upgrade with --reexec-on-reload and SIGHUP");
    }

    Hooks::new()
        .on_reload(move |registry| {
            info!(services = registry.len(), "Reload requested");
            if let Some(launcher) = &launcher {
                launcher.reexec(registry, Signal::Reload)?;
            }
            Ok(())
        })
        .on_reopen(|_| {
            info!("Reopen requested, logs go to stdout");
            Ok(())
        })
        .on_quit(move |registry| {
            info!("Graceful stop: no longer accepting");
            quit_stop.cancel();
            registry.close()?;
            Ok(())
        })
        .on_terminate(move |registry| {
            info!("Terminating");
            terminate_stop.cancel();
            registry.close()?;
            Ok(())
        })
}

fn adopt_tcp(inherited: &Registry, name: &str, addr: &str) -> Result<tokio::net::TcpListener> {
    let listener = match inherited.take::<std::net::TcpListener>(name) {
        Some(listener) => {
            info!(name, addr = ?listener.local_addr().ok(), "Adopted inherited TCP listener");
            Arc::try_unwrap(listener)
                .map_err(|_| anyhow::anyhow!("Inherited listener '{}' is still shared", name))?
        }
        None => {
            let listener = std::net::TcpListener::bind(addr)
                .with_context(|| format!("Failed to bind {addr}"))?;
            info!(name, addr = ?listener.local_addr().ok(), "Bound TCP listener");
            listener
        }
    };
    listener.set_nonblocking(true)?;
    Ok(tokio::net::TcpListener::from_std(listener)?)
}

fn adopt_unix(inherited: &Registry, name: &str, path: &Path) -> Result<tokio::net::UnixListener> {
    let listener = match inherited.take::<std::os::unix::net::UnixListener>(name) {
        Some(listener) => {
            info!(name, path = %path.display(), "Adopted inherited unix listener");
            Arc::try_unwrap(listener)
                .map_err(|_| anyhow::anyhow!("Inherited listener '{}' is still shared", name))?
        }
        None => {
            match std::fs::remove_file(path) {
                Ok(()) => debug!(path = %path.display(), "Removed stale socket file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).context("Failed to remove stale socket file"),
            }
            let listener = std::os::unix::net::UnixListener::bind(path)
                .with_context(|| format!("Failed to bind {}", path.display()))?;
            info!(name, path = %path.display(), "Bound unix listener");
            listener
        }
    };
    listener.set_nonblocking(true)?;
    Ok(tokio::net::UnixListener::from_std(listener)?)
}

async fn serve_tcp(
    name: String,
    listener: Arc<tokio::net::TcpListener>,
    stop: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(service = %name, peer_addr = %peer, "Accepted connection");
                    tracker.spawn(echo(stream));
                }
                Err(e) => {
                    error!(service = %name, error = %e, "Accept failed");
                    break;
                }
            }
        }
    }
    info!(service = %name, "Stopped accepting");
}

async fn serve_unix(
    name: String,
    listener: Arc<tokio::net::UnixListener>,
    stop: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    debug!(service = %name, "Accepted connection");
                    tracker.spawn(echo(stream));
                }
                Err(e) => {
                    error!(service = %name, error = %e, "Accept failed");
                    break;
                }
            }
        }
    }
    info!(service = %name, "Stopped accepting");
}

async fn echo<S>(stream: S)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    match tokio::io::copy(&mut reader, &mut writer).await {
        Ok(bytes) => debug!(bytes, "Connection closed"),
        Err(e) => debug!(error = %e, "Connection ended with error"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["molt-echo"]);
        assert_eq!(cli.tcp, vec!["127.0.0.1:7070"]);
        assert!(cli.unix.is_none());
        assert_eq!(cli.drain_timeout_secs, 30);
        assert!(!cli.reexec_on_reload);
    }

    #[test]
    fn test_cli_multiple_tcp() {
        let cli = Cli::parse_from(["molt-echo", "--tcp", "127.0.0.1:1,127.0.0.1:2"]);
        assert_eq!(cli.tcp, vec!["127.0.0.1:1", "127.0.0.1:2"]);
    }

    #[tokio::test]
    async fn test_adopts_inherited_listener() {
        let inherited = Registry::new();
        let original = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = original.local_addr().unwrap();
        inherited.put("echo-tcp-0", Arc::new(original)).unwrap();

        let listener = adopt_tcp(&inherited, "echo-tcp-0", "127.0.0.1:1").unwrap();
        assert_eq!(listener.local_addr().unwrap(), addr);
        assert!(inherited.is_empty());
    }

    #[tokio::test]
    async fn test_serve_echoes_until_stopped() {
        let listener = Arc::new(tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap());
        let addr = listener.local_addr().unwrap();
        let stop = CancellationToken::new();
        let tracker = TaskTracker::new();
        tracker.spawn(serve_tcp("test".to_string(), listener, stop.clone(), tracker.clone()));

        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        client.write_all(b"molt").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"molt");

        stop.cancel();
        drop(client);
        tracker.close();
        tokio::time::timeout(Duration::from_secs(5), tracker.wait())
            .await
            .unwrap();
    }
}
