use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use wakegate::config::Config;
use wakegate::controller::ScriptController;
use wakegate::lifecycle::BackendManager;
use wakegate::proxy::ProxyServer;
use wakegate::{PKG_NAME, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("wakegate=debug".parse()?),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    // Write PID file if configured (with exclusive lock on Unix)
    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = PidFile::create(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    let config = Arc::new(config);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let controller = Arc::new(ScriptController::new(config.scripts.clone()));
    let manager = BackendManager::from_config(&config, controller);
    let mut fatal_rx = manager.subscribe_fatal();

    let proxy = ProxyServer::new(Arc::clone(&config), Arc::clone(&manager), shutdown_rx);
    let mut proxy_handle = tokio::spawn(async move { proxy.run().await });

    // Wait for a shutdown signal, a failed backend start, or the listener dying
    let mut failure: Option<anyhow::Error> = None;

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
            result = fatal_rx.wait_for(|message| message.is_some()) => {
                let message = result
                    .ok()
                    .and_then(|message| message.clone())
                    .unwrap_or_default();
                failure = Some(anyhow::anyhow!("Backend start failed: {}", message));
            }
            result = &mut proxy_handle => {
                failure = Some(proxy_exit_error(result));
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
            }
            result = fatal_rx.wait_for(|message| message.is_some()) => {
                let message = result
                    .ok()
                    .and_then(|message| message.clone())
                    .unwrap_or_default();
                failure = Some(anyhow::anyhow!("Backend start failed: {}", message));
            }
            result = &mut proxy_handle => {
                failure = Some(proxy_exit_error(result));
            }
        }
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    if config.lifecycle.stop_on_exit && manager.shutdown().await {
        info!("Backend stopped on exit");
    }

    // Wait for the listener to stop (with timeout)
    if !proxy_handle.is_finished() {
        let _ = tokio::time::timeout(Duration::from_secs(5), proxy_handle).await;
    }

    // Clean up PID file
    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    if let Some(e) = failure {
        error!(error = %e, "Exiting after fatal error");
        return Err(e);
    }

    info!("Shutdown complete");
    Ok(())
}

fn proxy_exit_error(result: Result<anyhow::Result<()>, tokio::task::JoinError>) -> anyhow::Error {
    match result {
        Ok(Ok(())) => anyhow::anyhow!("Proxy server stopped unexpectedly"),
        Ok(Err(e)) => e.context("Proxy server failed"),
        Err(e) => anyhow::anyhow!("Proxy server task failed: {}", e),
    }
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        // Try to acquire exclusive lock (non-blocking)
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        use std::io::Write;
        writeln!(&file, "{}", std::process::id())?;

        // Keep the file handle open to maintain the lock
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        let mut file = std::fs::File::create(path)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self)
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting proxy");
    info!(
        listen = %config.server.listen,
        backend = %config.server.backend,
        handshake_timeout_ms = config.server.handshake_timeout_ms,
        "Server configuration"
    );
    info!(
        idle_shutdown_delay_secs = config.lifecycle.idle_shutdown_delay_secs,
        startup_grace_delay_secs = config.lifecycle.startup_grace_delay_secs,
        connect_timeout_ms = config.lifecycle.connect_timeout_ms,
        io_timeout_ms = config.lifecycle.io_timeout_ms,
        stop_on_exit = config.lifecycle.stop_on_exit,
        "Lifecycle settings"
    );
    info!(
        status_cache = config.status.cache,
        wait_for_start = config.login.wait_for_start,
        start_script = %config.scripts.start.command,
        stop_script = %config.scripts.stop.command,
        "Handling settings"
    );
}
