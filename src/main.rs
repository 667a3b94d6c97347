use ghostwarden::child::OsSpawner;
use ghostwarden::config::{Config, TARGETS_ENV};
use ghostwarden::failover::{FailoverLoop, FailoverSettings};
use ghostwarden::ghostunnel::Ghostunnel;
use ghostwarden::healthcheck::HttpProbe;
use ghostwarden::target::{FileTargetSource, TargetRotator};
use ghostwarden::{PKG_NAME, VERSION};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

const DEFAULT_CONFIG_PATH: &str = "ghostwarden.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ghostwarden=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration; only an explicitly named file has to exist
    let config_arg = std::env::args().nth(1).map(PathBuf::from);
    let config_path = config_arg
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let loaded = match config_arg {
        Some(_) => Config::load(&config_path),
        None => Config::load_or_default(&config_path),
    };
    let mut config = loaded.map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;
    config.apply_env_overrides();

    print_startup_banner(&config);

    let settings = FailoverSettings::from_config(&config)?;
    let probe = HttpProbe::new(
        &config.health,
        &config.proxy.listen,
        config.proxy.cacert.as_deref(),
    )?;
    let rotator = TargetRotator::new(FileTargetSource::new(
        &config.targets.file,
        config.targets.default_port,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let failover = FailoverLoop::new(
        rotator,
        Arc::new(Ghostunnel::from_config(&config.proxy)),
        Arc::new(OsSpawner),
        Arc::new(probe),
        settings,
        shutdown_rx,
    );

    let mut failover_handle = tokio::spawn(failover.run());

    // Wait for the loop to fail or for a shutdown signal (Ctrl+C or SIGTERM)
    let result = tokio::select! {
        result = &mut failover_handle => result,
        _ = shutdown_signal() => {
            let _ = shutdown_tx.send(true);
            // The loop stops its proxy before returning
            failover_handle.await
        }
    };

    match result? {
        Ok(()) => {
            info!("Shutdown complete");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Supervisor stopped on a fatal error");
            Err(e.into())
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT (Ctrl+C), shutting down...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
    info!("Received Ctrl+C, shutting down...");
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting proxy supervisor");
    info!(
        file = %config.targets.file.display(),
        env = TARGETS_ENV,
        default_port = config.targets.default_port,
        "Targets source"
    );
    info!(
        command = %config.proxy.command,
        listen = %config.proxy.listen,
        cacert = ?config.proxy.cacert,
        disable_authentication = config.proxy.disable_authentication,
        "Proxy settings"
    );
    info!(
        max_attempts = config.readiness.max_attempts,
        poll_interval_ms = config.readiness.poll_interval_ms,
        step_timeout_ms = config.shutdown.step_timeout_ms,
        "Readiness and shutdown settings"
    );
    info!(
        mode = ?config.health.mode,
        path = %config.health.path,
        interval_secs = config.health.interval_secs,
        unhealthy_threshold = config.health.unhealthy_threshold,
        spam_protection_secs = config.failover.spam_protection_secs,
        "Health check settings"
    );
}
