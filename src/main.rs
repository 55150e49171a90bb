use gar_proxy::config::Config;
use gar_proxy::credentials::{CredentialMode, Credentials};
use gar_proxy::proxy::ProxyServer;
use gar_proxy::upstream::UpstreamClient;
use gar_proxy::{PKG_NAME, VERSION};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("gar_proxy=info".parse().expect("valid log directive")),
        )
        .init();

    let config = match Config::try_load() {
        Ok(config) => config,
        Err(e) if e.use_stderr() => {
            let _ = e.print();
            std::process::exit(1);
        }
        Err(e) => e.exit(),
    };

    let upstream = config.upstream().map_err(|e| {
        error!(registry = %config.registry, error = %e, "Error reading configuration");
        e
    })?;

    let mode = CredentialMode::from_only_metadata(config.only_metadata);
    info!(
        name = PKG_NAME,
        version = VERSION,
        listen = %config.listen,
        upstream = %upstream.origin(),
        prefix = upstream.prefix(),
        credentials = %mode,
        "Starting proxy server"
    );

    let credentials = Credentials::discover(mode).await.map_err(|e| {
        error!(mode = %mode, error = %e, "Unable to setup GCP credentials");
        e
    })?;

    credentials.validate().await.map_err(|e| {
        error!(error = %e, "Unable to fetch initial GCP token");
        e
    })?;

    let client = UpstreamClient::new(upstream).map_err(|e| {
        error!(error = %e, "Unable to create upstream client");
        e
    })?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = ProxyServer::bind(&config.listen, client, Arc::new(credentials), shutdown_rx)
        .await
        .map_err(|e| {
            error!(listen = %config.listen, error = %e, "Unable to start HTTP server");
            e
        })?;

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    wait_for_shutdown().await;

    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    info!("Shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

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
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down...");
    }
}
