//! Generator polling service (`gensrv`)

use std::sync::Arc;

use anyhow::Context;
use axum::serve;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use common::service_bootstrap::print_startup_banner;
use common::shutdown::cancel_on_shutdown;
use gensrv::api::{create_router, AppState};
use gensrv::core::bootstrap::{self, Args};
use gensrv::publisher::build_publisher;
use gensrv::{AppConfig, ChannelRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let service_info = bootstrap::service_info();

    let config = AppConfig::load(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;

    bootstrap::initialize_logging(&args, &service_info, &config)?;
    if !args.no_color {
        print_startup_banner(&service_info);
    }

    config.validate().context("Invalid configuration")?;
    info!("Configuration loaded from {}", args.config.display());

    // Validation mode: validate and exit
    if args.validate {
        bootstrap::describe_configuration(&config);
        info!("Validation completed successfully");
        return Ok(());
    }

    let publisher = build_publisher(&config.publisher)?;

    if args.publish_test {
        let failures = bootstrap::run_publish_test(&config, publisher.as_ref()).await;
        if failures > 0 {
            anyhow::bail!("{} channel(s) failed the publish test", failures);
        }
        info!("Publish test completed successfully");
        return Ok(());
    }

    let config = Arc::new(config);
    let shutdown_token = CancellationToken::new();
    let signal_handle = cancel_on_shutdown(shutdown_token.clone());

    let registry = ChannelRegistry::start(
        Arc::clone(&config),
        publisher,
        shutdown_token.child_token(),
    )?;

    let server_handle = if config.api.enabled {
        let addr = config.api.socket_addr().context("Invalid API bind address")?;

        let socket = if addr.is_ipv4() {
            tokio::net::TcpSocket::new_v4()
        } else {
            tokio::net::TcpSocket::new_v6()
        }
        .context("Failed to create socket")?;
        socket
            .set_reuseaddr(true)
            .context("Failed to set SO_REUSEADDR")?;
        socket
            .bind(addr)
            .with_context(|| format!("Failed to bind to {}", addr))?;
        let listener = socket.listen(1024).context("Failed to listen")?;

        info!("API server listening on http://{}", addr);
        info!("Health check: http://{}/health", addr);

        let app = create_router(AppState::new(
            config.service.name.clone(),
            registry.statuses(),
        ));
        let server_token = shutdown_token.clone();
        Some(tokio::spawn(async move {
            let shutdown = async move { server_token.cancelled().await };
            if let Err(e) = serve(listener, app).with_graceful_shutdown(shutdown).await {
                error!("Server error: {}", e);
            }
        }))
    } else {
        info!("API server disabled");
        None
    };

    shutdown_token.cancelled().await;
    info!("Shutting down...");

    registry.shutdown().await;
    if let Some(handle) = server_handle {
        if let Err(e) = handle.await {
            error!("Server task failed: {}", e);
        }
    }
    let _ = signal_handle.await;

    info!("Service stopped");
    Ok(())
}
