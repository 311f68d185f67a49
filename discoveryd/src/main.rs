mod config;
mod error;
mod discovery;
mod discovery_manager;
mod maintenance;
mod api;

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use anyhow::{Context, Result};
use shared::signal_queue::{Mailbox, TimedSignalQueue};
use crate::config::Config;
use crate::discovery_manager::{DiscoveryEvent, DiscoveryHandle, ManagerSettings};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("discoveryd=info,shared=info"))
        )
        .init();

    tracing::info!("Starting discoveryd");

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/discoveryd/discoveryd.toml".to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing::info!("Loaded config from {}", config_path);

    let queue = TimedSignalQueue::new(config.queue.precision_ms);
    queue.start();

    let (discovery, hash_rx) = DiscoveryHandle::spawn(ManagerSettings::from_config(&config))?;
    discovery.start();

    let cancel = CancellationToken::new();

    // Periodic maintenance runs in its own execution context
    let (mailbox, inbox) = Mailbox::new("discovery");
    let inbox_handle = inbox.spawn(cancel.clone());
    let tasks = maintenance::schedule(&queue, &mailbox, &discovery, &config.discovery);
    tracing::info!("Scheduled {} maintenance tasks", tasks.len());

    let mut events = discovery.subscribe();
    let events_cancel = cancel.clone();
    let events_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => log_event(&event),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Event log lagged, skipped {} events", skipped);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                _ = events_cancel.cancelled() => break,
            }
        }
    });

    let app_state = api::routes::AppState {
        discovery: discovery.clone(),
        hash_rx,
        config: Arc::new(config.clone()),
    };
    let app = api::routes::router(app_state);

    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.listen))?;

    tracing::info!("API listening on {}", config.api.listen);

    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    cancel.cancel();
    queue.stop();
    queue.clear();

    let _ = tokio::join!(inbox_handle, events_handle, server_handle);

    if !discovery.stop().await {
        tracing::error!("Failed to save discovery services on shutdown");
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

fn log_event(event: &DiscoveryEvent) {
    match event {
        DiscoveryEvent::ServiceAdded(entry) => {
            tracing::debug!("Service {} added: {} ({})", entry.id, entry.url, entry.kind);
        }
        DiscoveryEvent::ServiceRemoved(id) => tracing::debug!("Service {} removed", id),
        DiscoveryEvent::ServiceListEntry(entry) | DiscoveryEvent::ServiceInfo(entry) => {
            tracing::trace!("Service {}: rating {}, failures {}", entry.id, entry.rating, entry.failures);
        }
        DiscoveryEvent::HostsDiscovered { service, network, hosts } => {
            tracing::info!("Service {} returned {} {} hosts", service, hosts.len(), network.gwc_name());
        }
    }
}
