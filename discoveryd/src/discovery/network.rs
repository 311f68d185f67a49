use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use crate::config::NetworkConfig;

/// HTTP transport shared by all running service requests.
pub struct NetworkAccess {
    client: reqwest::Client,
}

impl NetworkAccess {
    fn new(config: &NetworkConfig) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Failed to build configured HTTP client, using defaults: {}", e);
                reqwest::Client::new()
            });

        Self { client }
    }

    /// GET `url` and return the body, failing on non-success status codes.
    pub async fn get_text(&self, url: &str) -> Result<String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Request to {} failed", url))?
            .error_for_status()
            .with_context(|| format!("{} returned an error status", url))?;

        response
            .text()
            .await
            .with_context(|| format!("Failed to read response body from {}", url))
    }
}

/// Lazily creates the shared [`NetworkAccess`] and forgets it once the last
/// holder drops it. Callers must keep their `Arc` until their request ends.
pub struct NetworkAccessSlot {
    config: NetworkConfig,
    current: Mutex<Weak<NetworkAccess>>,
    available: AtomicBool,
}

impl NetworkAccessSlot {
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            current: Mutex::new(Weak::new()),
            available: AtomicBool::new(true),
        }
    }

    pub fn acquire(&self) -> Arc<NetworkAccess> {
        let mut current = self.current.lock();

        if let Some(access) = current.upgrade() {
            return access;
        }

        tracing::debug!("Creating discovery network access");
        let access = Arc::new(NetworkAccess::new(&self.config));
        *current = Arc::downgrade(&access);
        access
    }

    /// Whether the network is reported reachable.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    #[cfg(test)]
    fn is_alive(&self) -> bool {
        self.current.lock().strong_count() > 0
    }
}
