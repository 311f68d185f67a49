use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use anyhow::{Context, Result};
use chrono::Utc;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use shared::protocol::MAX_RATING;
use shared::types::{Network, NetworkType, ServiceEntry, ServiceId, ServiceKind, INVALID_SERVICE_ID};
use crate::config::{Config, NetworkConfig};
use crate::discovery::hash;
use crate::discovery::network::{NetworkAccess, NetworkAccessSlot};
use crate::discovery::protocol::{self, ClientIdentity, Operation, RequestOutcome};
use crate::discovery::registry::{Insertion, Registry};
use crate::discovery::service::{normalize_url, DiscoveryService, ServicePolicy, ServiceRecord};
use crate::discovery::store::{self, DiscoveryStore, LoadSource};
use crate::error::DiscoveryError;

const EVENT_CAPACITY: usize = 256;

/// Notifications sent to observers
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    ServiceAdded(ServiceEntry),
    ServiceRemoved(ServiceId),
    /// Answer to an explicit list request
    ServiceListEntry(ServiceEntry),
    /// A service changed after a request or a merge
    ServiceInfo(ServiceEntry),
    HostsDiscovered {
        service: ServiceId,
        network: Network,
        hosts: Vec<String>,
    },
}

/// Everything the manager thread needs to run
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub data_path: PathBuf,
    pub defaults_file: PathBuf,
    pub policy: ServicePolicy,
    pub identity: ClientIdentity,
    pub network: NetworkConfig,
    pub max_caches_per_reply: usize,
    pub max_gwc_services: usize,
}

impl ManagerSettings {
    pub fn from_config(config: &Config) -> Self {
        let discovery = &config.discovery;
        Self {
            data_path: discovery.data_path.clone(),
            defaults_file: discovery.defaults_file.clone(),
            policy: ServicePolicy {
                access_throttle_secs: discovery.access_throttle_secs as i64,
                revival_interval_secs: discovery.zero_rating_revival_secs as i64,
                max_zero_revivals: discovery.max_zero_revivals,
            },
            identity: ClientIdentity {
                client_id: config.network.client_id.clone(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                advertised_address: discovery.advertised_address.clone(),
            },
            network: config.network.clone(),
            max_caches_per_reply: discovery.max_caches_per_reply,
            max_gwc_services: discovery.max_gwc_services,
        }
    }
}

enum Target {
    Network(NetworkType),
    Service(ServiceId),
}

/// Commands sent to the discovery thread
enum DiscoveryCommand {
    Start,
    Add {
        url: String,
        kind: ServiceKind,
        networks: NetworkType,
        rating: u8,
        reply: oneshot::Sender<Result<Insertion, DiscoveryError>>,
    },
    Remove(ServiceId, oneshot::Sender<bool>),
    SetRating(ServiceId, u8, oneshot::Sender<bool>),
    Clear {
        notify: bool,
        reply: oneshot::Sender<()>,
    },
    Count(Option<NetworkType>, oneshot::Sender<usize>),
    Check(ServiceEntry, oneshot::Sender<bool>),
    Get(ServiceId, oneshot::Sender<Option<ServiceEntry>>),
    List(oneshot::Sender<Vec<ServiceEntry>>),
    RandomService(NetworkType, oneshot::Sender<Option<ServiceEntry>>),
    RequestServiceList,
    Save {
        force: bool,
        reply: Option<oneshot::Sender<bool>>,
    },
    Load,
    AddDefaults,
    Run(Operation, Target),
    Finished {
        service: Arc<DiscoveryService>,
        network: Network,
        outcome: RequestOutcome,
    },
    Stop(oneshot::Sender<bool>),
}

/// Handle to interact with the discovery manager
#[derive(Clone)]
pub struct DiscoveryHandle {
    tx: mpsc::UnboundedSender<DiscoveryCommand>,
    events: broadcast::Sender<DiscoveryEvent>,
    network: Arc<NetworkAccessSlot>,
    /// Registry dirty flag, written by the manager thread
    dirty: Arc<AtomicBool>,
}

impl DiscoveryHandle {
    /// Spawn the discovery thread. Must be called from within a tokio runtime;
    /// service requests are run on that runtime.
    pub fn spawn(settings: ManagerSettings) -> Result<(Self, watch::Receiver<String>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (hash_tx, hash_rx) = watch::channel(hash::compute_hash(&[]));
        let network = Arc::new(NetworkAccessSlot::new(settings.network.clone()));
        let registry = Registry::new();
        let dirty = registry.dirty_flag();

        let manager = Manager {
            registry,
            store: DiscoveryStore::new(&settings.data_path),
            settings,
            network: network.clone(),
            events: events.clone(),
            hash_tx,
            commands: tx.downgrade(),
            runtime: Handle::current(),
        };

        thread::Builder::new()
            .name("discovery".to_string())
            .spawn(move || manager.run(rx))
            .context("Failed to spawn discovery thread")?;

        Ok((Self { tx, events, network, dirty }, hash_rx))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.events.subscribe()
    }

    fn send(&self, command: DiscoveryCommand) {
        if self.tx.send(command).is_err() {
            tracing::warn!("Discovery manager is not running, dropping request");
        }
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> DiscoveryCommand) -> Result<T, DiscoveryError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(command(reply)).map_err(|_| DiscoveryError::Unavailable)?;
        rx.await.map_err(|_| DiscoveryError::Unavailable)
    }

    /// Load persisted services, seeding from the defaults file if none exist.
    pub fn start(&self) {
        self.send(DiscoveryCommand::Start);
    }

    /// Add a service. A same-kind duplicate is merged into the existing entry.
    pub async fn add(&self, url: &str, kind: ServiceKind, networks: NetworkType, rating: u8) -> Result<Insertion, DiscoveryError> {
        let url = url.to_string();
        self.request(|reply| DiscoveryCommand::Add { url, kind, networks, rating, reply })
            .await?
    }

    pub async fn remove(&self, id: ServiceId) -> bool {
        self.request(|reply| DiscoveryCommand::Remove(id, reply))
            .await
            .unwrap_or(false)
    }

    /// Override a service's rating. False if the id is unknown.
    pub async fn set_rating(&self, id: ServiceId, rating: u8) -> bool {
        self.request(|reply| DiscoveryCommand::SetRating(id, rating, reply))
            .await
            .unwrap_or(false)
    }

    pub async fn clear(&self, notify: bool) {
        if self.request(|reply| DiscoveryCommand::Clear { notify, reply }).await.is_err() {
            tracing::warn!("Discovery manager is not running, clear dropped");
        }
    }

    /// Total number of services, or the working ones for `network`.
    pub async fn count(&self, network: Option<NetworkType>) -> usize {
        self.request(|reply| DiscoveryCommand::Count(network, reply))
            .await
            .unwrap_or(0)
    }

    /// Whether `entry` is a service managed here.
    pub async fn check(&self, entry: &ServiceEntry) -> bool {
        let entry = entry.clone();
        self.request(|reply| DiscoveryCommand::Check(entry, reply))
            .await
            .unwrap_or(false)
    }

    pub async fn get(&self, id: ServiceId) -> Option<ServiceEntry> {
        self.request(|reply| DiscoveryCommand::Get(id, reply))
            .await
            .ok()
            .flatten()
    }

    pub async fn list(&self) -> Vec<ServiceEntry> {
        self.request(DiscoveryCommand::List).await.unwrap_or_default()
    }

    /// Weighted random pick among the services eligible for `network`.
    pub async fn random_service(&self, network: NetworkType) -> Option<ServiceEntry> {
        self.request(|reply| DiscoveryCommand::RandomService(network, reply))
            .await
            .ok()
            .flatten()
    }

    /// Forced saves run synchronously and report the real outcome. Otherwise
    /// true means there was nothing to write, and false means a save was queued.
    pub async fn save(&self, force: bool) -> bool {
        if force {
            return self
                .request(|reply| DiscoveryCommand::Save { force: true, reply: Some(reply) })
                .await
                .unwrap_or(false);
        }

        if !self.dirty.load(Ordering::Acquire) {
            return true;
        }
        self.queue_save();
        false
    }

    /// Queue a save that only writes if something changed.
    pub fn queue_save(&self) {
        self.send(DiscoveryCommand::Save { force: false, reply: None });
    }

    pub fn load(&self) {
        self.send(DiscoveryCommand::Load);
    }

    pub fn add_defaults(&self) {
        self.send(DiscoveryCommand::AddDefaults);
    }

    /// Emit a `ServiceListEntry` event for every service.
    pub fn request_service_list(&self) {
        self.send(DiscoveryCommand::RequestServiceList);
    }

    /// Advertise ourselves on a random service for `network`, if the network is up.
    pub fn update_network(&self, network: NetworkType) {
        self.send(DiscoveryCommand::Run(Operation::Update, Target::Network(network)));
    }

    /// Update a specific service, regardless of reported connectivity.
    pub fn update_service(&self, id: ServiceId) {
        self.send(DiscoveryCommand::Run(Operation::Update, Target::Service(id)));
    }

    pub fn query_network(&self, network: NetworkType) {
        self.send(DiscoveryCommand::Run(Operation::Query, Target::Network(network)));
    }

    pub fn query_service(&self, id: ServiceId) {
        self.send(DiscoveryCommand::Run(Operation::Query, Target::Service(id)));
    }

    /// Shared HTTP access; hold it until the request using it completes.
    pub fn request_network(&self) -> Arc<NetworkAccess> {
        self.network.acquire()
    }

    pub fn set_network_available(&self, available: bool) {
        self.network.set_available(available);
    }

    pub fn is_network_available(&self) -> bool {
        self.network.is_available()
    }

    /// Save, drop all services and end the discovery thread.
    pub async fn stop(&self) -> bool {
        self.request(DiscoveryCommand::Stop).await.unwrap_or(false)
    }
}

struct Manager {
    registry: Registry,
    store: DiscoveryStore,
    settings: ManagerSettings,
    network: Arc<NetworkAccessSlot>,
    events: broadcast::Sender<DiscoveryEvent>,
    hash_tx: watch::Sender<String>,
    commands: mpsc::WeakUnboundedSender<DiscoveryCommand>,
    runtime: Handle,
}

impl Manager {
    fn run(mut self, mut rx: mpsc::UnboundedReceiver<DiscoveryCommand>) {
        tracing::debug!("Discovery thread started");

        while let Some(command) = rx.blocking_recv() {
            match command {
                DiscoveryCommand::Start => {
                    self.load();
                    if self.registry.is_empty() {
                        self.add_defaults();
                    }
                }
                DiscoveryCommand::Add { url, kind, networks, rating, reply } => {
                    let result = self.add(&url, kind, networks, rating);
                    let _ = reply.send(result);
                }
                DiscoveryCommand::Remove(id, reply) => {
                    let removed = self.remove(id);
                    let _ = reply.send(removed);
                }
                DiscoveryCommand::SetRating(id, rating, reply) => {
                    let updated = self.set_rating(id, rating);
                    let _ = reply.send(updated);
                }
                DiscoveryCommand::Clear { notify, reply } => {
                    self.clear(notify);
                    let _ = reply.send(());
                }
                DiscoveryCommand::Count(network, reply) => {
                    let _ = reply.send(self.registry.count(network));
                }
                DiscoveryCommand::Check(entry, reply) => {
                    let _ = reply.send(self.registry.check(&entry));
                }
                DiscoveryCommand::Get(id, reply) => {
                    let _ = reply.send(self.registry.get(id).map(|s| s.entry()));
                }
                DiscoveryCommand::List(reply) => {
                    let _ = reply.send(self.registry.entries());
                }
                DiscoveryCommand::RandomService(network, reply) => {
                    let now = Utc::now().timestamp();
                    let service = self.registry.random_service(network, now, &self.settings.policy);
                    let _ = reply.send(service.map(|s| s.entry()));
                }
                DiscoveryCommand::RequestServiceList => {
                    for entry in self.registry.entries() {
                        self.emit(DiscoveryEvent::ServiceListEntry(entry));
                    }
                }
                DiscoveryCommand::Save { force, reply } => {
                    let saved = self.save(force);
                    if let Some(reply) = reply {
                        let _ = reply.send(saved);
                    }
                }
                DiscoveryCommand::Load => self.load(),
                DiscoveryCommand::AddDefaults => self.add_defaults(),
                DiscoveryCommand::Run(operation, target) => self.run_operation(operation, target),
                DiscoveryCommand::Finished { service, network, outcome } => {
                    self.finished(service, network, outcome);
                }
                DiscoveryCommand::Stop(reply) => {
                    let saved = self.save(true);
                    self.clear(false);
                    let _ = reply.send(saved);
                    break;
                }
            }

            self.publish_fingerprint();
        }

        tracing::info!("Discovery thread shutting down");
    }

    fn emit(&self, event: DiscoveryEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn publish_fingerprint(&self) {
        let fingerprint = hash::compute_hash(&self.registry.entries());
        self.hash_tx.send_if_modified(|current| {
            if *current == fingerprint {
                false
            } else {
                *current = fingerprint;
                true
            }
        });
    }

    fn add(&mut self, url: &str, kind: ServiceKind, networks: NetworkType, rating: u8) -> Result<Insertion, DiscoveryError> {
        let normalized = normalize_url(url).inspect_err(|_| {
            tracing::error!("Could not add invalid URL as a discovery service: {}", url);
        })?;

        self.insert(ServiceRecord::new(normalized, kind, networks, rating))
    }

    fn insert(&mut self, record: ServiceRecord) -> Result<Insertion, DiscoveryError> {
        let url = record.url.clone();

        match self.registry.insert(record) {
            Ok(insertion) => {
                if let Some(service) = self.registry.get(insertion.id()) {
                    let entry = service.entry();
                    match insertion {
                        Insertion::Added(_) => {
                            tracing::info!("New discovery service added: {}", url);
                            self.emit(DiscoveryEvent::ServiceAdded(entry));
                        }
                        Insertion::Merged(_) => self.emit(DiscoveryEvent::ServiceInfo(entry)),
                    }
                }
                Ok(insertion)
            }
            Err(e) => {
                tracing::error!("Error adding service: {}", e);
                Err(e)
            }
        }
    }

    fn remove(&mut self, id: ServiceId) -> bool {
        if id == INVALID_SERVICE_ID {
            tracing::error!("Got request to remove invalid service id {}", id);
            return false;
        }

        match self.registry.remove(id) {
            Some(service) => {
                tracing::info!("Removing discovery service: {}", service.url());
                self.emit(DiscoveryEvent::ServiceRemoved(id));
                true
            }
            None => {
                tracing::error!("Got request to remove unknown service id {}", id);
                false
            }
        }
    }

    fn set_rating(&mut self, id: ServiceId, rating: u8) -> bool {
        let Some(service) = self.registry.get(id) else {
            tracing::warn!("Got rating change for unknown service id {}", id);
            return false;
        };

        service.set_rating(rating);
        let entry = service.entry();
        self.registry.mark_dirty();
        self.emit(DiscoveryEvent::ServiceInfo(entry));
        true
    }

    fn clear(&mut self, notify: bool) {
        let removed = self.registry.clear();
        if notify {
            for id in removed {
                self.emit(DiscoveryEvent::ServiceRemoved(id));
            }
        }
    }

    fn save(&mut self, force: bool) -> bool {
        if !force && !self.registry.is_dirty() {
            return true;
        }

        tracing::info!(
            "Saving discovery services to {} (backup {})",
            self.store.primary_path().display(),
            self.store.backup_path().display()
        );

        match self.store.save(&self.registry.records()) {
            Ok(()) => {
                self.registry.mark_saved();
                true
            }
            Err(e) => {
                tracing::error!("Error while writing discovery services to disk: {:#}", e);
                false
            }
        }
    }

    fn load(&mut self) {
        match self.store.load() {
            Ok((records, source)) => {
                self.registry.clear();
                let total = records.len();
                let mut loaded = 0;
                for record in records {
                    match self.registry.insert(record) {
                        Ok(_) => loaded += 1,
                        Err(e) => tracing::warn!("Dropping stored service: {}", e),
                    }
                }

                match source {
                    LoadSource::Primary => self.registry.mark_saved(),
                    // Rewrite the primary file on the next save
                    LoadSource::Backup => self.registry.mark_dirty(),
                }

                tracing::info!("Loaded {} of {} discovery services ({:?} file)", loaded, total, source);
            }
            Err(e) => {
                self.registry.clear();
                tracing::error!("Failed to load discovery services: {:#}", e);
            }
        }
    }

    fn add_defaults(&mut self) {
        let path = &self.settings.defaults_file;
        tracing::debug!("Loading default services from {}", path.display());

        let defaults = match store::load_defaults(path) {
            Ok(defaults) => defaults,
            Err(e) => {
                tracing::error!("Error while loading default services: {:#}", e);
                return;
            }
        };

        for default in defaults {
            let Ok(url) = normalize_url(&default.url) else {
                tracing::warn!("Skipping invalid default service URL: {}", default.url);
                continue;
            };

            let mut record = ServiceRecord::new(url, default.kind, default.networks, default.rating);
            record.banned = default.banned;
            let _ = self.insert(record);
        }
    }

    fn run_operation(&mut self, operation: Operation, target: Target) {
        match target {
            Target::Network(networks) => {
                if !self.network.is_available() {
                    tracing::error!(
                        "Could not {:?} a service because the network connection is currently unavailable",
                        operation
                    );
                    return;
                }

                let now = Utc::now().timestamp();
                match self.registry.random_service(networks, now, &self.settings.policy) {
                    Some(service) => {
                        let network = service
                            .networks()
                            .networks()
                            .find(|n| networks.is_network((*n).into()))
                            .unwrap_or(Network::G2);
                        self.start_request(service, operation, network);
                    }
                    None => {
                        tracing::warn!("Unable to find a service to {:?} for network: {}", operation, networks);
                    }
                }
            }
            // Manual requests skip the connectivity check
            Target::Service(id) => match self.registry.get(id).cloned() {
                Some(service) => {
                    let network = service.networks().networks().next().unwrap_or(Network::G2);
                    self.start_request(service, operation, network);
                }
                None => tracing::warn!("Got {:?} request for unknown service id {}", operation, id),
            },
        }
    }

    fn start_request(&self, service: Arc<DiscoveryService>, operation: Operation, network: Network) {
        let Some(token) = service.begin_request(Utc::now().timestamp()) else {
            tracing::debug!("Service {} is busy, skipping {:?}", service.url(), operation);
            return;
        };

        tracing::info!("{:?} service: {}", operation, service.url());

        let access = self.network.acquire();
        let identity = self.settings.identity.clone();
        let policy = self.settings.policy.clone();
        let commands = self.commands.clone();

        self.runtime.spawn(async move {
            let outcome = tokio::select! {
                outcome = protocol::perform(&service, operation, network, &access, &identity) => outcome,
                _ = token.cancelled() => RequestOutcome::Cancelled,
            };
            drop(access);

            service.finish_request(&outcome, Utc::now().timestamp(), &policy);

            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(DiscoveryCommand::Finished { service, network, outcome });
            }
        });
    }

    fn finished(&mut self, service: Arc<DiscoveryService>, network: Network, outcome: RequestOutcome) {
        let registered = self
            .registry
            .get(service.id())
            .is_some_and(|current| Arc::ptr_eq(current, &service));
        if !registered {
            tracing::debug!("Request finished for removed service {}", service.url());
            return;
        }

        self.registry.mark_dirty();
        self.emit(DiscoveryEvent::ServiceInfo(service.entry()));

        if let RequestOutcome::Queried { hosts, caches } = outcome {
            tracing::info!("{} returned {} hosts and {} caches", service.url(), hosts.len(), caches.len());

            self.import_caches(&caches, network);

            // Last, so subscribers see it after the cache notifications
            if !hosts.is_empty() {
                self.emit(DiscoveryEvent::HostsDiscovered {
                    service: service.id(),
                    network,
                    hosts,
                });
            }
        }
    }

    /// Register web caches announced in a query reply, within the configured limits.
    fn import_caches(&mut self, caches: &[String], network: Network) {
        if caches.len() > self.settings.max_caches_per_reply {
            tracing::debug!(
                "Ignoring {} of {} announced caches",
                caches.len() - self.settings.max_caches_per_reply,
                caches.len()
            );
        }

        for cache in caches.iter().take(self.settings.max_caches_per_reply) {
            let Ok(url) = normalize_url(cache) else {
                tracing::debug!("Skipping invalid announced cache: {}", cache);
                continue;
            };

            let known = self.registry.count_kind(ServiceKind::Gwc);
            if known >= self.settings.max_gwc_services && !self.registry.contains_url(&url) {
                tracing::debug!("Already tracking {} web caches, not adding {}", known, url);
                continue;
            }

            let _ = self.insert(ServiceRecord::new(url, ServiceKind::Gwc, network.into(), MAX_RATING));
        }
    }
}
