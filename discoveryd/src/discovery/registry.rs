use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use rand::Rng;
use shared::types::{NetworkType, ServiceEntry, ServiceId, ServiceKind, INVALID_SERVICE_ID};
use crate::discovery::service::{DiscoveryService, ServicePolicy, ServiceRecord};
use crate::error::DiscoveryError;

/// Result of a successful insertion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insertion {
    Added(ServiceId),
    /// Same URL and kind already present; its networks absorbed the new ones
    Merged(ServiceId),
}

impl Insertion {
    pub fn id(self) -> ServiceId {
        match self {
            Self::Added(id) | Self::Merged(id) => id,
        }
    }
}

/// All known discovery services keyed by id. Owned by the manager thread.
#[derive(Default)]
pub struct Registry {
    services: HashMap<ServiceId, Arc<DiscoveryService>>,
    last_id: ServiceId,
    /// Shared with handles so they can skip queuing saves that would do nothing
    dirty: Arc<AtomicBool>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn get(&self, id: ServiceId) -> Option<&Arc<DiscoveryService>> {
        self.services.get(&id)
    }

    /// Number of services of `kind`, banned ones included.
    pub fn count_kind(&self, kind: ServiceKind) -> usize {
        self.services.values().filter(|s| s.kind() == kind).count()
    }

    /// `url` must already be normalized.
    pub fn contains_url(&self, url: &str) -> bool {
        self.services.values().any(|s| s.url() == url)
    }

    /// Unsaved modifications are pending.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Read-only view of the dirty state for other threads.
    pub fn dirty_flag(&self) -> Arc<AtomicBool> {
        self.dirty.clone()
    }

    pub fn mark_dirty(&mut self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn mark_saved(&mut self) {
        self.dirty.store(false, Ordering::Release);
    }

    /// Insert a service built from `record`, keeping its id if it is free.
    pub fn insert(&mut self, record: ServiceRecord) -> Result<Insertion, DiscoveryError> {
        if let Some(existing) = self.manage_duplicates(&record)? {
            return Ok(Insertion::Merged(existing));
        }

        let mut id = record.id;
        if id != INVALID_SERVICE_ID && self.services.contains_key(&id) {
            tracing::debug!("Service id {} already in use, assigning a new one to {}", id, record.url);
            id = INVALID_SERVICE_ID;
        }

        if id == INVALID_SERVICE_ID {
            loop {
                self.last_id += 1;
                if !self.services.contains_key(&self.last_id) {
                    break;
                }
            }
            id = self.last_id;
        } else {
            self.last_id = self.last_id.max(id);
        }

        self.services.insert(id, Arc::new(DiscoveryService::from_record(id, record)));
        self.mark_dirty();
        Ok(Insertion::Added(id))
    }

    /// Same URL and kind: merge networks into the existing entry and report its id.
    /// Same URL with another kind is rejected.
    fn manage_duplicates(&mut self, record: &ServiceRecord) -> Result<Option<ServiceId>, DiscoveryError> {
        let Some(existing) = self.services.values().find(|s| s.url() == record.url) else {
            return Ok(None);
        };

        if existing.kind() != record.kind {
            return Err(DiscoveryError::KindConflict {
                url: record.url.clone(),
                id: existing.id(),
                existing: existing.kind(),
                requested: record.kind,
            });
        }

        existing.add_networks(record.networks);
        let id = existing.id();
        tracing::debug!("Detected a duplicate of service {}, merged networks", id);
        self.mark_dirty();
        Ok(Some(id))
    }

    /// Remove a service and cancel its request. Id 0 is never present.
    pub fn remove(&mut self, id: ServiceId) -> Option<Arc<DiscoveryService>> {
        let service = self.services.remove(&id)?;
        service.cancel_request();

        if id == self.last_id {
            while self.last_id > 0 && !self.services.contains_key(&self.last_id) {
                self.last_id -= 1;
            }
        }

        self.mark_dirty();
        Some(service)
    }

    /// Remove everything, returning the removed ids.
    pub fn clear(&mut self) -> Vec<ServiceId> {
        let ids: Vec<ServiceId> = self.services.keys().copied().collect();
        for service in self.services.values() {
            service.cancel_request();
        }
        self.services.clear();
        self.last_id = 0;
        if !ids.is_empty() {
            self.mark_dirty();
        }
        ids
    }

    /// Total size without a network; otherwise the services currently working for it.
    pub fn count(&self, network: Option<NetworkType>) -> usize {
        match network {
            None => self.services.len(),
            Some(network) => self.services.values().filter(|s| s.is_working(network)).count(),
        }
    }

    /// Whether `entry` describes a service managed here.
    pub fn check(&self, entry: &ServiceEntry) -> bool {
        self.services
            .get(&entry.id)
            .is_some_and(|s| s.kind() == entry.kind && s.url() == entry.url)
    }

    pub fn random_service(&mut self, network: NetworkType, now: i64, policy: &ServicePolicy) -> Option<Arc<DiscoveryService>> {
        self.random_service_with(network, now, policy, &mut rand::rng())
    }

    /// Pick a service for `network` with probability proportional to its rating.
    pub fn random_service_with<R: Rng>(
        &mut self,
        network: NetworkType,
        now: i64,
        policy: &ServicePolicy,
        rng: &mut R,
    ) -> Option<Arc<DiscoveryService>> {
        let mut candidates = Vec::new();
        let mut total_rating: u32 = 0;
        let mut revived = false;

        for service in self.services.values() {
            let eligibility = service.eligibility(network, now, policy);
            revived |= eligibility.revived;
            if let Some(weight) = eligibility.weight.filter(|w| *w > 0) {
                total_rating += u32::from(weight);
                candidates.push((service.clone(), u32::from(weight)));
            }
        }

        if revived {
            self.mark_dirty();
        }

        if candidates.is_empty() {
            return None;
        }

        let mut remaining = rng.random_range(1..=total_rating);
        for (service, weight) in candidates {
            if remaining <= weight {
                return Some(service);
            }
            remaining -= weight;
        }

        None
    }

    pub fn records(&self) -> Vec<ServiceRecord> {
        self.services.values().map(|s| s.record()).collect()
    }

    /// Observer view of all services, ordered by id.
    pub fn entries(&self) -> Vec<ServiceEntry> {
        let mut entries: Vec<ServiceEntry> = self.services.values().map(|s| s.entry()).collect();
        entries.sort_by_key(|e| e.id);
        entries
    }
}
