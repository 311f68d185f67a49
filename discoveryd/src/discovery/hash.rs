use serde::Serialize;
use sha2::{Sha256, Digest};
use shared::types::{NetworkType, ServiceEntry, ServiceId, ServiceKind};

/// Fields that describe the service list. Request bookkeeping is left out.
#[derive(Serialize)]
struct HashView<'a> {
    id: ServiceId,
    url: &'a str,
    kind: ServiceKind,
    networks: NetworkType,
    rating: u8,
    banned: bool,
}

/// Computes a SHA-256 fingerprint of the service list.
/// Entries are sorted by id for deterministic output.
pub fn compute_hash(services: &[ServiceEntry]) -> String {
    let mut indices: Vec<usize> = (0..services.len()).collect();
    indices.sort_by_key(|&i| services[i].id);

    let mut hasher = Sha256::new();
    for view in indices.iter().map(|&i| {
        let s = &services[i];
        HashView {
            id: s.id,
            url: &s.url,
            kind: s.kind,
            networks: s.networks,
            rating: s.rating,
            banned: s.banned,
        }
    }) {
        // Serializing these plain fields cannot fail
        if let Ok(json) = serde_json::to_vec(&view) {
            hasher.update(&json);
            hasher.update(b"\n");
        }
    }

    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use shared::types::Network;

    fn test_entry(id: ServiceId, url: &str) -> ServiceEntry {
        ServiceEntry {
            id,
            url: url.to_string(),
            kind: ServiceKind::Gwc,
            networks: Network::G2.into(),
            rating: 3,
            banned: false,
            running: false,
            last_queried: None,
            last_success: None,
            failures: 0,
            zero_revivals: 0,
        }
    }

    #[test]
    fn test_fingerprint_ignores_service_order() {
        let entry1 = test_entry(1, "http://a.example/");
        let entry2 = test_entry(2, "http://b.example/");

        let hash1 = compute_hash(&[entry1.clone(), entry2.clone()]);
        let hash2 = compute_hash(&[entry2, entry1]);

        assert_eq!(hash1, hash2, "Service order must not change the fingerprint");
    }

    #[test]
    fn test_hash_changes_on_modification() {
        let entry1 = test_entry(1, "http://a.example/");
        let mut entry2 = entry1.clone();
        entry2.rating = 0;

        assert_ne!(compute_hash(&[entry1]), compute_hash(&[entry2]), "Hash should change when rating changes");
    }

    #[test]
    fn test_hash_stable_across_request_bookkeeping() {
        let entry1 = test_entry(1, "http://a.example/");
        let mut entry2 = entry1.clone();
        entry2.running = true;
        entry2.last_queried = Some(Utc::now());
        entry2.failures = 4;

        assert_eq!(compute_hash(&[entry1]), compute_hash(&[entry2]), "Hash should ignore request bookkeeping");
    }
}
