use std::io::{self, Read, Write};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use url::Url;
use shared::protocol::{DISCOVERY_CODE_VERSION, MAX_RATING};
use shared::types::{NetworkType, ServiceEntry, ServiceId, ServiceKind};
use crate::discovery::protocol::RequestOutcome;
use crate::error::DiscoveryError;

/// Longest URL accepted when reading a record back
const MAX_URL_LEN: u32 = 4096;

/// Timing and ban limits applied to every service.
#[derive(Debug, Clone)]
pub struct ServicePolicy {
    pub access_throttle_secs: i64,
    pub revival_interval_secs: i64,
    pub max_zero_revivals: u8,
}

impl Default for ServicePolicy {
    fn default() -> Self {
        Self {
            access_throttle_secs: 3600,
            revival_interval_secs: 86400,
            max_zero_revivals: 3,
        }
    }
}

/// Validate a URL and bring it into the form used for duplicate detection.
pub fn normalize_url(raw: &str) -> Result<String, DiscoveryError> {
    let url = Url::parse(raw.trim()).map_err(|_| DiscoveryError::InvalidUrl(raw.to_string()))?;
    Ok(url.as_str().to_lowercase())
}

/// Everything that is persisted about a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    /// 0 until the registry assigns one
    pub id: ServiceId,
    pub url: String,
    pub kind: ServiceKind,
    pub networks: NetworkType,
    pub rating: u8,
    pub banned: bool,
    /// Unix seconds, 0 = never
    pub last_queried: i64,
    pub last_success: i64,
    pub failures: u32,
    pub zero_revivals: u8,
}

impl ServiceRecord {
    pub fn new(url: String, kind: ServiceKind, networks: NetworkType, rating: u8) -> Self {
        Self {
            id: 0,
            url,
            kind,
            networks,
            rating,
            banned: false,
            last_queried: 0,
            last_success: 0,
            failures: 0,
            zero_revivals: 0,
        }
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32::<BigEndian>(self.id)?;
        w.write_u8(self.kind.as_u8())?;
        w.write_u16::<BigEndian>(self.networks.bits())?;
        w.write_u8(self.rating)?;
        w.write_u8(self.banned as u8)?;
        w.write_i64::<BigEndian>(self.last_queried)?;
        w.write_i64::<BigEndian>(self.last_success)?;
        w.write_u32::<BigEndian>(self.failures)?;
        w.write_u8(self.zero_revivals)?;
        w.write_u32::<BigEndian>(self.url.len() as u32)?;
        w.write_all(self.url.as_bytes())
    }

    pub fn read_from<R: Read>(r: &mut R, version: u16) -> io::Result<Self> {
        if version == 0 || version > DISCOVERY_CODE_VERSION {
            return Err(invalid(format!("unsupported record version {}", version)));
        }

        let id = r.read_u32::<BigEndian>()?;
        let kind = r.read_u8()?;
        let kind = ServiceKind::from_u8(kind)
            .ok_or_else(|| invalid(format!("unknown service kind {}", kind)))?;
        let networks = NetworkType::from_bits(r.read_u16::<BigEndian>()?);
        let rating = r.read_u8()?;
        let banned = r.read_u8()? != 0;
        let last_queried = r.read_i64::<BigEndian>()?;
        let last_success = r.read_i64::<BigEndian>()?;
        let failures = r.read_u32::<BigEndian>()?;
        let zero_revivals = r.read_u8()?;

        let url_len = r.read_u32::<BigEndian>()?;
        if url_len > MAX_URL_LEN {
            return Err(invalid(format!("URL length {} exceeds limit", url_len)));
        }
        let mut url = vec![0u8; url_len as usize];
        r.read_exact(&mut url)?;
        let url = String::from_utf8(url).map_err(|e| invalid(e.to_string()))?;

        Ok(Self {
            id,
            url,
            kind,
            networks,
            rating,
            banned,
            last_queried,
            last_success,
            failures,
            zero_revivals,
        })
    }
}

fn invalid(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

#[derive(Debug)]
struct ServiceState {
    networks: NetworkType,
    rating: u8,
    banned: bool,
    running: bool,
    last_queried: i64,
    last_success: i64,
    failures: u32,
    zero_revivals: u8,
}

/// Outcome of checking a service for random selection.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Eligibility {
    /// Selection weight if the service is a candidate
    pub weight: Option<u8>,
    /// The service was brought back from a zero rating
    pub revived: bool,
}

/// One discovery endpoint. Shared between the registry and in-flight requests.
#[derive(Debug)]
pub struct DiscoveryService {
    id: ServiceId,
    url: String,
    kind: ServiceKind,
    state: RwLock<ServiceState>,
    request: Mutex<Option<CancellationToken>>,
}

impl DiscoveryService {
    pub fn from_record(id: ServiceId, record: ServiceRecord) -> Self {
        Self {
            id,
            url: record.url,
            kind: record.kind,
            state: RwLock::new(ServiceState {
                networks: record.networks,
                rating: record.rating,
                banned: record.banned,
                running: false,
                last_queried: record.last_queried,
                last_success: record.last_success,
                failures: record.failures,
                zero_revivals: record.zero_revivals,
            }),
            request: Mutex::new(None),
        }
    }

    pub fn id(&self) -> ServiceId {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn kind(&self) -> ServiceKind {
        self.kind
    }

    pub fn networks(&self) -> NetworkType {
        self.state.read().networks
    }

    pub fn rating(&self) -> u8 {
        self.state.read().rating
    }

    pub fn add_networks(&self, networks: NetworkType) {
        self.state.write().networks.set_network(networks);
    }

    pub fn set_rating(&self, rating: u8) {
        self.state.write().rating = rating;
    }

    /// Counts towards the working services of `network`.
    pub fn is_working(&self, network: NetworkType) -> bool {
        let state = self.state.read();
        state.networks.is_network(network) && !state.banned && state.rating > 0
    }

    /// Check whether the service can be picked for `network` at `now`,
    /// reviving it in place if it has been dormant long enough.
    pub fn eligibility(&self, network: NetworkType, now: i64, policy: &ServicePolicy) -> Eligibility {
        let mut state = self.state.write();
        let mut result = Eligibility::default();

        if state.banned || !state.networks.is_network(network) {
            return result;
        }

        let idle = now - state.last_queried;

        if state.rating == 0 {
            if idle < policy.revival_interval_secs {
                return result;
            }
            state.rating = MAX_RATING;
            state.zero_revivals = state.zero_revivals.saturating_add(1);
            result.revived = true;
            tracing::debug!("Reviving discovery service {} ({} revivals)", self.url, state.zero_revivals);
        }

        if idle >= policy.access_throttle_secs && !state.running {
            result.weight = Some(state.rating);
        }

        result
    }

    /// Mark the service as running. Returns `None` if a request is already in flight.
    pub fn begin_request(&self, now: i64) -> Option<CancellationToken> {
        {
            let mut state = self.state.write();
            if state.running {
                return None;
            }
            state.running = true;
            state.last_queried = now;
        }

        let token = CancellationToken::new();
        *self.request.lock() = Some(token.clone());
        Some(token)
    }

    /// Abort the in-flight request, if any. Safe to call repeatedly.
    pub fn cancel_request(&self) {
        if let Some(token) = self.request.lock().take() {
            token.cancel();
        }
    }

    /// Apply the result of a request to rating, failure count and ban state.
    pub fn finish_request(&self, outcome: &RequestOutcome, now: i64, policy: &ServicePolicy) {
        // Released before `running` so a follow-up request keeps its token
        *self.request.lock() = None;

        {
            let mut state = self.state.write();
            state.running = false;

            match outcome {
                RequestOutcome::Queried { .. } | RequestOutcome::Updated => {
                    state.failures = 0;
                    state.last_success = now;
                    if state.rating < MAX_RATING {
                        state.rating += 1;
                    }
                }
                RequestOutcome::Failed(reason) => {
                    state.failures = state.failures.saturating_add(1);
                    state.rating = state.rating.saturating_sub(1);
                    tracing::warn!("Discovery service {} failed: {}", self.url, reason);

                    if state.rating == 0 && state.zero_revivals >= policy.max_zero_revivals {
                        state.banned = true;
                        tracing::warn!(
                            "Banning discovery service {} after {} revivals",
                            self.url,
                            state.zero_revivals
                        );
                    }
                }
                RequestOutcome::Unsupported | RequestOutcome::Cancelled => {}
            }
        }
    }

    pub fn record(&self) -> ServiceRecord {
        let state = self.state.read();
        ServiceRecord {
            id: self.id,
            url: self.url.clone(),
            kind: self.kind,
            networks: state.networks,
            rating: state.rating,
            banned: state.banned,
            last_queried: state.last_queried,
            last_success: state.last_success,
            failures: state.failures,
            zero_revivals: state.zero_revivals,
        }
    }

    pub fn entry(&self) -> ServiceEntry {
        let state = self.state.read();
        ServiceEntry {
            id: self.id,
            url: self.url.clone(),
            kind: self.kind,
            networks: state.networks,
            rating: state.rating,
            banned: state.banned,
            running: state.running,
            last_queried: timestamp(state.last_queried),
            last_success: timestamp(state.last_success),
            failures: state.failures,
            zero_revivals: state.zero_revivals,
        }
    }
}

impl PartialEq for DiscoveryService {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.kind == other.kind && self.url == other.url
    }
}

fn timestamp(secs: i64) -> Option<DateTime<Utc>> {
    if secs <= 0 {
        return None;
    }
    DateTime::from_timestamp(secs, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::types::Network;

    fn g2() -> NetworkType {
        Network::G2.into()
    }

    fn test_service(rating: u8) -> DiscoveryService {
        let record = ServiceRecord::new("http://cache.example.com/gwc.php".to_string(), ServiceKind::Gwc, g2(), rating);
        DiscoveryService::from_record(1, record)
    }

    #[test]
    fn test_normalize_url() {
        assert_eq!(
            normalize_url(" HTTP://Cache.Example.COM/GWC.php ").unwrap(),
            "http://cache.example.com/gwc.php"
        );
        assert!(matches!(normalize_url("not a url"), Err(DiscoveryError::InvalidUrl(_))));
        assert!(normalize_url("").is_err());
    }

    #[test]
    fn test_record_survives_serialization() {
        let mut record = ServiceRecord::new("uhc:host.example.net:6346".to_string(), ServiceKind::Uhc, g2(), 3);
        record.id = 17;
        record.banned = true;
        record.last_queried = 1_700_000_000;
        record.failures = 2;

        let mut buf = Vec::new();
        record.write_to(&mut buf).unwrap();
        let restored = ServiceRecord::read_from(&mut buf.as_slice(), DISCOVERY_CODE_VERSION).unwrap();

        assert_eq!(restored, record);
    }

    #[test]
    fn test_record_rejects_unknown_version_and_truncation() {
        let record = ServiceRecord::new("http://a.example/".to_string(), ServiceKind::Gwc, g2(), 1);
        let mut buf = Vec::new();
        record.write_to(&mut buf).unwrap();

        assert!(ServiceRecord::read_from(&mut buf.as_slice(), DISCOVERY_CODE_VERSION + 1).is_err());
        assert!(ServiceRecord::read_from(&mut &buf[..buf.len() - 3], DISCOVERY_CODE_VERSION).is_err());
    }

    #[test]
    fn test_begin_request_is_exclusive() {
        let service = test_service(3);

        let token = service.begin_request(100).expect("first request should start");
        assert!(service.entry().running);
        assert!(service.begin_request(101).is_none());

        service.cancel_request();
        assert!(token.is_cancelled());
        service.cancel_request();

        service.finish_request(&RequestOutcome::Cancelled, 102, &ServicePolicy::default());
        assert!(!service.entry().running);
        assert_eq!(service.record().last_queried, 100);
    }

    #[test]
    fn test_cancel_without_request_is_noop() {
        let service = test_service(3);
        service.cancel_request();
        assert!(!service.entry().running);
    }

    #[test]
    fn test_success_bumps_rating_up_to_max() {
        let service = test_service(MAX_RATING - 1);
        let policy = ServicePolicy::default();

        for _ in 0..3 {
            service.begin_request(10);
            service.finish_request(&RequestOutcome::Updated, 11, &policy);
        }

        assert_eq!(service.rating(), MAX_RATING);
        assert_eq!(service.record().last_success, 11);
    }

    #[test]
    fn test_repeated_failures_ban_after_revivals() {
        let service = test_service(1);
        let policy = ServicePolicy { max_zero_revivals: 1, ..ServicePolicy::default() };

        service.begin_request(10);
        service.finish_request(&RequestOutcome::Failed("timeout".into()), 11, &policy);
        assert_eq!(service.rating(), 0);
        assert!(!service.entry().banned, "No revivals yet, should stay dormant");

        let later = 10 + policy.revival_interval_secs;
        let eligibility = service.eligibility(g2(), later, &policy);
        assert!(eligibility.revived);
        assert_eq!(eligibility.weight, Some(MAX_RATING));

        for _ in 0..MAX_RATING {
            assert!(!service.entry().banned);
            service.begin_request(later);
            service.finish_request(&RequestOutcome::Failed("timeout".into()), later, &policy);
        }
        assert!(service.entry().banned);
        assert_eq!(service.record().failures, 1 + u32::from(MAX_RATING));
    }

    #[test]
    fn test_eligibility_respects_throttle_and_network() {
        let service = test_service(2);
        let policy = ServicePolicy::default();
        service.begin_request(1000);
        service.finish_request(&RequestOutcome::Updated, 1000, &policy);

        assert_eq!(service.eligibility(g2(), 1001, &policy).weight, None);
        assert_eq!(service.eligibility(g2(), 1000 + policy.access_throttle_secs, &policy).weight, Some(3));
        assert_eq!(
            service.eligibility(Network::EDonkey.into(), 1000 + policy.access_throttle_secs, &policy),
            Eligibility::default()
        );
    }

    #[test]
    fn test_equality_and_entry() {
        let a = test_service(2);
        let b = test_service(4);
        assert_eq!(a, b, "Rating is not part of identity");

        let entry = a.entry();
        assert_eq!(entry.id, 1);
        assert_eq!(entry.kind, ServiceKind::Gwc);
        assert!(entry.last_queried.is_none());
    }
}
