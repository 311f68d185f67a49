use std::net::SocketAddr;
use url::Url;
use shared::types::{Network, ServiceKind};
use crate::discovery::network::NetworkAccess;
use crate::discovery::service::DiscoveryService;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Advertise our own address
    Update,
    /// Ask for peer hosts
    Query,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    Queried {
        hosts: Vec<String>,
        /// Further services announced by the one queried
        caches: Vec<String>,
    },
    Updated,
    /// The service kind does not implement the operation
    Unsupported,
    Failed(String),
    Cancelled,
}

/// How this node presents itself to services.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub client_id: String,
    pub version: String,
    /// "ip:port" sent on update; updates are skipped without it
    pub advertised_address: Option<String>,
}

/// Run one operation against a service.
pub async fn perform(
    service: &DiscoveryService,
    operation: Operation,
    network: Network,
    access: &NetworkAccess,
    identity: &ClientIdentity,
) -> RequestOutcome {
    match (service.kind(), operation) {
        (ServiceKind::Gwc, Operation::Query) => gwc_query(service.url(), network, access, identity).await,
        (ServiceKind::Gwc, Operation::Update) => gwc_update(service.url(), network, access, identity).await,
        (ServiceKind::Bootstrap, Operation::Query) => bootstrap_query(service.url(), access).await,
        (kind, operation) => {
            tracing::debug!("{:?} is not supported by {} services", operation, kind);
            RequestOutcome::Unsupported
        }
    }
}

async fn gwc_query(url: &str, network: Network, access: &NetworkAccess, identity: &ClientIdentity) -> RequestOutcome {
    let request = match gwc_request(url, &[("get", "1")], network, identity) {
        Ok(request) => request,
        Err(e) => return RequestOutcome::Failed(e),
    };

    match access.get_text(&request).await {
        Ok(body) => {
            let response = parse_gwc_response(&body);
            if let Some(error) = response.error {
                RequestOutcome::Failed(error)
            } else if response.hosts.is_empty() && response.caches.is_empty() {
                RequestOutcome::Failed("no hosts returned".to_string())
            } else {
                RequestOutcome::Queried {
                    hosts: response.hosts,
                    caches: response.caches,
                }
            }
        }
        Err(e) => RequestOutcome::Failed(format!("{:#}", e)),
    }
}

async fn gwc_update(url: &str, network: Network, access: &NetworkAccess, identity: &ClientIdentity) -> RequestOutcome {
    let Some(address) = identity.advertised_address.as_deref() else {
        tracing::debug!("No advertised address configured, skipping update of {}", url);
        return RequestOutcome::Unsupported;
    };

    let request = match gwc_request(url, &[("update", "1"), ("ip", address)], network, identity) {
        Ok(request) => request,
        Err(e) => return RequestOutcome::Failed(e),
    };

    match access.get_text(&request).await {
        Ok(body) => {
            let response = parse_gwc_response(&body);
            match (response.error, response.update_ok) {
                (Some(error), _) => RequestOutcome::Failed(error),
                (None, true) => RequestOutcome::Updated,
                (None, false) => RequestOutcome::Failed("update not acknowledged".to_string()),
            }
        }
        Err(e) => RequestOutcome::Failed(format!("{:#}", e)),
    }
}

async fn bootstrap_query(url: &str, access: &NetworkAccess) -> RequestOutcome {
    match access.get_text(url).await {
        Ok(body) => {
            let hosts = parse_host_list(&body);
            if hosts.is_empty() {
                RequestOutcome::Failed("no hosts returned".to_string())
            } else {
                RequestOutcome::Queried { hosts, caches: Vec::new() }
            }
        }
        Err(e) => RequestOutcome::Failed(format!("{:#}", e)),
    }
}

fn gwc_request(
    url: &str,
    params: &[(&str, &str)],
    network: Network,
    identity: &ClientIdentity,
) -> Result<String, String> {
    let mut request = Url::parse(url).map_err(|e| format!("{}: {}", url, e))?;
    {
        let mut query = request.query_pairs_mut();
        for (key, value) in params {
            query.append_pair(key, value);
        }
        query
            .append_pair("net", network.gwc_name())
            .append_pair("client", &identity.client_id)
            .append_pair("version", &identity.version);
    }
    Ok(request.into())
}

#[derive(Debug, Default, PartialEq)]
pub struct GwcResponse {
    pub hosts: Vec<String>,
    pub caches: Vec<String>,
    pub update_ok: bool,
    pub error: Option<String>,
}

/// Parse a GWebCache v2 reply ("H|host|age", "U|url|age", "I|update|OK", ...).
pub fn parse_gwc_response(body: &str) -> GwcResponse {
    let mut response = GwcResponse::default();

    for line in body.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if line.to_ascii_uppercase().starts_with("ERROR") {
            response.error.get_or_insert_with(|| line.to_string());
            continue;
        }

        let fields: Vec<&str> = line.split('|').collect();
        match (fields[0].to_ascii_lowercase().as_str(), fields.get(1)) {
            ("h", Some(host)) => response.hosts.push(host.to_string()),
            ("u", Some(cache)) => response.caches.push(cache.to_string()),
            ("i", Some(&"update")) => match fields.get(2).map(|s| s.to_ascii_uppercase()) {
                Some(status) if status.starts_with("OK") || status.starts_with("WARNING") => {
                    response.update_ok = true;
                }
                Some(status) => {
                    response.error.get_or_insert(format!("update rejected: {}", status));
                }
                None => {}
            },
            ("ok", None) => response.update_ok = true,
            _ => {}
        }
    }

    response
}

/// One "ip:port" per line; everything else is skipped.
pub fn parse_host_list(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|line| line.trim().parse::<SocketAddr>().ok())
        .map(|addr| addr.to_string())
        .collect()
}
