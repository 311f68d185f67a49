use std::sync::Arc;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use shared::protocol::{API_PREFIX, MAX_RATING};
use shared::types::{Network, NetworkType, ServiceEntry, ServiceId, ServiceKind};
use crate::config::Config;
use crate::discovery::registry::Insertion;
use crate::discovery_manager::DiscoveryHandle;
use crate::error::DiscoveryError;

#[derive(Clone)]
pub struct AppState {
    pub discovery: DiscoveryHandle,
    pub hash_rx: watch::Receiver<String>,
    pub config: Arc<Config>,
}

#[derive(Serialize)]
pub struct ConfigResponse {
    pub networks: Vec<Network>,
    pub access_throttle_secs: u64,
    pub zero_rating_revival_secs: u64,
    pub max_zero_revivals: u8,
    pub update_interval_secs: u64,
    pub query_interval_secs: u64,
    pub save_interval_secs: u64,
    pub network_available: bool,
}

#[derive(Deserialize)]
pub struct NetworkQuery {
    /// Comma separated network names
    pub network: Option<String>,
}

#[derive(Deserialize)]
pub struct NewService {
    pub url: String,
    pub kind: ServiceKind,
    #[serde(default)]
    pub networks: Vec<Network>,
    #[serde(default)]
    pub rating: Option<u8>,
}

#[derive(Serialize)]
pub struct AddResponse {
    pub id: ServiceId,
    pub merged: bool,
}

#[derive(Serialize)]
pub struct CountResponse {
    pub count: usize,
}

#[derive(Serialize)]
pub struct SaveResponse {
    pub saved: bool,
}

#[derive(Deserialize)]
pub struct RatingUpdate {
    pub rating: u8,
}

#[derive(Deserialize)]
pub struct Availability {
    pub available: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(&format!("{API_PREFIX}/config"), get(get_config))
        .route(&format!("{API_PREFIX}/network"), put(put_network))
        .route(&format!("{API_PREFIX}/services"), get(get_services).post(post_service).delete(delete_services))
        .route(&format!("{API_PREFIX}/services/hash"), get(get_hash))
        .route(&format!("{API_PREFIX}/services/count"), get(get_count))
        .route(&format!("{API_PREFIX}/services/random"), get(get_random))
        .route(&format!("{API_PREFIX}/services/:id"), get(get_service).delete(delete_service))
        .route(&format!("{API_PREFIX}/services/:id/rating"), put(put_rating))
        .route(&format!("{API_PREFIX}/services/:id/query"), post(post_query))
        .route(&format!("{API_PREFIX}/services/:id/update"), post(post_update))
        .route(&format!("{API_PREFIX}/save"), post(post_save))
        .route(&format!("{API_PREFIX}/load"), post(post_load))
        .route(&format!("{API_PREFIX}/defaults"), post(post_defaults))
        .with_state(state)
}

/// Parse "g2,gnutella" into a mask. `None` for an absent filter.
fn parse_networks(filter: Option<&str>) -> Result<Option<NetworkType>, StatusCode> {
    let Some(filter) = filter.filter(|f| !f.trim().is_empty()) else {
        return Ok(None);
    };

    filter
        .split(',')
        .map(|name| Network::parse(name.trim()).ok_or(StatusCode::BAD_REQUEST))
        .collect::<Result<NetworkType, _>>()
        .map(Some)
}

fn error_status(error: &DiscoveryError) -> StatusCode {
    match error {
        DiscoveryError::InvalidUrl(_) => StatusCode::BAD_REQUEST,
        DiscoveryError::KindConflict { .. } => StatusCode::CONFLICT,
        DiscoveryError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn get_config(State(state): State<AppState>) -> Json<ConfigResponse> {
    let discovery = &state.config.discovery;
    Json(ConfigResponse {
        networks: discovery.networks.clone(),
        access_throttle_secs: discovery.access_throttle_secs,
        zero_rating_revival_secs: discovery.zero_rating_revival_secs,
        max_zero_revivals: discovery.max_zero_revivals,
        update_interval_secs: discovery.update_interval_secs,
        query_interval_secs: discovery.query_interval_secs,
        save_interval_secs: discovery.save_interval_secs,
        network_available: state.discovery.is_network_available(),
    })
}

async fn put_network(State(state): State<AppState>, Json(body): Json<Availability>) -> StatusCode {
    tracing::info!("Network marked {}", if body.available { "available" } else { "unavailable" });
    state.discovery.set_network_available(body.available);
    StatusCode::NO_CONTENT
}

async fn get_services(
    State(state): State<AppState>,
    Query(params): Query<NetworkQuery>,
) -> Result<Json<Vec<ServiceEntry>>, StatusCode> {
    let filter = parse_networks(params.network.as_deref())?;
    let mut services = state.discovery.list().await;

    if let Some(filter) = filter {
        services.retain(|s| s.networks.is_network(filter));
    }

    Ok(Json(services))
}

async fn post_service(
    State(state): State<AppState>,
    Json(body): Json<NewService>,
) -> Result<(StatusCode, Json<AddResponse>), StatusCode> {
    let networks: NetworkType = body.networks.into_iter().collect();
    let rating = body.rating.unwrap_or(MAX_RATING).min(MAX_RATING);

    let insertion = state
        .discovery
        .add(&body.url, body.kind, networks, rating)
        .await
        .map_err(|e| error_status(&e))?;

    let response = match insertion {
        Insertion::Added(id) => (StatusCode::CREATED, Json(AddResponse { id, merged: false })),
        Insertion::Merged(id) => (StatusCode::OK, Json(AddResponse { id, merged: true })),
    };
    Ok(response)
}

async fn get_hash(State(state): State<AppState>) -> String {
    state.hash_rx.borrow().clone()
}

async fn get_count(
    State(state): State<AppState>,
    Query(params): Query<NetworkQuery>,
) -> Result<Json<CountResponse>, StatusCode> {
    let filter = parse_networks(params.network.as_deref())?;
    let count = state.discovery.count(filter).await;
    Ok(Json(CountResponse { count }))
}

async fn get_random(
    State(state): State<AppState>,
    Query(params): Query<NetworkQuery>,
) -> Result<Json<ServiceEntry>, StatusCode> {
    let network = parse_networks(params.network.as_deref())?
        .unwrap_or_else(|| state.config.discovery.network_mask());

    state
        .discovery
        .random_service(network)
        .await
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn get_service(
    State(state): State<AppState>,
    Path(id): Path<ServiceId>,
) -> Result<Json<ServiceEntry>, StatusCode> {
    state.discovery.get(id).await.map(Json).ok_or(StatusCode::NOT_FOUND)
}

async fn delete_service(State(state): State<AppState>, Path(id): Path<ServiceId>) -> StatusCode {
    if state.discovery.remove(id).await {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn put_rating(
    State(state): State<AppState>,
    Path(id): Path<ServiceId>,
    Json(body): Json<RatingUpdate>,
) -> StatusCode {
    if state.discovery.set_rating(id, body.rating).await {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn post_query(State(state): State<AppState>, Path(id): Path<ServiceId>) -> StatusCode {
    if state.discovery.get(id).await.is_none() {
        return StatusCode::NOT_FOUND;
    }
    state.discovery.query_service(id);
    StatusCode::ACCEPTED
}

async fn post_update(State(state): State<AppState>, Path(id): Path<ServiceId>) -> StatusCode {
    if state.discovery.get(id).await.is_none() {
        return StatusCode::NOT_FOUND;
    }
    state.discovery.update_service(id);
    StatusCode::ACCEPTED
}

async fn delete_services(State(state): State<AppState>) -> StatusCode {
    state.discovery.clear(true).await;
    StatusCode::NO_CONTENT
}

async fn post_load(State(state): State<AppState>) -> StatusCode {
    state.discovery.load();
    StatusCode::ACCEPTED
}

async fn post_defaults(State(state): State<AppState>) -> StatusCode {
    state.discovery.add_defaults();
    StatusCode::ACCEPTED
}

async fn post_save(State(state): State<AppState>) -> Json<SaveResponse> {
    let saved = state.discovery.save(true).await;
    Json(SaveResponse { saved })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_networks() {
        assert_eq!(parse_networks(None), Ok(None));
        assert_eq!(parse_networks(Some(" ")), Ok(None));
        assert_eq!(parse_networks(Some("g2")), Ok(Some(Network::G2.into())));
        assert_eq!(
            parse_networks(Some("g2, gnutella")),
            Ok(Some(NetworkType::from(Network::G2) | Network::Gnutella.into()))
        );
        assert_eq!(parse_networks(Some("g2,nope")), Err(StatusCode::BAD_REQUEST));
    }

    #[test]
    fn test_error_status() {
        assert_eq!(error_status(&DiscoveryError::InvalidUrl("x".to_string())), StatusCode::BAD_REQUEST);
        assert_eq!(error_status(&DiscoveryError::Unavailable), StatusCode::SERVICE_UNAVAILABLE);
        let conflict = DiscoveryError::KindConflict {
            url: "http://a.example/".to_string(),
            id: 1,
            existing: ServiceKind::Gwc,
            requested: ServiceKind::Uhc,
        };
        assert_eq!(error_status(&conflict), StatusCode::CONFLICT);
    }
}
