use shared::types::{ServiceId, ServiceKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("invalid discovery service URL: {0}")]
    InvalidUrl(String),

    /// The same URL is already registered under another kind
    #[error("{url} is already registered as {existing} (id {id}), refusing to add it as {requested}")]
    KindConflict {
        url: String,
        id: ServiceId,
        existing: ServiceKind,
        requested: ServiceKind,
    },

    #[error("discovery manager is not running")]
    Unavailable,
}
