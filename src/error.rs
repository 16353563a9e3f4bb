use thiserror::Error;

/// Errors surfaced by the catalog, chat store and manifest probing.
///
/// The playback engine itself never returns these; session failures are
/// expressed as phase transitions.
#[derive(Debug, Error)]
pub enum Error {
    #[error("event not found: {0}")]
    EventNotFound(String),
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error("catalog error: {0}")]
    Catalog(String),
    #[error("manifest error: {0}")]
    Manifest(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
