use thiserror::Error;

/// `Search` itself returns `anyhow::Result<SearchResponse>` for the small
/// set of truly exceptional conditions; internal per-provider failures are
/// logged and contribute an empty result set rather than propagating.
#[derive(Debug, Error)]
pub enum SearchError {
    #[error("cache layer unavailable: {0}")]
    CacheUnavailable(String),

    #[error("no providers matched the request")]
    NoProvidersMatched,
}
