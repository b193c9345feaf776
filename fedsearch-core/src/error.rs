use thiserror::Error;

/// Errors raised while constructing or validating shared data-model types.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("search result title must not be empty")]
    EmptyTitle,
}
