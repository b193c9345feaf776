use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("disk I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    #[error("failed to serialize cache entry: {0}")]
    Serialization(String),

    #[error("failed to deserialize cache entry: {0}")]
    Deserialization(String),
}
