use thiserror::Error;

#[derive(Debug, Error)]
pub enum WriterError {
    #[error("batch writer admission channel is full")]
    ChannelFull,

    #[error("no buffer registered for id {0}")]
    BufferNotFound(String),

    #[error("shutdown did not complete within the timeout")]
    ShutdownTimeout,

    #[error("writer is already running")]
    AlreadyRunning,

    #[error("writer is not running")]
    NotRunning,
}
