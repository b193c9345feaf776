//! The global buffer manager (C6) and delayed batch writer (C7) that
//! together realize deferred, batched disk writes for the two-level cache.

pub mod buffer;
pub mod error;
pub mod writer;

pub use buffer::{Buffer, BufferManager, BufferManagerConfig};
pub use error::WriterError;
pub use writer::{AdmissionRequest, DelayedBatchWriter, WriterState};
