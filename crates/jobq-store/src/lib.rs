mod rocks;
mod store;

pub use rocks::{RecordBackend, RocksBackend};
pub use store::{JobStore, JobStoreConfig};

use jobq_core::{DispatchError, JobId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("RocksDB error: {0}")]
    RocksDbError(#[from] rocksdb::Error),

    #[error("Job error: {0}")]
    JobError(#[from] DispatchError),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

impl From<StoreError> for DispatchError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::JobError(inner) => inner,
            StoreError::JobNotFound(id) => DispatchError::NotFound(id),
            other => DispatchError::Storage(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
