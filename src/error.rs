use thiserror::Error;

use crate::config::ConfigurationError;
use crate::messaging::MessagingError;

/// Top-level worker error
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkerError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Messaging error: {0}")]
    Messaging(#[from] MessagingError),

    #[error("Failed to initialize consumer session on queue {queue}")]
    Initialization { queue: String },
}

impl WorkerError {
    pub fn initialization(queue: impl Into<String>) -> Self {
        Self::Initialization {
            queue: queue.into(),
        }
    }
}

pub type WorkerResult<T> = Result<T, WorkerError>;
