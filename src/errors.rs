//! Error types for the keyed pool

use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Boxed error produced by a fallible connection factory or disposer.
pub type BoxError = Box<dyn StdError + Send + Sync>;

#[derive(Error, Debug, Clone)]
pub enum PoolError {
    #[error("Waited {0:?} for a connection")]
    Timeout(Duration),

    #[error("Pool is shutting down")]
    PoolShuttingDown,

    #[error("No connections are checked out")]
    NotCheckedOut,

    #[error("Connection is mutably borrowed on this thread")]
    ConnectionInUse,

    #[error("Connection factory failed: {0}")]
    Factory(#[source] Arc<dyn StdError + Send + Sync>),

    #[error("Connection disposer failed: {0}")]
    Dispose(#[source] Arc<dyn StdError + Send + Sync>),
}

impl PoolError {
    pub(crate) fn factory(err: BoxError) -> Self {
        PoolError::Factory(Arc::from(err))
    }

    pub(crate) fn dispose(err: BoxError) -> Self {
        PoolError::Dispose(Arc::from(err))
    }

    /// Whether this is a [`PoolError::Timeout`]
    pub fn is_timeout(&self) -> bool {
        matches!(self, PoolError::Timeout(_))
    }
}

pub type PoolResult<T> = Result<T, PoolError>;
