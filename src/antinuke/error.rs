use std::time::Duration;

use thiserror::Error;

/// Failure talking to the counter or policy store. Callers fail closed on it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<anyhow::Error> for StoreError {
    fn from(e: anyhow::Error) -> Self {
        StoreError::Backend(format!("{e:#}"))
    }
}

/// Run a store future under a deadline.
pub(crate) async fn bounded<T, F>(limit: Duration, fut: F) -> Result<T, StoreError>
where
    F: std::future::Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}
