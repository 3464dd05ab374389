use thiserror::Error;

/// Failures of a [`ChainDataSource`](crate::traits::ChainDataSource).
///
/// A height or hash the remote node simply does not know is not an error; sources report it as
/// `Ok(None)`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DataSourceError {
    #[error("Transport failure: {0}")]
    Transport(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Unexpected data source error: {0}")]
    Unknown(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NotificationError {
    #[error("Failed to subscribe to topic {0}: {1}")]
    SubscribeError(String, String),
    #[error("Notification channel closed")]
    Closed,
}
