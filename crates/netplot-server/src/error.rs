//! Error taxonomy for the ingestion server.

use smol_str::SmolStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetplotError {
    /// Command issued out of sequence or with malformed syntax.
    #[error("{0}")]
    Protocol(SmolStr),
    /// Command well-formed but rejected (capacity, unknown graph type).
    #[error("{0}")]
    Validation(SmolStr),
    #[error("invalid config: {0}")]
    InvalidConfig(SmolStr),
    #[error("failed to bind TCP port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("persistence: {0}")]
    Persistence(SmolStr),
    #[error("persistence service stopped")]
    ServiceStopped,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl NetplotError {
    /// Faults that terminate the connection they occurred on.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Validation(_))
    }

    pub(crate) fn protocol(message: impl Into<SmolStr>) -> Self {
        Self::Protocol(message.into())
    }

    pub(crate) fn validation(message: impl Into<SmolStr>) -> Self {
        Self::Validation(message.into())
    }
}
