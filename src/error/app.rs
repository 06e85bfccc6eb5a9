use thiserror::Error;

use super::{
    BrokerError, ConfigError, CoordinationError, MetricsError, ProtocolError, WorkloadError,
};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
    #[error("TOML error: {source}")]
    Toml {
        #[from]
        source: toml::de::Error,
    },
    #[error("Join error: {source}")]
    Join {
        #[from]
        source: tokio::task::JoinError,
    },
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),
    #[error("Coordination error: {0}")]
    Coordination(#[from] CoordinationError),
    #[error("Metrics error: {0}")]
    Metrics(#[from] MetricsError),
    #[error("Workload error: {0}")]
    Workload(#[from] WorkloadError),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn config<E>(error: E) -> Self
    where
        E: Into<ConfigError>,
    {
        error.into().into()
    }

    pub fn protocol<E>(error: E) -> Self
    where
        E: Into<ProtocolError>,
    {
        error.into().into()
    }

    pub fn broker<E>(error: E) -> Self
    where
        E: Into<BrokerError>,
    {
        error.into().into()
    }

    pub fn coordination<E>(error: E) -> Self
    where
        E: Into<CoordinationError>,
    {
        error.into().into()
    }

    pub fn metrics<E>(error: E) -> Self
    where
        E: Into<MetricsError>,
    {
        error.into().into()
    }

    pub fn workload<E>(error: E) -> Self
    where
        E: Into<WorkloadError>,
    {
        error.into().into()
    }

    /// Returns the coordination error wrapped by this value, if any.
    #[must_use]
    pub const fn as_coordination(&self) -> Option<&CoordinationError> {
        match self {
            AppError::Coordination(err) => Some(err),
            AppError::Io { .. }
            | AppError::Json { .. }
            | AppError::Toml { .. }
            | AppError::Join { .. }
            | AppError::Config(_)
            | AppError::Protocol(_)
            | AppError::Broker(_)
            | AppError::Metrics(_)
            | AppError::Workload(_) => None,
        }
    }
}
