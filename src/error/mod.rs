mod app;
mod broker;
mod config;
mod coordination;
mod metrics;
mod protocol;
mod workload;

#[cfg(test)]
mod test_support;

pub use app::{AppError, AppResult};
pub use broker::BrokerError;
pub use config::ConfigError;
pub use coordination::CoordinationError;
pub use metrics::MetricsError;
pub use protocol::ProtocolError;
pub use workload::WorkloadError;
