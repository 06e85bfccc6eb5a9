//! Fleet configuration loading.
mod loader;
pub mod types;


pub use loader::load_config;
pub use types::{AgentConfig, BrokerConfig, CoordinatorConfig, FleetConfig, TestPlanConfig, WorkerConfig};

#[cfg(test)]
pub(crate) use loader::load_config_file;
