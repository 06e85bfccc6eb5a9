//! Middle tier of the fleet: relays between the coordinator and the workers
//! of one host and reports workers it loses.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::broker::{Broker, BrokerOptions, ChildLossHook};
use crate::error::AppResult;
use crate::processor::{LocalExceptionLogger, NodeRole, OperationProcessor};
use crate::protocol::{
    FailureOperation, FailureType, ResponseType, SimulatorAddress, SimulatorOperation,
};

/// Reports every lost worker to the coordinator as `NODE_LOST`.
struct WorkerLossReporter;

#[async_trait]
impl ChildLossHook for WorkerLossReporter {
    async fn on_child_lost(&self, broker: &Broker, child: &SimulatorAddress, reason: &str) {
        let failure = SimulatorOperation::Failure(FailureOperation::new(
            None,
            *child,
            FailureType::NodeLost,
            format!("worker connection lost: {}", reason),
        ));
        let response = broker.send(&SimulatorAddress::root(), &failure).await;
        if response != ResponseType::Success {
            warn!(
                "Could not report loss of {} to the coordinator: {}",
                child, response
            );
        }
    }
}

pub struct Agent {
    broker: Broker,
}

impl Agent {
    /// # Errors
    ///
    /// Returns an error when `index` is zero.
    pub fn new(index: u32, options: BrokerOptions) -> AppResult<Self> {
        let address = SimulatorAddress::agent(index)?;
        let logger = Arc::new(LocalExceptionLogger::new());
        let processor = OperationProcessor::builder(NodeRole::Agent, logger)
            .bind_exception_logging()
            .build();
        let broker = Broker::new(address, Arc::new(processor), options);
        broker.add_child_loss_hook(Arc::new(WorkerLossReporter));
        Ok(Self { broker })
    }

    #[must_use]
    pub fn address(&self) -> SimulatorAddress {
        self.broker.address()
    }

    #[must_use]
    pub const fn broker(&self) -> &Broker {
        &self.broker
    }

    /// # Errors
    ///
    /// Returns an error when `bind_addr` cannot be bound.
    pub async fn listen(&self, bind_addr: &str) -> AppResult<SocketAddr> {
        self.broker.listen(bind_addr).await
    }

    /// # Errors
    ///
    /// Returns an error when the coordinator cannot be reached or rejects
    /// this agent.
    pub async fn connect(&self, coordinator_addr: &str) -> AppResult<()> {
        self.broker.connect_parent(coordinator_addr).await?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error when fewer than `min_workers` workers join in time.
    pub async fn wait_for_workers(&self, min_workers: usize, wait: Duration) -> AppResult<()> {
        self.broker.wait_for_children(min_workers, wait).await
    }

    /// Serves until the coordinator goes away, then shuts down.
    pub async fn run(&self) {
        self.broker.parent_closed().await;
        info!("{} lost its coordinator; shutting down", self.address());
        self.broker.shutdown();
    }

    pub fn shutdown(&self) {
        self.broker.shutdown();
    }
}
