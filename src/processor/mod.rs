//! Uniform operation dispatch shared by every node role.
//!
//! A node is specialised by the table of `OperationType -> handler` bindings
//! it is built with. The dispatcher itself holds no state beyond that table:
//! it never lets a handler error or panic escape, turning both into
//! [`ResponseType::ExceptionDuringOperationExecution`] plus an entry in the
//! node's [`LocalExceptionLogger`].
mod exception_log;


use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use crate::error::{AppError, AppResult, CoordinationError};
use crate::protocol::{
    OperationType, ResponseType, SimulatorAddress, SimulatorOperation, WireOperation,
};

pub use exception_log::{LocalExceptionLogger, LoggedException};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeRole {
    Coordinator,
    Agent,
    Worker,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NodeRole::Coordinator => "coordinator",
            NodeRole::Agent => "agent",
            NodeRole::Worker => "worker",
        })
    }
}

/// Which coordinator handler set to install.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum DispatchProfile {
    /// Exceptions, phase completions, performance, histograms and failures.
    #[default]
    Full,
    /// Exceptions only.
    Minimal,
}

pub trait OperationHandler: Send + Sync {
    /// Handles one decoded operation.
    ///
    /// # Errors
    ///
    /// Any error is contained by the dispatcher and reported as
    /// `EXCEPTION_DURING_OPERATION_EXECUTION`.
    fn handle(
        &self,
        operation: &SimulatorOperation,
        source: &SimulatorAddress,
    ) -> AppResult<ResponseType>;
}

impl<F> OperationHandler for F
where
    F: Fn(&SimulatorOperation, &SimulatorAddress) -> AppResult<ResponseType> + Send + Sync,
{
    fn handle(
        &self,
        operation: &SimulatorOperation,
        source: &SimulatorAddress,
    ) -> AppResult<ResponseType> {
        self(operation, source)
    }
}

pub struct OperationProcessor {
    role: NodeRole,
    handlers: HashMap<OperationType, Arc<dyn OperationHandler>>,
    exception_logger: Arc<LocalExceptionLogger>,
}

impl OperationProcessor {
    #[must_use]
    pub fn builder(role: NodeRole, exception_logger: Arc<LocalExceptionLogger>) -> DispatchTable {
        DispatchTable {
            role,
            handlers: HashMap::new(),
            exception_logger,
        }
    }

    #[must_use]
    pub const fn role(&self) -> NodeRole {
        self.role
    }

    #[must_use]
    pub fn supports(&self, operation_type: OperationType) -> bool {
        self.handlers.contains_key(&operation_type)
    }

    #[must_use]
    pub fn supported_types(&self) -> Vec<OperationType> {
        let mut types: Vec<OperationType> = self.handlers.keys().copied().collect();
        types.sort();
        types
    }

    #[must_use]
    pub fn exception_logger(&self) -> &Arc<LocalExceptionLogger> {
        &self.exception_logger
    }

    /// Dispatches one operation and reports exactly one response code.
    pub fn process(
        &self,
        operation_type: OperationType,
        operation: &SimulatorOperation,
        source: &SimulatorAddress,
    ) -> ResponseType {
        let Some(handler) = self.handlers.get(&operation_type) else {
            debug!(
                "{} processor does not support {} from {}",
                self.role, operation_type, source
            );
            return ResponseType::UnsupportedOperationOnThisProcessor;
        };

        match catch_unwind(AssertUnwindSafe(|| handler.handle(operation, source))) {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                self.exception_logger.log_dispatch_error(
                    Some(operation_type),
                    source,
                    err.to_string(),
                );
                ResponseType::ExceptionDuringOperationExecution
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|text| (*text).to_owned())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "handler panicked".to_owned());
                self.exception_logger.log_dispatch_error(
                    Some(operation_type),
                    source,
                    format!("handler panicked: {}", message),
                );
                ResponseType::ExceptionDuringOperationExecution
            }
        }
    }

    /// Dispatches an operation by its own discriminant.
    pub fn dispatch(
        &self,
        operation: &SimulatorOperation,
        source: &SimulatorAddress,
    ) -> ResponseType {
        self.process(operation.operation_type(), operation, source)
    }

    /// Decodes and dispatches a wire operation.
    ///
    /// Unknown discriminants are unsupported by definition; malformed payloads
    /// of known ones are dispatch errors.
    pub fn dispatch_wire(&self, wire: &WireOperation, source: &SimulatorAddress) -> ResponseType {
        let operation_type = match wire.operation_type() {
            Ok(operation_type) => operation_type,
            Err(err) => {
                debug!("{} processor cannot decode operation: {}", self.role, err);
                return ResponseType::UnsupportedOperationOnThisProcessor;
            }
        };
        if !self.supports(operation_type) {
            debug!(
                "{} processor does not support {} from {}",
                self.role, operation_type, source
            );
            return ResponseType::UnsupportedOperationOnThisProcessor;
        }
        match SimulatorOperation::decode(wire) {
            Ok(operation) => self.process(operation_type, &operation, source),
            Err(err) => {
                self.exception_logger.log_dispatch_error(
                    Some(operation_type),
                    source,
                    err.to_string(),
                );
                ResponseType::ExceptionDuringOperationExecution
            }
        }
    }
}

/// Builder of the discriminant -> handler table for one node role.
pub struct DispatchTable {
    role: NodeRole,
    handlers: HashMap<OperationType, Arc<dyn OperationHandler>>,
    exception_logger: Arc<LocalExceptionLogger>,
}

impl DispatchTable {
    #[must_use]
    pub fn bind<H>(mut self, operation_type: OperationType, handler: H) -> Self
    where
        H: OperationHandler + 'static,
    {
        self.handlers.insert(operation_type, Arc::new(handler));
        self
    }

    /// Binds EXCEPTION to the node's own exception logger.
    #[must_use]
    pub fn bind_exception_logging(self) -> Self {
        let logger = Arc::clone(&self.exception_logger);
        self.bind(
            OperationType::Exception,
            move |operation: &SimulatorOperation, source: &SimulatorAddress| -> AppResult<ResponseType> {
                let SimulatorOperation::Exception(exception) = operation else {
                    return Err(mismatch(OperationType::Exception, operation));
                };
                logger.log_operation(source, exception);
                Ok(ResponseType::Success)
            },
        )
    }

    #[must_use]
    pub fn build(self) -> OperationProcessor {
        OperationProcessor {
            role: self.role,
            handlers: self.handlers,
            exception_logger: self.exception_logger,
        }
    }
}

/// Error for a handler that received an operation of another kind.
#[must_use]
pub fn mismatch(expected: OperationType, actual: &SimulatorOperation) -> AppError {
    AppError::coordination(CoordinationError::OperationMismatch {
        expected: expected.as_str(),
        actual: actual.operation_type().as_str(),
    })
}
