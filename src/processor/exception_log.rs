use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::error;

use crate::protocol::{ExceptionOperation, OperationType, SimulatorAddress};

const RECENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedException {
    pub source: SimulatorAddress,
    pub operation_type: Option<OperationType>,
    pub message: String,
}

/// Node-local sink for dispatch errors and reported EXCEPTION operations.
#[derive(Debug, Default)]
pub struct LocalExceptionLogger {
    count: AtomicU64,
    recent: Mutex<VecDeque<LoggedException>>,
}

impl LocalExceptionLogger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an EXCEPTION operation reported by a remote node.
    pub fn log_operation(&self, source: &SimulatorAddress, operation: &ExceptionOperation) {
        error!(
            "Exception reported by {} ({}): {}",
            source, operation.kind, operation.message
        );
        if let Some(stack_trace) = operation.stack_trace.as_deref() {
            error!("{}", stack_trace);
        }
        self.push(LoggedException {
            source: *source,
            operation_type: None,
            message: format!("{}: {}", operation.kind, operation.message),
        });
    }

    /// Records an error raised while handling `operation_type` locally.
    pub fn log_dispatch_error(
        &self,
        operation_type: Option<OperationType>,
        source: &SimulatorAddress,
        message: String,
    ) {
        match operation_type {
            Some(kind) => error!("Failed to process {} from {}: {}", kind, source, message),
            None => error!("Failed to process operation from {}: {}", source, message),
        }
        self.push(LoggedException {
            source: *source,
            operation_type,
            message,
        });
    }

    #[must_use]
    pub fn exception_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn recent(&self) -> Vec<LoggedException> {
        match self.recent.lock() {
            Ok(guard) => guard.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }

    fn push(&self, entry: LoggedException) {
        self.count.fetch_add(1, Ordering::Relaxed);
        let mut guard = match self.recent.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.len() >= RECENT_CAPACITY {
            guard.pop_front();
        }
        guard.push_back(entry);
    }
}
