use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkloadError {
    #[error("{message}")]
    Failed { message: String },
    #[error("Phase {phase} of test {test_id} is still running.")]
    PhaseAlreadyRunning { test_id: String, phase: &'static str },
    #[error("Worker is shutting down.")]
    ShuttingDown,
    #[cfg(test)]
    #[error("Test expectation failed: {message}")]
    TestExpectation { message: &'static str },
    #[cfg(test)]
    #[error("Test expectation failed: {message}: {value}")]
    TestExpectationValue {
        message: &'static str,
        value: String,
    },
}

impl WorkloadError {
    pub fn failed<M>(message: M) -> Self
    where
        M: Into<String>,
    {
        WorkloadError::Failed {
            message: message.into(),
        }
    }
}
