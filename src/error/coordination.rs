use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error("{address} is not an expected participant of {test_id}/{phase}.")]
    UnknownParticipant {
        test_id: String,
        phase: &'static str,
        address: String,
    },
    #[error("No barrier registered for {test_id}/{phase}.")]
    BarrierNotRegistered { test_id: String, phase: &'static str },
    #[error("Barrier for {test_id}/{phase} is already registered.")]
    BarrierAlreadyRegistered { test_id: String, phase: &'static str },
    #[error("Wildcard address {address} cannot take part in a barrier.")]
    WildcardParticipant { address: String },
    #[error("Operation {actual} was routed to the {expected} handler.")]
    OperationMismatch {
        expected: &'static str,
        actual: &'static str,
    },
    #[error("Test {test_id} lists phase {phase} twice or out of lifecycle order.")]
    PhaseOutOfOrder { test_id: String, phase: &'static str },
    #[error("Test {test_id} finished with {failures} failure(s).")]
    RunFailed { test_id: String, failures: usize },
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
