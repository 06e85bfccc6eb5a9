use super::{
    BrokerError, ConfigError, CoordinationError, MetricsError, ProtocolError, WorkloadError,
};

impl From<&'static str> for ConfigError {
    fn from(message: &'static str) -> Self {
        ConfigError::TestExpectation { message }
    }
}

impl From<String> for ConfigError {
    fn from(value: String) -> Self {
        ConfigError::TestExpectationValue {
            message: "Test expectation failed",
            value,
        }
    }
}

impl From<&'static str> for ProtocolError {
    fn from(message: &'static str) -> Self {
        ProtocolError::TestExpectation { message }
    }
}

impl From<String> for ProtocolError {
    fn from(value: String) -> Self {
        ProtocolError::TestExpectationValue {
            message: "Test expectation failed",
            value,
        }
    }
}

impl From<&'static str> for BrokerError {
    fn from(message: &'static str) -> Self {
        BrokerError::TestExpectation { message }
    }
}

impl From<String> for BrokerError {
    fn from(value: String) -> Self {
        BrokerError::TestExpectationValue {
            message: "Test expectation failed",
            value,
        }
    }
}

impl From<&'static str> for CoordinationError {
    fn from(message: &'static str) -> Self {
        CoordinationError::TestExpectation { message }
    }
}

impl From<String> for CoordinationError {
    fn from(value: String) -> Self {
        CoordinationError::TestExpectationValue {
            message: "Test expectation failed",
            value,
        }
    }
}

impl From<&'static str> for MetricsError {
    fn from(message: &'static str) -> Self {
        MetricsError::TestExpectation { message }
    }
}

impl From<String> for MetricsError {
    fn from(value: String) -> Self {
        MetricsError::TestExpectationValue {
            message: "Test expectation failed",
            value,
        }
    }
}

impl From<&'static str> for WorkloadError {
    fn from(message: &'static str) -> Self {
        WorkloadError::TestExpectation { message }
    }
}

impl From<String> for WorkloadError {
    fn from(value: String) -> Self {
        WorkloadError::TestExpectationValue {
            message: "Test expectation failed",
            value,
        }
    }
}
