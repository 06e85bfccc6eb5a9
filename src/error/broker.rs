use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Bind error on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Connection error to {addr}: {source}")]
    Connection {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Timed out waiting for hello.")]
    HelloTimeout,
    #[error("Expected hello as first frame.")]
    ExpectedHello,
    #[error("Address {child} is not a direct child of {parent}.")]
    NotAChild { child: String, parent: String },
    #[error("Address {address} is already registered.")]
    DuplicateChild { address: String },
    #[error("Parent link is already connected.")]
    ParentAlreadyConnected,
    #[error("Rejected by peer: {message}")]
    Rejected { message: String },
    #[error("Timed out waiting for {expected} children (got {actual}).")]
    ChildWaitTimeout { expected: usize, actual: usize },
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
