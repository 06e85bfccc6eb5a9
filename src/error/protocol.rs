use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid address '{input}': {reason}")]
    AddressFormat { input: String, reason: &'static str },
    #[error("Invalid address: {reason}")]
    InvalidAddress { reason: &'static str },
    #[error("Wildcard address '{address}' cannot be used as a source.")]
    WildcardSource { address: String },
    #[error("Unknown operation type '{tag}'.")]
    UnknownOperationType { tag: String },
    #[error("Invalid {operation} payload: {source}")]
    Payload {
        operation: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("Serialization error during {context}: {source}")]
    Serialize {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("Deserialization error during {context}: {source}")]
    Deserialize {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("I/O error during {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("Connection closed.")]
    ConnectionClosed,
    #[error("Wire frame exceeded max size ({max_bytes} bytes).")]
    FrameTooLarge { max_bytes: usize },
    #[error("Wire frame was not valid UTF-8: {source}")]
    FrameInvalidUtf8 {
        #[source]
        source: std::str::Utf8Error,
    },
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
