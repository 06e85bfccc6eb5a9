use std::fmt;

use serde::{Deserialize, Serialize};

/// Synchronous outcome of one dispatched operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseType {
    Success,
    UnsupportedOperationOnThisProcessor,
    ExceptionDuringOperationExecution,
    NodeUnreachable,
    /// Phase completion from an address the barrier does not expect.
    UnknownParticipant,
}

impl ResponseType {
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, ResponseType::Success)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ResponseType::Success => "SUCCESS",
            ResponseType::UnsupportedOperationOnThisProcessor => {
                "UNSUPPORTED_OPERATION_ON_THIS_PROCESSOR"
            }
            ResponseType::ExceptionDuringOperationExecution => {
                "EXCEPTION_DURING_OPERATION_EXECUTION"
            }
            ResponseType::NodeUnreachable => "NODE_UNREACHABLE",
            ResponseType::UnknownParticipant => "UNKNOWN_PARTICIPANT",
        }
    }

    /// Folds fan-out responses: the first non-success wins.
    #[must_use]
    pub const fn combine(self, next: ResponseType) -> ResponseType {
        if self.is_success() { next } else { self }
    }

    /// Combines responses in arrival order; an empty set is a success.
    pub fn aggregate<I>(responses: I) -> ResponseType
    where
        I: IntoIterator<Item = ResponseType>,
    {
        responses
            .into_iter()
            .fold(ResponseType::Success, ResponseType::combine)
    }
}

impl fmt::Display for ResponseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
