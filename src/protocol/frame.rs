use serde::{Deserialize, Serialize};

use super::address::SimulatorAddress;
use super::operation::WireOperation;
use super::response::ResponseType;

/// Unit of the newline-delimited broker transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum Frame {
    Hello(HelloFrame),
    Request(RequestFrame),
    Response(ResponseFrame),
    Error(ErrorFrame),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloFrame {
    pub address: SimulatorAddress,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub message_id: u64,
    pub source: SimulatorAddress,
    pub destination: SimulatorAddress,
    pub operation: WireOperation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub message_id: u64,
    pub response: ResponseType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub message: String,
}
