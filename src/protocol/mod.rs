//! Addresses, operations, responses and the framed wire format shared by
//! every node of the fleet.
mod address;
mod frame;
mod io;
mod operation;
mod response;

#[cfg(test)]
mod tests;

pub use address::{AddressIndex, AddressLevel, SimulatorAddress};
pub use frame::{ErrorFrame, Frame, HelloFrame, RequestFrame, ResponseFrame};
pub use io::{MAX_FRAME_BYTES, decode_frame, read_frame, send_frame};
pub use operation::{
    CustomOperation, ExceptionOperation, FailureOperation, FailureType, OperationType,
    PerformanceState, PerformanceStateOperation, PhaseCompletedOperation, SimulatorOperation,
    StartTestPhaseOperation, StopTestOperation, TerminateWorkerOperation, TestHistogramOperation,
    TestId, TestPhase, WireOperation,
};
pub use response::ResponseType;
