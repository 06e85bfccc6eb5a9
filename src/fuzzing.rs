//! Entry points for the `fuzz/` targets. Each one feeds untrusted input
//! through the same path a peer's bytes would take.
use crate::config::FleetConfig;
use crate::error::AppResult;
use crate::metrics::LatencyHistogram;
use crate::protocol::{Frame, SimulatorAddress, SimulatorOperation, decode_frame};

/// Parses a canonical address and checks that rendering round-trips.
///
/// # Errors
///
/// Returns an error when the input is not a valid address.
pub fn parse_address_input(input: &str) -> AppResult<SimulatorAddress> {
    let address: SimulatorAddress = input.parse()?;
    let rendered: SimulatorAddress = address.to_string().parse()?;
    debug_assert_eq!(address, rendered);
    Ok(address)
}

/// Decodes one wire line and, for requests, its typed operation.
///
/// # Errors
///
/// Returns an error when the frame or its operation payload is malformed.
pub fn decode_frame_input(input: &str) -> AppResult<Option<SimulatorOperation>> {
    match decode_frame(input)? {
        Frame::Request(request) => SimulatorOperation::decode(&request.operation).map(Some),
        Frame::Hello(_) | Frame::Response(_) | Frame::Error(_) => Ok(None),
    }
}

/// Decodes a base64 V2 histogram and re-encodes it.
///
/// # Errors
///
/// Returns an error when the payload is not a valid histogram.
pub fn decode_histogram_input(input: &str) -> AppResult<String> {
    LatencyHistogram::decode_base64(input)?.encode_base64()
}

/// Parses a TOML fleet config and validates it.
///
/// # Errors
///
/// Returns an error when parsing or validation fails.
pub fn parse_config_toml_input(input: &str) -> AppResult<FleetConfig> {
    let config: FleetConfig = toml::from_str(input)?;
    config.validate()?;
    Ok(config)
}
