use std::collections::BTreeMap;

use tokio::io::BufReader;

use super::*;
use crate::error::{AppError, AppResult, ProtocolError};

fn run_async_test<F>(future: F) -> AppResult<()>
where
    F: std::future::Future<Output = AppResult<()>>,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::protocol(format!("Failed to build runtime: {}", err)))?;
    runtime.block_on(future)
}

#[test]
fn address_round_trips_through_canonical_form() -> AppResult<()> {
    let addresses = [
        SimulatorAddress::root(),
        SimulatorAddress::agent(3)?,
        SimulatorAddress::worker(2, 7)?,
        SimulatorAddress::test(1, 12, 4)?,
        SimulatorAddress::all_agents(),
        SimulatorAddress::all_workers(),
        SimulatorAddress::agent(5)?.child(AddressIndex::All)?,
    ];
    for address in addresses {
        let rendered = address.to_string();
        let parsed: SimulatorAddress = rendered.parse()?;
        if parsed != address {
            return Err(AppError::protocol(format!(
                "Round trip changed {} into {}",
                rendered, parsed
            )));
        }
    }
    Ok(())
}

#[test]
fn address_renders_expected_strings() -> AppResult<()> {
    let cases = [
        (SimulatorAddress::root(), "C"),
        (SimulatorAddress::agent(2)?, "C_A2"),
        (SimulatorAddress::worker(2, 3)?, "C_A2_W3"),
        (SimulatorAddress::test(2, 3, 1)?, "C_A2_W3_T1"),
        (SimulatorAddress::all_workers(), "C_A*_W*"),
    ];
    for (address, expected) in cases {
        if address.to_string() != expected {
            return Err(AppError::protocol(format!(
                "Expected {}, got {}",
                expected, address
            )));
        }
    }
    Ok(())
}

#[test]
fn malformed_addresses_are_rejected() -> AppResult<()> {
    let inputs = [
        "",
        "X",
        "C_",
        "C_W1",
        "C_A",
        "C_A0",
        "C_A01",
        "C_A-1",
        "C_A1_W2_T3_X4",
        "C_A1_A2",
        "C_A99999999999",
        "c_a1",
    ];
    for input in inputs {
        match input.parse::<SimulatorAddress>() {
            Ok(address) => {
                return Err(AppError::protocol(format!(
                    "Expected '{}' to be rejected, parsed {}",
                    input, address
                )));
            }
            Err(AppError::Protocol(ProtocolError::AddressFormat { .. })) => {}
            Err(err) => {
                return Err(AppError::protocol(format!(
                    "Unexpected error kind for '{}': {}",
                    input, err
                )));
            }
        }
    }
    Ok(())
}

#[test]
fn address_levels_fix_meaningful_indices() -> AppResult<()> {
    let worker = SimulatorAddress::worker(4, 9)?;
    if worker.level() != AddressLevel::Worker
        || worker.agent_index().get() != Some(4)
        || worker.worker_index().get() != Some(9)
        || worker.test_index() != AddressIndex::Unset
    {
        return Err(AppError::protocol("Worker address slots are inconsistent"));
    }
    let invalid = SimulatorAddress::new(
        AddressLevel::Worker,
        AddressIndex::at(1)?,
        AddressIndex::Unset,
        AddressIndex::Unset,
    );
    if invalid.is_ok() {
        return Err(AppError::protocol(
            "Expected a worker address without worker index to be rejected",
        ));
    }
    let below = SimulatorAddress::new(
        AddressLevel::Agent,
        AddressIndex::at(1)?,
        AddressIndex::at(1)?,
        AddressIndex::Unset,
    );
    if below.is_ok() {
        return Err(AppError::protocol(
            "Expected an agent address with a worker index to be rejected",
        ));
    }
    if AddressIndex::at(0).is_ok() {
        return Err(AppError::protocol("Expected zero index to be rejected"));
    }
    Ok(())
}

#[test]
fn containment_follows_hierarchy() -> AppResult<()> {
    let agent = SimulatorAddress::agent(2)?;
    let worker = SimulatorAddress::worker(2, 3)?;
    let other_worker = SimulatorAddress::worker(1, 3)?;
    let test = SimulatorAddress::test(2, 3, 1)?;

    if !agent.contains(&worker) || !agent.contains(&test) || !worker.contains(&test) {
        return Err(AppError::protocol("Expected agent to contain its workers"));
    }
    if agent.contains(&other_worker) {
        return Err(AppError::protocol(
            "Agent must not contain another agent's worker",
        ));
    }
    if worker.contains(&agent) {
        return Err(AppError::protocol("Worker must not contain its agent"));
    }
    if !SimulatorAddress::root().contains(&test) || !worker.contains(&worker) {
        return Err(AppError::protocol(
            "Root contains everything and addresses contain themselves",
        ));
    }
    let all_workers = SimulatorAddress::all_workers();
    if !all_workers.contains(&worker) || !all_workers.contains(&other_worker) {
        return Err(AppError::protocol("Wildcard must contain every worker"));
    }
    if all_workers.contains(&agent) || worker.contains(&all_workers) {
        return Err(AppError::protocol(
            "Wildcard containment must respect levels",
        ));
    }
    Ok(())
}

#[test]
fn parent_and_truncate_walk_up() -> AppResult<()> {
    let test = SimulatorAddress::test(2, 3, 1)?;
    let worker = SimulatorAddress::worker(2, 3)?;
    if test.parent() != Some(worker) {
        return Err(AppError::protocol("Parent of a test is its worker"));
    }
    if test.truncate(AddressLevel::Agent) != Some(SimulatorAddress::agent(2)?) {
        return Err(AppError::protocol("Truncate to agent level failed"));
    }
    if SimulatorAddress::root().parent().is_some() {
        return Err(AppError::protocol("Root has no parent"));
    }
    if SimulatorAddress::agent(1)?.truncate(AddressLevel::Worker).is_some() {
        return Err(AppError::protocol("Cannot truncate to a deeper level"));
    }
    Ok(())
}

#[test]
fn wildcard_addresses_are_not_concrete() -> AppResult<()> {
    if SimulatorAddress::all_workers().ensure_concrete().is_ok() {
        return Err(AppError::protocol("Wildcard must not pass as concrete"));
    }
    SimulatorAddress::worker(1, 1)?.ensure_concrete()?;
    Ok(())
}

#[test]
fn address_serializes_as_string() -> AppResult<()> {
    let worker = SimulatorAddress::worker(1, 2)?;
    let json = serde_json::to_string(&worker)?;
    if json != "\"C_A1_W2\"" {
        return Err(AppError::protocol(format!("Unexpected JSON {}", json)));
    }
    let decoded: SimulatorAddress = serde_json::from_str(&json)?;
    if decoded != worker {
        return Err(AppError::protocol("Decoded address differs"));
    }
    if serde_json::from_str::<SimulatorAddress>("\"C_Q1\"").is_ok() {
        return Err(AppError::protocol("Expected bad address JSON to fail"));
    }
    Ok(())
}

fn sample_operations() -> AppResult<Vec<SimulatorOperation>> {
    let mut states = BTreeMap::new();
    states.insert(
        TestId::from("t1"),
        PerformanceState {
            operation_count: 42,
            timestamp_ms: 1_000,
        },
    );
    let mut probes = BTreeMap::new();
    probes.insert("get".to_owned(), "SGlzdG9ncmFt".to_owned());
    Ok(vec![
        SimulatorOperation::Exception(ExceptionOperation {
            kind: "handler".to_owned(),
            test_id: None,
            message: "boom".to_owned(),
            stack_trace: None,
        }),
        SimulatorOperation::PhaseCompleted(PhaseCompletedOperation {
            test_id: TestId::from("t1"),
            phase: TestPhase::Run,
        }),
        SimulatorOperation::PerformanceState(PerformanceStateOperation { states }),
        SimulatorOperation::TestHistograms(TestHistogramOperation {
            test_id: TestId::from("t1"),
            probe_histograms: probes,
        }),
        SimulatorOperation::Failure(FailureOperation::new(
            Some(TestId::from("t1")),
            SimulatorAddress::worker(1, 1)?,
            FailureType::WorkerException,
            "oops",
        )),
        SimulatorOperation::StartTestPhase(StartTestPhaseOperation {
            test_id: TestId::from("t1"),
            phase: TestPhase::Warmup,
        }),
        SimulatorOperation::StopTest(StopTestOperation {
            test_id: TestId::from("t1"),
        }),
        SimulatorOperation::TerminateWorker(TerminateWorkerOperation { reason: None }),
        SimulatorOperation::Custom(CustomOperation {
            name: "resize".to_owned(),
            payload: serde_json::json!({ "threads": 4 }),
        }),
    ])
}

#[test]
fn every_operation_kind_decodes_to_itself() -> AppResult<()> {
    for operation in sample_operations()? {
        let wire = operation.encode()?;
        if wire.kind != operation.operation_type().as_str() {
            return Err(AppError::protocol(format!(
                "Tag {} does not match {}",
                wire.kind,
                operation.operation_type()
            )));
        }
        let decoded = SimulatorOperation::decode(&wire)?;
        if decoded != operation {
            return Err(AppError::protocol(format!(
                "Decoding changed {}",
                operation.operation_type()
            )));
        }
    }
    Ok(())
}

#[test]
fn existing_tags_stay_stable() -> AppResult<()> {
    let wire: WireOperation = serde_json::from_str(
        r#"{"type":"PHASE_COMPLETED","payload":{"test_id":"t9","phase":"GLOBAL_VERIFY"}}"#,
    )?;
    let decoded = SimulatorOperation::decode(&wire)?;
    let SimulatorOperation::PhaseCompleted(op) = &decoded else {
        return Err(AppError::protocol(format!(
            "Decoded wrong operation {}",
            decoded.operation_type()
        )));
    };
    if op.test_id.as_str() != "t9" || op.phase != TestPhase::GlobalVerify {
        return Err(AppError::protocol("Decoded phase completion differs"));
    }
    Ok(())
}

#[test]
fn unknown_discriminant_is_a_typed_error() -> AppResult<()> {
    let wire = WireOperation {
        kind: "REBALANCE_PARTITIONS".to_owned(),
        payload: serde_json::json!({}),
    };
    match SimulatorOperation::decode(&wire) {
        Err(AppError::Protocol(ProtocolError::UnknownOperationType { tag })) => {
            if tag != "REBALANCE_PARTITIONS" {
                return Err(AppError::protocol(format!("Unexpected tag {}", tag)));
            }
        }
        Err(err) => {
            return Err(AppError::protocol(format!("Unexpected error {}", err)));
        }
        Ok(_) => return Err(AppError::protocol("Expected unknown tag to fail")),
    }
    Ok(())
}

#[test]
fn mismatched_payload_is_a_typed_error() -> AppResult<()> {
    let wire = WireOperation {
        kind: "FAILURE".to_owned(),
        payload: serde_json::json!({ "message": 3 }),
    };
    match SimulatorOperation::decode(&wire) {
        Err(AppError::Protocol(ProtocolError::Payload { operation, .. })) => {
            if operation != "FAILURE" {
                return Err(AppError::protocol("Payload error names the wrong type"));
            }
            Ok(())
        }
        Err(err) => Err(AppError::protocol(format!("Unexpected error {}", err))),
        Ok(_) => Err(AppError::protocol("Expected bad payload to fail")),
    }
}

#[test]
fn responses_aggregate_first_failure() -> AppResult<()> {
    let all_ok = ResponseType::aggregate([ResponseType::Success, ResponseType::Success]);
    if all_ok != ResponseType::Success {
        return Err(AppError::protocol("All successes must aggregate to success"));
    }
    let mixed = ResponseType::aggregate([
        ResponseType::Success,
        ResponseType::NodeUnreachable,
        ResponseType::ExceptionDuringOperationExecution,
    ]);
    if mixed != ResponseType::NodeUnreachable {
        return Err(AppError::protocol(format!(
            "Expected first failure to win, got {}",
            mixed
        )));
    }
    if ResponseType::aggregate([]) != ResponseType::Success {
        return Err(AppError::protocol("Empty fan-out is a success"));
    }
    Ok(())
}

#[test]
fn frames_reassemble_from_partial_reads() -> AppResult<()> {
    run_async_test(async {
        let frame = Frame::Request(RequestFrame {
            message_id: 7,
            source: SimulatorAddress::worker(1, 2)?,
            destination: SimulatorAddress::root(),
            operation: SimulatorOperation::StopTest(StopTestOperation {
                test_id: TestId::from("t1"),
            })
            .encode()?,
        });
        let mut encoded = Vec::new();
        send_frame(&mut encoded, &frame).await?;
        send_frame(&mut encoded, &Frame::Hello(HelloFrame {
            address: SimulatorAddress::agent(1)?,
        }))
        .await?;

        let (client, mut server) = tokio::io::duplex(8);
        let writer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            for chunk in encoded.chunks(5) {
                if server.write_all(chunk).await.is_err() {
                    break;
                }
            }
        });
        let mut reader = BufReader::new(client);
        let first = read_frame(&mut reader).await?;
        let second = read_frame(&mut reader).await?;
        writer.await?;
        if first != frame {
            return Err(AppError::protocol("First frame was not reassembled"));
        }
        if !matches!(second, Frame::Hello(_)) {
            return Err(AppError::protocol("Second frame was not a hello"));
        }
        match read_frame(&mut reader).await {
            Err(AppError::Protocol(ProtocolError::ConnectionClosed)) => Ok(()),
            Err(err) => Err(AppError::protocol(format!("Unexpected error {}", err))),
            Ok(_) => Err(AppError::protocol("Expected closed connection")),
        }
    })
}

#[test]
fn garbage_frame_is_rejected() -> AppResult<()> {
    if decode_frame("{\"frame\":\"bogus\"}").is_ok() {
        return Err(AppError::protocol("Expected unknown frame to fail"));
    }
    if decode_frame("not json").is_ok() {
        return Err(AppError::protocol("Expected garbage to fail"));
    }
    Ok(())
}

#[test]
fn oversized_frame_is_rejected_without_buffering_it_all() -> AppResult<()> {
    run_async_test(async {
        let oversized = vec![b'a'; MAX_FRAME_BYTES.saturating_add(64)];
        let mut reader: &[u8] = &oversized;
        match read_frame(&mut reader).await {
            Err(AppError::Protocol(ProtocolError::FrameTooLarge { max_bytes })) => {
                if max_bytes != MAX_FRAME_BYTES {
                    return Err(AppError::protocol("Limit reported incorrectly"));
                }
            }
            Err(err) => return Err(AppError::protocol(format!("Unexpected error {}", err))),
            Ok(_) => return Err(AppError::protocol("Expected oversized frame to fail")),
        }
        if reader.is_empty() {
            return Err(AppError::protocol("Reader consumed past the frame limit"));
        }
        Ok(())
    })
}
