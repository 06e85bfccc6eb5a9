#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let max_len = 64 * 1024;
    let capped = if data.len() > max_len { &data[..max_len] } else { data };
    let line = String::from_utf8_lossy(capped);
    if let Ok(Some(operation)) = fleetbench::fuzzing::decode_frame_input(&line) {
        if let Ok(wire) = operation.encode() {
            debug_assert_eq!(wire.kind, operation.operation_type().as_str());
        }
    }
});
