#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let input = String::from_utf8_lossy(data);
    if let Ok(address) = fleetbench::fuzzing::parse_address_input(&input) {
        if let Some(parent) = address.parent() {
            debug_assert!(parent.contains(&address) || address.is_wildcard());
        }
    }
});
