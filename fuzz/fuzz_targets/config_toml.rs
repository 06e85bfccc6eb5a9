#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let input = String::from_utf8_lossy(data);
    if let Ok(config) = fleetbench::fuzzing::parse_config_toml_input(&input) {
        debug_assert!(config.broker.dispatch_pool_size > 0);
    }
});
