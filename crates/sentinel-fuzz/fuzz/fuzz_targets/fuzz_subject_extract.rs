#![no_main]

use libfuzzer_sys::fuzz_target;
use synapse_mcp::server::oauth::extract_subject_unverified;

fuzz_target!(|data: &[u8]| {
    if let Ok(token) = std::str::from_utf8(data) {
        if let Ok(sub) = extract_subject_unverified(token) {
            assert!(!sub.is_empty());
        }
    }
});
