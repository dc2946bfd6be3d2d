#![no_main]

use libfuzzer_sys::fuzz_target;
use synapse_mcp::server::oauth::callback::sanitize_callback_redirect;

fuzz_target!(|data: &[u8]| {
    let Ok(location) = std::str::from_utf8(data) else {
        return;
    };
    let once = sanitize_callback_redirect(location);
    // Sanitizing is idempotent
    assert_eq!(sanitize_callback_redirect(&once), once);
});
