#![no_main]

use libfuzzer_sys::fuzz_target;
use synapse_mcp::server::oauth::registry::parse_static_clients;
use synapse_mcp::server::oauth::types::ClientRegistration;

fuzz_target!(|data: &[u8]| {
    if let Ok(json) = std::str::from_utf8(data) {
        // Every accepted entry is usable for the code flow
        if let Ok(clients) = parse_static_clients(json) {
            for client in clients {
                assert!(client.validate().is_ok());
            }
        }
    }
    let _ = serde_json::from_slice::<ClientRegistration>(data);
});
