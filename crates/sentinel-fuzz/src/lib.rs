//! Fuzzing library for synapse-mcp.
//!
//! Targets cover the parsers that see untrusted input: client redirect
//! sanitization, unverified `sub` extraction from upstream tokens, and the
//! client registration documents read from configuration and disk.
//!
//! # Usage
//!
//! ```bash
//! cd crates/sentinel-fuzz
//! cargo +nightly fuzz run fuzz_callback_sanitize -- -max_total_time=60
//! ```

pub use synapse_mcp::server::oauth::callback::sanitize_callback_redirect;
pub use synapse_mcp::server::oauth::extract_subject_unverified;
pub use synapse_mcp::server::oauth::registry::parse_static_clients;
