//! Property-based tests for client redirect sanitization.

use proptest::prelude::*;
use synapse_mcp::server::oauth::callback::sanitize_callback_redirect;
use url::Url;

/// Query values that are never the `None` placeholder.
fn arb_state() -> impl Strategy<Value = String> {
    "[A-Za-z0-9_-]{1,40}".prop_filter("placeholder", |s| s != "None")
}

fn redirect(base: &str, code: &str, state: Option<&str>) -> String {
    let mut url = Url::parse(base).unwrap();
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("code", code);
        if let Some(state) = state {
            query.append_pair("state", state);
        }
    }
    url.into()
}

fn arb_base() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("http://localhost:3000/cb".to_owned()),
        Just("https://claude.ai/api/mcp/auth_callback".to_owned()),
        "[0-9]{4,5}".prop_map(|port| format!("http://127.0.0.1:{port}/callback")),
    ]
}

proptest! {
    /// Any real state value passes through byte-for-byte.
    #[test]
    fn real_state_is_untouched(base in arb_base(), code in "[A-Za-z0-9_-]{8,43}", state in arb_state()) {
        let location = redirect(&base, &code, Some(&state));
        prop_assert_eq!(sanitize_callback_redirect(&location), location);
    }

    /// A `state=None` is always dropped and the code survives.
    #[test]
    fn placeholder_state_is_removed(base in arb_base(), code in "[A-Za-z0-9_-]{8,43}") {
        let location = redirect(&base, &code, Some("None"));
        let sanitized = sanitize_callback_redirect(&location);

        prop_assert!(!sanitized.contains("state="));
        prop_assert_eq!(sanitized, redirect(&base, &code, None));
    }

    /// Sanitizing twice is the same as sanitizing once.
    #[test]
    fn sanitize_is_idempotent(input in ".{0,80}") {
        let once = sanitize_callback_redirect(&input);
        prop_assert_eq!(sanitize_callback_redirect(&once), once.clone());
    }
}
