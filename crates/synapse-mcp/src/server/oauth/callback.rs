//! Client redirect cleanup after the upstream callback.
//!
//! Some MCP clients start an authorization without a `state` and some
//! serialize the missing value as the literal string `None`. Redirecting back
//! with `state=None` makes those clients reject the response as a CSRF
//! mismatch, so the parameter is dropped. Any other URL passes through
//! untouched.

use url::{Url, form_urlencoded};

/// Placeholder some clients send instead of omitting `state`.
const NULL_STATE: &str = "None";

/// Strip a `state=None` query parameter from a client redirect URL.
///
/// Returns the input byte-for-byte when there is nothing to strip (including
/// when it is not an absolute URL).
#[must_use]
pub fn sanitize_callback_redirect(location: &str) -> String {
    if Url::parse(location).is_err() {
        return location.to_owned();
    }

    let (head, fragment) = match location.find('#') {
        Some(i) => location.split_at(i),
        None => (location, ""),
    };
    let Some((base, query)) = head.split_once('?') else {
        return location.to_owned();
    };

    let segments: Vec<&str> = query.split('&').collect();
    let kept: Vec<&str> = segments.iter().copied().filter(|s| !is_null_state(s)).collect();
    if kept.len() == segments.len() {
        return location.to_owned();
    }

    tracing::debug!("Removed state=None from client redirect");
    if kept.is_empty() {
        format!("{base}{fragment}")
    } else {
        format!("{base}?{}{fragment}", kept.join("&"))
    }
}

/// Whether a raw `key=value` query segment decodes to `state=None`.
fn is_null_state(segment: &str) -> bool {
    form_urlencoded::parse(segment.as_bytes())
        .next()
        .is_some_and(|(k, v)| k == "state" && v == NULL_STATE)
}
