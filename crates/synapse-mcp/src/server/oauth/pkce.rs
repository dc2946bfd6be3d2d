//! PKCE (Proof Key for Code Exchange) verification.
//!
//! The proxy checks the client's verifier itself before releasing upstream
//! tokens; only the S256 method is accepted (RFC 7636 §4.2).

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};

/// The only challenge method the proxy advertises.
pub const METHOD_S256: &str = "S256";

/// Check that a code verifier is 43..=128 unreserved characters (RFC 7636 §4.1).
pub fn is_well_formed_verifier(code_verifier: &str) -> bool {
    (43..=128).contains(&code_verifier.len())
        && code_verifier
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~'))
}

/// Verify a PKCE S256 code challenge.
///
/// Computes `BASE64URL(SHA256(code_verifier))` and compares to the stored challenge.
pub fn verify_s256(code_verifier: &str, code_challenge: &str) -> bool {
    if !is_well_formed_verifier(code_verifier) {
        return false;
    }
    let hash = Sha256::digest(code_verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash) == code_challenge
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 7636 Appendix B
    const VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
    const CHALLENGE: &str = "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM";

    #[test]
    fn test_rfc_vector() {
        assert!(verify_s256(VERIFIER, CHALLENGE));
    }

    #[test]
    fn test_challenge_mismatch() {
        assert!(!verify_s256(VERIFIER, "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cN"));
    }

    #[test]
    fn test_short_verifier_rejected_even_if_hash_matches() {
        let short = "abc";
        let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(short.as_bytes()));
        assert!(!verify_s256(short, &challenge));
    }

    #[test]
    fn test_verifier_charset() {
        assert!(is_well_formed_verifier(&"a".repeat(43)));
        assert!(!is_well_formed_verifier(&"a".repeat(129)));
        assert!(!is_well_formed_verifier(&format!("{}/", "a".repeat(43))));
    }
}
