//! Error types for the Synapse MCP OAuth proxy.
//!
//! Uses `thiserror` for structured error handling with automatic `From` implementations.
//! Every error that can reach an HTTP client renders as an OAuth 2.0 error body
//! (`error` + `error_description`).

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use jsonwebtoken::errors::ErrorKind;

/// Why a bearer token was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationErrorKind {
    /// `exp` is in the past (or `nbf` in the future).
    Expired,
    /// Signature does not match the key advertised for the token's `kid`.
    BadSignature,
    /// `iss` is not the configured issuer.
    IssuerMismatch,
    /// `aud` does not contain this proxy's client id.
    AudienceMismatch,
    /// Token scopes are not a superset of the required scopes.
    InsufficientScope,
    /// Not a JWT, wrong algorithm, or undecodable claims.
    Malformed,
    /// No signing key could be obtained for the token (JWKS unreachable or unknown `kid`).
    KeyUnavailable,
}

/// Bearer token verification failure. Never retried.
#[derive(thiserror::Error, Debug, Clone)]
#[error("Token verification failed ({kind:?}): {message}")]
pub struct VerificationError {
    pub kind: VerificationErrorKind,
    pub message: String,
}

impl VerificationError {
    #[must_use]
    pub fn new(kind: VerificationErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(VerificationErrorKind::Malformed, message)
    }

    #[must_use]
    pub fn key_unavailable(message: impl Into<String>) -> Self {
        Self::new(VerificationErrorKind::KeyUnavailable, message)
    }
}

impl From<jsonwebtoken::errors::Error> for VerificationError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        let kind = match err.kind() {
            ErrorKind::ExpiredSignature | ErrorKind::ImmatureSignature => {
                VerificationErrorKind::Expired
            }
            ErrorKind::InvalidSignature => VerificationErrorKind::BadSignature,
            ErrorKind::InvalidIssuer => VerificationErrorKind::IssuerMismatch,
            ErrorKind::InvalidAudience => VerificationErrorKind::AudienceMismatch,
            ErrorKind::MissingRequiredClaim(claim) => match claim.as_str() {
                "iss" => VerificationErrorKind::IssuerMismatch,
                "aud" => VerificationErrorKind::AudienceMismatch,
                _ => VerificationErrorKind::Malformed,
            },
            _ => VerificationErrorKind::Malformed,
        };
        Self::new(kind, err.to_string())
    }
}

/// Errors from the durable stores (client registry, user token store).
#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    /// Filesystem failure
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Persisted data could not be (de)serialized
    #[error("Storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Failure reported by an external store backend
    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Errors from dynamic or static client registration.
#[derive(thiserror::Error, Debug)]
pub enum RegistrationError {
    /// Client metadata failed validation
    #[error("Invalid client metadata: {0}")]
    InvalidMetadata(String),

    /// A dynamic registration tried to replace a statically configured client
    #[error("Client '{client_id}' is statically configured and cannot be re-registered")]
    StaticClientConflict {
        /// Conflicting client id
        client_id: String,
    },

    /// The registration could not be persisted
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl RegistrationError {
    #[must_use]
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidMetadata(message.into())
    }
}

/// Errors talking to the upstream identity provider.
#[derive(thiserror::Error, Debug)]
pub enum UpstreamError {
    /// HTTP transport error (connection, DNS, TLS, timeout)
    #[error("Upstream HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Upstream answered with a non-success status
    #[error("Upstream returned {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body
        body: String,
    },
}

/// Umbrella error for proxy operations and HTTP handlers.
#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
    #[error(transparent)]
    Verification(#[from] VerificationError),

    #[error(transparent)]
    Registration(#[from] RegistrationError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    /// A malformed OAuth request; `error` is the RFC 6749 error code.
    #[error("{error}: {description}")]
    InvalidRequest {
        error: &'static str,
        description: String,
    },

    /// No upstream credential is available for the current user
    #[error("Authentication required")]
    AuthenticationRequired,

    /// Too many requests for a throttled endpoint
    #[error("Rate limited")]
    RateLimited,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    #[must_use]
    pub fn invalid_request(description: impl Into<String>) -> Self {
        Self::InvalidRequest { error: "invalid_request", description: description.into() }
    }

    #[must_use]
    pub fn invalid_grant(description: impl Into<String>) -> Self {
        Self::InvalidRequest { error: "invalid_grant", description: description.into() }
    }

    #[must_use]
    pub fn invalid_client(description: impl Into<String>) -> Self {
        Self::InvalidRequest { error: "invalid_client", description: description.into() }
    }

    /// HTTP status and OAuth error code for this error.
    #[must_use]
    pub fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            Self::Verification(_) => (StatusCode::UNAUTHORIZED, "invalid_token"),
            Self::Registration(RegistrationError::Storage(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "server_error")
            }
            Self::Registration(_) => (StatusCode::BAD_REQUEST, "invalid_client_metadata"),
            Self::Storage(_) | Self::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "server_error")
            }
            Self::Upstream(_) => (StatusCode::BAD_GATEWAY, "temporarily_unavailable"),
            Self::InvalidRequest { error, .. } => (StatusCode::BAD_REQUEST, *error),
            Self::AuthenticationRequired => (StatusCode::UNAUTHORIZED, "invalid_token"),
            Self::RateLimited => (StatusCode::TOO_MANY_REQUESTS, "slow_down"),
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let description = match &self {
            Self::InvalidRequest { description, .. } => description.clone(),
            other => other.to_string(),
        };

        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        let mut response = (
            status,
            Json(serde_json::json!({
                "error": code,
                "error_description": description
            })),
        )
            .into_response();

        if status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Bearer error=\"invalid_token\""),
            );
        }
        response
    }
}

/// Result type alias for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jwt_error_kinds_map_to_verification_kinds() {
        let expired: VerificationError =
            jsonwebtoken::errors::Error::from(ErrorKind::ExpiredSignature).into();
        assert_eq!(expired.kind, VerificationErrorKind::Expired);

        let issuer: VerificationError =
            jsonwebtoken::errors::Error::from(ErrorKind::InvalidIssuer).into();
        assert_eq!(issuer.kind, VerificationErrorKind::IssuerMismatch);

        let sig: VerificationError =
            jsonwebtoken::errors::Error::from(ErrorKind::InvalidSignature).into();
        assert_eq!(sig.kind, VerificationErrorKind::BadSignature);

        let other: VerificationError =
            jsonwebtoken::errors::Error::from(ErrorKind::InvalidToken).into();
        assert_eq!(other.kind, VerificationErrorKind::Malformed);
    }

    #[test]
    fn test_status_codes() {
        let err = ProxyError::from(VerificationError::malformed("bad"));
        assert_eq!(err.status_and_code().0, StatusCode::UNAUTHORIZED);

        let err = ProxyError::from(RegistrationError::invalid("redirect_uris is required"));
        assert_eq!(err.status_and_code(), (StatusCode::BAD_REQUEST, "invalid_client_metadata"));

        let err = ProxyError::from(RegistrationError::Storage(StorageError::Backend("x".into())));
        assert_eq!(err.status_and_code().0, StatusCode::INTERNAL_SERVER_ERROR);

        let err = ProxyError::invalid_grant("PKCE verification failed");
        assert_eq!(err.status_and_code(), (StatusCode::BAD_REQUEST, "invalid_grant"));
    }

    #[test]
    fn test_unauthorized_response_carries_www_authenticate() {
        let response = ProxyError::AuthenticationRequired.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));
    }
}
