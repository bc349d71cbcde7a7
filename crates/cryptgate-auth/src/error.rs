//! Error types for SigV4 authentication.

/// Errors that can occur during AWS Signature Version 4 authentication.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The `Authorization` header is missing from the request.
    #[error("Missing Authorization header")]
    MissingAuthHeader,

    /// The `Authorization` header could not be parsed.
    #[error("Invalid Authorization header format")]
    MalformedAuthHeader,

    /// The `Authorization` header exceeds the length cap.
    #[error("Authorization header exceeds {0} bytes")]
    AuthHeaderTooLong(usize),

    /// The signing algorithm is not supported (only AWS4-HMAC-SHA256 is supported).
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// A required HTTP header referenced in `SignedHeaders` is missing.
    #[error("Missing required header: {0}")]
    MissingHeader(String),

    /// The `SignedHeaders` list names a header the proxy can never sign
    /// (hop-by-hop, or `Authorization` itself).
    #[error("Header {0} cannot be covered by a signature")]
    UnsignableHeader(String),

    /// The `Credential` component does not match the expected format
    /// (`AKID/date/region/service/aws4_request`).
    #[error("Invalid credential format")]
    InvalidCredential,

    /// The access key ID was not found in the credential store.
    #[error("Access key not found: {0}")]
    UnknownAccessKey(String),

    /// The credential is bound to a different region than the request scope.
    #[error("Access key {0} is not valid in region {1}")]
    RegionMismatch(String, String),

    /// The computed signature does not match the provided signature.
    #[error("Signature does not match")]
    SignatureMismatch,

    /// The `X-Amz-Date` timestamp could not be parsed.
    #[error("Invalid X-Amz-Date timestamp: {0}")]
    InvalidTimestamp(String),

    /// The request timestamp is outside the allowed clock-skew window.
    #[error("Request time skewed by {0} seconds")]
    ClockSkew(i64),

    /// The declared payload hash does not match the received body.
    #[error("Payload hash does not match the received body")]
    PayloadHashMismatch,

    /// The body exceeds the limit for signed-payload verification.
    #[error("Signed payload exceeds the {0}-byte verification limit")]
    PayloadTooLarge(usize),
}

impl AuthError {
    /// A stable label for per-failure-mode metrics.
    #[must_use]
    pub fn metric_label(&self) -> &'static str {
        match self {
            Self::MissingAuthHeader | Self::MalformedAuthHeader | Self::AuthHeaderTooLong(_) => {
                "signature_malformed"
            }
            Self::UnsupportedAlgorithm(_)
            | Self::InvalidCredential
            | Self::MissingHeader(_)
            | Self::UnsignableHeader(_) => "signature_malformed",
            Self::UnknownAccessKey(_) => "unknown_access_key",
            Self::RegionMismatch(..) | Self::SignatureMismatch => "signature_mismatch",
            Self::InvalidTimestamp(_) | Self::ClockSkew(_) => "clock_skew",
            Self::PayloadHashMismatch | Self::PayloadTooLarge(_) => "payload_hash_mismatch",
        }
    }
}
