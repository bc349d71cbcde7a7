//! Error mapping to the S3 surface.
//!
//! The crypto layer never leaks key material or primitive-level causes,
//! and upstream failures keep their S3 error codes; everything else maps
//! onto the small set of codes in `cryptgate-model`. All of the mapping
//! the HTTP boundary needs lives here.

use cryptgate_auth::AuthError;
use cryptgate_crypto::CryptoError;
use cryptgate_model::xml::XmlError;
use cryptgate_model::{S3Error, S3ErrorCode};

use crate::upstream::UpstreamError;

/// Map an authentication failure to its client-visible S3 error.
///
/// Every variant surfaces as a 403; the distinction is the code the client
/// sees and the label metrics record.
#[must_use]
pub fn auth_error_to_s3(err: &AuthError) -> S3Error {
    let code = match err {
        AuthError::UnknownAccessKey(_) => S3ErrorCode::InvalidAccessKeyId,
        AuthError::SignatureMismatch | AuthError::RegionMismatch(..) => {
            S3ErrorCode::SignatureDoesNotMatch
        }
        AuthError::ClockSkew(_) | AuthError::InvalidTimestamp(_) => {
            S3ErrorCode::RequestTimeTooSkewed
        }
        AuthError::PayloadHashMismatch | AuthError::PayloadTooLarge(_) => {
            S3ErrorCode::XAmzContentSHA256Mismatch
        }
        AuthError::MissingAuthHeader
        | AuthError::MalformedAuthHeader
        | AuthError::AuthHeaderTooLong(_)
        | AuthError::UnsupportedAlgorithm(_)
        | AuthError::MissingHeader(_)
        | AuthError::UnsignableHeader(_)
        | AuthError::InvalidCredential => S3ErrorCode::AccessDenied,
    };
    S3Error::with_message(code, err.to_string())
}

/// Map a crypto failure to its client-visible S3 error.
///
/// All crypto failures are 500s: a malformed envelope, an unknown KEK, or
/// a cipher failure on a stored object is an operator problem, never the
/// client's.
#[must_use]
pub fn crypto_error_to_s3(err: CryptoError) -> S3Error {
    let message = match &err {
        CryptoError::UnknownKek(fp) => format!("no KEK registered for fingerprint {fp}"),
        CryptoError::MalformedEnvelope(_) => "stored object has a malformed encryption envelope".to_owned(),
        CryptoError::IntegrityMismatch => "stored object failed integrity verification".to_owned(),
        _ => "encryption operation failed".to_owned(),
    };
    S3Error::internal_error(message).with_source(err)
}

/// Map an upstream transport failure to its client-visible S3 error.
///
/// Upstream HTTP *responses* (4xx/5xx) are mirrored to the client verbatim
/// and never reach this function; this covers connection-level failures
/// only.
#[must_use]
pub fn upstream_error_to_s3(err: UpstreamError) -> S3Error {
    S3Error::internal_error("upstream request failed").with_source(err)
}

/// Map an XML failure in a client-supplied body to `MalformedXML`.
#[must_use]
pub fn client_xml_error_to_s3(err: XmlError) -> S3Error {
    S3Error::with_message(S3ErrorCode::MalformedXML, err.to_string())
}
