//! Envelope metadata header codec.
//!
//! The envelope is persisted as upstream user-metadata under a configurable
//! header prefix (default `x-s3ep-`):
//!
//! ```text
//! x-s3ep-dek:                <base64 wrapped DEK>
//! x-s3ep-kek-fingerprint:    <hex>
//! x-s3ep-data-algorithm:     aes-256-gcm | aes-256-ctr-streaming
//! x-s3ep-key-algorithm:      aes-kw | rsa-oaep-sha256
//! x-s3ep-iv:                 <base64, present iff CTR>
//! x-s3ep-hmac:               <hex, present iff unauthenticated>
//! x-s3ep-multipart:          true | false
//! x-s3ep-original-length:    <decimal>
//! ```
//!
//! An object carrying any prefixed header must carry every field its data
//! algorithm requires; a partial envelope is a fatal decode error, never a
//! silent pass-through.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::{CryptoError, DataAlgorithm, IV_LEN, KeyAlgorithm};

/// Default metadata header prefix.
pub const DEFAULT_PREFIX: &str = "x-s3ep-";

/// Envelope field suffixes under the configured prefix.
pub mod field {
    /// Wrapped DEK, base64.
    pub const DEK: &str = "dek";
    /// KEK fingerprint, hex.
    pub const KEK_FINGERPRINT: &str = "kek-fingerprint";
    /// Data encryption algorithm identifier.
    pub const DATA_ALGORITHM: &str = "data-algorithm";
    /// Key wrapping algorithm identifier.
    pub const KEY_ALGORITHM: &str = "key-algorithm";
    /// CTR initialization vector, base64.
    pub const IV: &str = "iv";
    /// Plaintext HMAC-SHA256, hex.
    pub const HMAC: &str = "hmac";
    /// Whether the object was written through the multipart engine.
    pub const MULTIPART: &str = "multipart";
    /// Plaintext byte count.
    pub const ORIGINAL_LENGTH: &str = "original-length";
}

/// The decoded per-object encryption envelope.
#[derive(Debug, Clone)]
pub struct EnvelopeMetadata {
    /// The DEK wrapped by the KEK named below.
    pub wrapped_dek: Vec<u8>,
    /// Fingerprint of the KEK needed to unwrap.
    pub kek_fingerprint: String,
    /// Bulk encryption algorithm.
    pub data_algorithm: DataAlgorithm,
    /// DEK wrapping algorithm.
    pub key_algorithm: KeyAlgorithm,
    /// CTR IV; `None` for GCM (whose nonce prefixes the ciphertext).
    pub iv: Option<[u8; IV_LEN]>,
    /// Plaintext HMAC hex; `None` for authenticated modes.
    pub hmac: Option<String>,
    /// Whether the object was assembled by the multipart engine.
    pub multipart: bool,
    /// Plaintext byte count.
    pub original_length: u64,
}

impl EnvelopeMetadata {
    /// Serialize into `(header-name, value)` pairs under `prefix`.
    #[must_use]
    pub fn to_headers(&self, prefix: &str) -> Vec<(String, String)> {
        let mut headers = vec![
            (
                format!("{prefix}{}", field::DEK),
                BASE64.encode(&self.wrapped_dek),
            ),
            (
                format!("{prefix}{}", field::KEK_FINGERPRINT),
                self.kek_fingerprint.clone(),
            ),
            (
                format!("{prefix}{}", field::DATA_ALGORITHM),
                self.data_algorithm.as_str().to_owned(),
            ),
            (
                format!("{prefix}{}", field::KEY_ALGORITHM),
                self.key_algorithm.as_str().to_owned(),
            ),
            (
                format!("{prefix}{}", field::MULTIPART),
                if self.multipart { "true" } else { "false" }.to_owned(),
            ),
            (
                format!("{prefix}{}", field::ORIGINAL_LENGTH),
                self.original_length.to_string(),
            ),
        ];

        if let Some(iv) = &self.iv {
            headers.push((format!("{prefix}{}", field::IV), BASE64.encode(iv)));
        }
        if let Some(hmac) = &self.hmac {
            headers.push((format!("{prefix}{}", field::HMAC), hmac.clone()));
        }

        headers
    }

    /// Decode an envelope from header pairs.
    ///
    /// Returns `Ok(None)` when no header carries the prefix — the object
    /// was stored as plaintext (written out-of-band) and passes through
    /// untouched.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::MalformedEnvelope`] if prefixed headers are
    /// present but the envelope is incomplete or any field fails to decode.
    pub fn from_headers<'a, I>(prefix: &str, headers: I) -> Result<Option<Self>, CryptoError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut wrapped_dek = None;
        let mut kek_fingerprint = None;
        let mut data_algorithm = None;
        let mut key_algorithm = None;
        let mut iv = None;
        let mut hmac = None;
        let mut multipart = None;
        let mut original_length = None;
        let mut any_prefixed = false;

        for (name, value) in headers {
            let lower = name.to_ascii_lowercase();
            let Some(suffix) = lower.strip_prefix(prefix) else {
                continue;
            };
            any_prefixed = true;

            match suffix {
                field::DEK => {
                    let decoded = BASE64.decode(value.trim()).map_err(|_| {
                        CryptoError::MalformedEnvelope("dek is not valid base64".to_owned())
                    })?;
                    wrapped_dek = Some(decoded);
                }
                field::KEK_FINGERPRINT => kek_fingerprint = Some(value.trim().to_owned()),
                field::DATA_ALGORITHM => data_algorithm = Some(DataAlgorithm::parse(value.trim())?),
                field::KEY_ALGORITHM => key_algorithm = Some(KeyAlgorithm::parse(value.trim())?),
                field::IV => {
                    let decoded = BASE64.decode(value.trim()).map_err(|_| {
                        CryptoError::MalformedEnvelope("iv is not valid base64".to_owned())
                    })?;
                    let arr: [u8; IV_LEN] = decoded.try_into().map_err(|_| {
                        CryptoError::MalformedEnvelope("iv must be 16 bytes".to_owned())
                    })?;
                    iv = Some(arr);
                }
                field::HMAC => hmac = Some(value.trim().to_owned()),
                field::MULTIPART => {
                    multipart = Some(match value.trim() {
                        "true" => true,
                        "false" => false,
                        other => {
                            return Err(CryptoError::MalformedEnvelope(format!(
                                "invalid multipart flag '{other}'"
                            )));
                        }
                    });
                }
                field::ORIGINAL_LENGTH => {
                    let parsed: u64 = value.trim().parse().map_err(|_| {
                        CryptoError::MalformedEnvelope(format!(
                            "invalid original-length '{value}'"
                        ))
                    })?;
                    original_length = Some(parsed);
                }
                // Unknown suffixes under our prefix are tolerated for
                // forward compatibility.
                _ => {}
            }
        }

        if !any_prefixed {
            return Ok(None);
        }

        let missing = |name: &str| CryptoError::MalformedEnvelope(format!("missing field {name}"));

        let data_algorithm = data_algorithm.ok_or_else(|| missing(field::DATA_ALGORITHM))?;
        let envelope = Self {
            wrapped_dek: wrapped_dek.ok_or_else(|| missing(field::DEK))?,
            kek_fingerprint: kek_fingerprint.ok_or_else(|| missing(field::KEK_FINGERPRINT))?,
            key_algorithm: key_algorithm.ok_or_else(|| missing(field::KEY_ALGORITHM))?,
            multipart: multipart.ok_or_else(|| missing(field::MULTIPART))?,
            original_length: original_length.ok_or_else(|| missing(field::ORIGINAL_LENGTH))?,
            iv,
            hmac,
            data_algorithm,
        };

        // Per-algorithm completeness: CTR needs the IV and (being
        // unauthenticated) the plaintext HMAC.
        if envelope.data_algorithm == DataAlgorithm::Aes256CtrStreaming {
            if envelope.iv.is_none() {
                return Err(missing(field::IV));
            }
            if envelope.hmac.is_none() {
                return Err(missing(field::HMAC));
            }
        }

        Ok(Some(envelope))
    }
}

/// Whether a header name belongs to the envelope (with or without the
/// `x-amz-meta-` transport prefix). Responses to clients must never carry
/// such a header.
#[must_use]
pub fn is_envelope_header(prefix: &str, name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    let logical = lower.strip_prefix("x-amz-meta-").unwrap_or(&lower);
    logical.starts_with(prefix)
}
