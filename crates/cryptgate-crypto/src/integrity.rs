//! HMAC-SHA256 plaintext integrity for unauthenticated cipher modes.
//!
//! CTR provides no authentication, so the envelope carries an HMAC-SHA256
//! over the plaintext, keyed with the object's DEK. The streaming shape
//! ([`PlaintextHmac`]) lets the multipart engine and the download path feed
//! data incrementally; verification is constant-time.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::{CryptoError, Dek};

type HmacSha256 = Hmac<Sha256>;

/// An incremental HMAC-SHA256 over a plaintext stream.
#[derive(Clone)]
pub struct PlaintextHmac {
    mac: HmacSha256,
}

impl std::fmt::Debug for PlaintextHmac {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PlaintextHmac(..)")
    }
}

impl PlaintextHmac {
    /// Start a new HMAC keyed with the object DEK.
    #[must_use]
    pub fn new(dek: &Dek) -> Self {
        Self {
            mac: HmacSha256::new_from_slice(dek.as_bytes())
                .expect("HMAC accepts keys of any length"),
        }
    }

    /// Feed the next plaintext chunk.
    pub fn update(&mut self, data: &[u8]) {
        self.mac.update(data);
    }

    /// Finalize into the hex digest persisted in the envelope.
    #[must_use]
    pub fn finalize_hex(self) -> String {
        hex::encode(self.mac.finalize().into_bytes())
    }

    /// Finalize and verify against a persisted hex digest.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::IntegrityMismatch`] if the digest differs or
    /// is not valid hex.
    pub fn verify_hex(self, expected_hex: &str) -> Result<(), CryptoError> {
        let expected = hex::decode(expected_hex).map_err(|_| CryptoError::IntegrityMismatch)?;
        self.mac
            .verify_slice(&expected)
            .map_err(|_| CryptoError::IntegrityMismatch)
    }
}

/// One-shot HMAC of a full plaintext.
#[must_use]
pub fn compute_hex(dek: &Dek, plaintext: &[u8]) -> String {
    let mut mac = PlaintextHmac::new(dek);
    mac.update(plaintext);
    mac.finalize_hex()
}
