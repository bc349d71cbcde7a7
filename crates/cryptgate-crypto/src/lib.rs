//! Envelope encryption for the cryptgate gateway.
//!
//! Every object stored upstream is encrypted under a fresh Data Encryption
//! Key (DEK); the DEK itself is wrapped by a long-lived Key Encryption Key
//! (KEK) and travels alongside the ciphertext as upstream user metadata.
//! The moving parts:
//!
//! - [`DataEncryptor`] — bulk encryption: AES-256-GCM (authenticated,
//!   single-shot) or AES-256-CTR (streaming, paired with an HMAC).
//! - [`KeyEncryptor`] — DEK wrapping: AES-KW (RFC 3394) or RSA-OAEP-SHA256.
//!   Identified by a fingerprint over its key material, which is the only
//!   cross-restart handle persisted in envelopes.
//! - [`EnvelopeFactory`] — holds the KEK registry, picks the data algorithm
//!   from the content class, and composes the two into an
//!   [`EnvelopeEncryptor`].
//! - [`EnvelopeMetadata`] — the header-codec for the persisted envelope.
//!
//! The algorithm choice lives in exactly one place
//! ([`EnvelopeFactory::create_envelope_encryptor`]): GCM for whole objects
//! up to the configured threshold (or when forced by content type), CTR for
//! everything that needs a resumable keystream. Reusing a GCM nonce across
//! multipart parts would be catastrophic, hence CTR for that class.

pub mod ctr_stream;
pub mod error;
pub mod factory;
pub mod gcm;
pub mod integrity;
pub mod keywrap;
pub mod metadata;
pub mod rsa_oaep;

use std::fmt;

use rand::RngCore;
use rand::rngs::OsRng;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub use error::CryptoError;
pub use factory::{ContentClass, EnvelopeEncryptor, EnvelopeFactory};
pub use metadata::EnvelopeMetadata;

/// DEK length in bytes (AES-256).
pub const DEK_LEN: usize = 32;

/// CTR initialization vector length in bytes.
pub const IV_LEN: usize = 16;

/// GCM nonce length in bytes.
pub const GCM_NONCE_LEN: usize = 12;

/// GCM authentication tag length in bytes.
pub const GCM_TAG_LEN: usize = 16;

/// A per-object data encryption key. Zeroed on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Dek([u8; DEK_LEN]);

impl Dek {
    /// Generate a fresh random DEK.
    #[must_use]
    pub fn generate() -> Self {
        let mut key = [0u8; DEK_LEN];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    /// Construct a DEK from raw bytes (e.g. after unwrapping).
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyMaterial`] if `bytes` is not exactly
    /// 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; DEK_LEN] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyMaterial("DEK must be 32 bytes".to_owned()))?;
        Ok(Self(key))
    }

    /// The raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; DEK_LEN] {
        &self.0
    }
}

impl fmt::Debug for Dek {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Dek(..)")
    }
}

/// Generate a random CTR initialization vector.
#[must_use]
pub fn generate_iv() -> [u8; IV_LEN] {
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);
    iv
}

/// The bulk data encryption algorithm recorded in an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataAlgorithm {
    /// AES-256-GCM, authenticated, nonce prefixed to the ciphertext.
    Aes256Gcm,
    /// AES-256-CTR with a continuous keystream; integrity via envelope HMAC.
    Aes256CtrStreaming,
}

impl DataAlgorithm {
    /// The identifier persisted in envelope metadata.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aes256Gcm => "aes-256-gcm",
            Self::Aes256CtrStreaming => "aes-256-ctr-streaming",
        }
    }

    /// Parse a persisted identifier.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::MalformedEnvelope`] for unknown identifiers.
    pub fn parse(s: &str) -> Result<Self, CryptoError> {
        match s {
            "aes-256-gcm" => Ok(Self::Aes256Gcm),
            "aes-256-ctr-streaming" => Ok(Self::Aes256CtrStreaming),
            other => Err(CryptoError::MalformedEnvelope(format!(
                "unknown data algorithm '{other}'"
            ))),
        }
    }

    /// The ciphertext overhead in bytes relative to the plaintext.
    #[must_use]
    pub fn overhead(&self) -> u64 {
        match self {
            Self::Aes256Gcm => (GCM_NONCE_LEN + GCM_TAG_LEN) as u64,
            Self::Aes256CtrStreaming => 0,
        }
    }
}

impl fmt::Display for DataAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The DEK wrapping algorithm recorded in an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    /// AES Key Wrap (RFC 3394) under a 256-bit KEK.
    AesKw,
    /// RSA-OAEP with SHA-256.
    RsaOaepSha256,
}

impl KeyAlgorithm {
    /// The identifier persisted in envelope metadata.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AesKw => "aes-kw",
            Self::RsaOaepSha256 => "rsa-oaep-sha256",
        }
    }

    /// Parse a persisted identifier.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::MalformedEnvelope`] for unknown identifiers.
    pub fn parse(s: &str) -> Result<Self, CryptoError> {
        match s {
            "aes-kw" => Ok(Self::AesKw),
            "rsa-oaep-sha256" => Ok(Self::RsaOaepSha256),
            other => Err(CryptoError::MalformedEnvelope(format!(
                "unknown key algorithm '{other}'"
            ))),
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of a [`DataEncryptor`] seal: the ciphertext plus whatever the
/// algorithm needs persisted alongside it.
#[derive(Debug)]
pub struct SealedData {
    /// The ciphertext (for GCM, nonce-prefixed and tag-suffixed).
    pub ciphertext: Vec<u8>,
    /// CTR IV; `None` for GCM.
    pub iv: Option<[u8; IV_LEN]>,
    /// Plaintext HMAC hex; `None` for authenticated modes.
    pub hmac: Option<String>,
}

/// Capability set of a bulk data encryption algorithm.
///
/// Implementations are stateless; the [`EnvelopeFactory`] selects one at
/// construction time from the content class and pairs it with a
/// [`KeyEncryptor`] — no runtime subtype inspection anywhere.
pub trait DataEncryptor: Send + Sync {
    /// The algorithm identifier persisted in envelopes.
    fn algorithm(&self) -> DataAlgorithm;

    /// Generate a DEK suitable for this algorithm.
    fn generate_dek(&self) -> Dek {
        Dek::generate()
    }

    /// Encrypt a whole plaintext under `dek`.
    ///
    /// # Errors
    ///
    /// Returns an opaque [`CryptoError`] on cipher failure.
    fn encrypt(&self, dek: &Dek, plaintext: &[u8], aad: &[u8]) -> Result<SealedData, CryptoError>;

    /// Decrypt a whole ciphertext under `dek`.
    ///
    /// `iv` is the persisted envelope IV (required for CTR, ignored for
    /// GCM). Integrity of unauthenticated modes is the caller's concern;
    /// this returns the raw keystream output.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Cipher`] for authentication failures and
    /// [`CryptoError::MalformedEnvelope`] when a required IV is missing.
    fn decrypt(
        &self,
        dek: &Dek,
        ciphertext: &[u8],
        iv: Option<&[u8; IV_LEN]>,
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;
}

/// Capability set of a Key Encryption Key: wrap and unwrap DEKs.
///
/// Implementations are registered with the [`EnvelopeFactory`] and selected
/// by fingerprint at decryption time.
pub trait KeyEncryptor: Send + Sync {
    /// The wrapping algorithm.
    fn algorithm(&self) -> KeyAlgorithm;

    /// The operator-facing name (the configured provider alias).
    fn name(&self) -> &str;

    /// A stable hex fingerprint over the key material and algorithm id.
    fn fingerprint(&self) -> &str;

    /// Wrap a DEK for persistence.
    ///
    /// # Errors
    ///
    /// Returns an opaque [`CryptoError::KeyWrap`] on failure; the cause is
    /// logged, never surfaced.
    fn encrypt_dek(&self, dek: &Dek) -> Result<Vec<u8>, CryptoError>;

    /// Unwrap a persisted DEK.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyWrap`] if the wrapped blob is invalid for
    /// this KEK.
    fn decrypt_dek(&self, wrapped: &[u8]) -> Result<Dek, CryptoError>;
}

/// Compute the hex fingerprint of a KEK from its algorithm id and key
/// material.
///
/// The fingerprint is the sole cross-restart handle recorded in persisted
/// envelopes, so the inputs must be stable: the algorithm identifier and
/// the canonical encoding of the key (raw bytes for symmetric keys, public
/// key DER for RSA).
#[must_use]
pub fn fingerprint(algorithm: KeyAlgorithm, key_material: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(algorithm.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(key_material);
    hex::encode(hasher.finalize())
}
