//! Error types for the envelope crypto layer.
//!
//! Cipher-level failures are deliberately opaque: no key material, nonce,
//! or primitive-level detail crosses this boundary. The HTTP layer maps
//! every variant here to a 500 `InternalError` except where noted.

/// Errors produced by the envelope crypto layer.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// No KEK with the given fingerprint is registered. Permanent until an
    /// operator registers the key.
    #[error("no KEK registered with fingerprint {0}")]
    UnknownKek(String),

    /// No provider alias with the given name is registered.
    #[error("no encryption provider registered with alias {0}")]
    UnknownAlias(String),

    /// No active KEK has been nominated for new encryptions.
    #[error("no active KEK configured")]
    NoActiveKek,

    /// Stored envelope metadata is incomplete or inconsistent.
    #[error("malformed encryption envelope: {0}")]
    MalformedEnvelope(String),

    /// HMAC verification over the decrypted plaintext failed.
    #[error("plaintext integrity verification failed")]
    IntegrityMismatch,

    /// A DEK wrap or unwrap operation failed.
    #[error("key wrap operation failed")]
    KeyWrap,

    /// A bulk cipher operation failed (e.g. GCM tag mismatch).
    #[error("cipher operation failed")]
    Cipher,

    /// The CTR keystream position is out of range for a 32-bit counter.
    #[error("CTR keystream offset out of range")]
    CounterOverflow,

    /// Provided key material has the wrong shape.
    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),
}
