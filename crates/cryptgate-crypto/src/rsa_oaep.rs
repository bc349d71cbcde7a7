//! RSA-OAEP-SHA256 KEK.
//!
//! Wraps DEKs under an RSA public key; unwrapping requires the private
//! half. A gateway deployed encrypt-only (private key held elsewhere) can
//! register the public half and will fail decryption with an opaque error.
//! The fingerprint is computed over the public key DER, so both halves of
//! a pair resolve to the same envelope handle.

use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePublicKey};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use tracing::debug;

use crate::{CryptoError, Dek, KeyAlgorithm, KeyEncryptor, fingerprint};

/// An RSA key pair (or public half) applying OAEP-SHA256 to DEKs.
pub struct RsaOaepKeyEncryptor {
    name: String,
    fingerprint: String,
    public: RsaPublicKey,
    private: Option<RsaPrivateKey>,
}

impl std::fmt::Debug for RsaOaepKeyEncryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RsaOaepKeyEncryptor")
            .field("name", &self.name)
            .field("fingerprint", &self.fingerprint)
            .field("has_private", &self.private.is_some())
            .finish()
    }
}

impl RsaOaepKeyEncryptor {
    /// Build from an in-memory key pair.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyMaterial`] if the public key cannot
    /// be DER-encoded for fingerprinting.
    pub fn new(name: impl Into<String>, private: RsaPrivateKey) -> Result<Self, CryptoError> {
        let public = RsaPublicKey::from(&private);
        let fp = public_fingerprint(&public)?;
        Ok(Self {
            name: name.into(),
            fingerprint: fp,
            public,
            private: Some(private),
        })
    }

    /// Build from a PKCS#8 PEM private key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyMaterial`] if the PEM does not
    /// parse.
    pub fn from_private_pem(name: impl Into<String>, pem: &str) -> Result<Self, CryptoError> {
        let private = RsaPrivateKey::from_pkcs8_pem(pem)
            .map_err(|e| CryptoError::InvalidKeyMaterial(format!("RSA private key: {e}")))?;
        Self::new(name, private)
    }

    /// Build an encrypt-only KEK from a public key PEM (SPKI).
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyMaterial`] if the PEM does not
    /// parse.
    pub fn from_public_pem(name: impl Into<String>, pem: &str) -> Result<Self, CryptoError> {
        let public = RsaPublicKey::from_public_key_pem(pem)
            .map_err(|e| CryptoError::InvalidKeyMaterial(format!("RSA public key: {e}")))?;
        let fp = public_fingerprint(&public)?;
        Ok(Self {
            name: name.into(),
            fingerprint: fp,
            public,
            private: None,
        })
    }
}

fn public_fingerprint(public: &RsaPublicKey) -> Result<String, CryptoError> {
    let der = public
        .to_public_key_der()
        .map_err(|e| CryptoError::InvalidKeyMaterial(format!("RSA public key DER: {e}")))?;
    Ok(fingerprint(KeyAlgorithm::RsaOaepSha256, der.as_bytes()))
}

impl KeyEncryptor for RsaOaepKeyEncryptor {
    fn algorithm(&self) -> KeyAlgorithm {
        KeyAlgorithm::RsaOaepSha256
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    fn encrypt_dek(&self, dek: &Dek) -> Result<Vec<u8>, CryptoError> {
        self.public
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), dek.as_bytes())
            .map_err(|e| {
                debug!(error = %e, kek = %self.name, "RSA-OAEP wrap failed");
                CryptoError::KeyWrap
            })
    }

    fn decrypt_dek(&self, wrapped: &[u8]) -> Result<Dek, CryptoError> {
        let private = self.private.as_ref().ok_or_else(|| {
            debug!(kek = %self.name, "decrypt requested but only the public half is registered");
            CryptoError::KeyWrap
        })?;

        let unwrapped = private
            .decrypt(Oaep::new::<Sha256>(), wrapped)
            .map_err(|e| {
                debug!(error = %e, kek = %self.name, "RSA-OAEP unwrap failed");
                CryptoError::KeyWrap
            })?;
        Dek::from_bytes(&unwrapped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> RsaPrivateKey {
        // 2048-bit keygen is slow; share one key across the module's tests.
        use std::sync::OnceLock;
        static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
        KEY.get_or_init(|| RsaPrivateKey::new(&mut OsRng, 2048).expect("keygen"))
            .clone()
    }

    #[test]
    fn test_should_round_trip_dek() {
        let kek = RsaOaepKeyEncryptor::new("rsa-kek", test_key()).expect("should build");
        let dek = Dek::generate();

        let wrapped = kek.encrypt_dek(&dek).expect("should wrap");
        assert_eq!(wrapped.len(), 256, "2048-bit RSA ciphertext");

        let unwrapped = kek.decrypt_dek(&wrapped).expect("should unwrap");
        assert_eq!(unwrapped.as_bytes(), dek.as_bytes());
    }

    #[test]
    fn test_should_fail_decrypt_with_public_half_only() {
        let full = RsaOaepKeyEncryptor::new("rsa-kek", test_key()).expect("should build");
        let public_pem = RsaPublicKey::from(&test_key())
            .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
            .expect("pem");
        let encrypt_only =
            RsaOaepKeyEncryptor::from_public_pem("rsa-pub", &public_pem).expect("should build");

        let wrapped = encrypt_only
            .encrypt_dek(&Dek::generate())
            .expect("should wrap");
        assert!(matches!(
            encrypt_only.decrypt_dek(&wrapped),
            Err(CryptoError::KeyWrap)
        ));
        // The full pair can unwrap what the public half wrapped.
        assert!(full.decrypt_dek(&wrapped).is_ok());
    }

    #[test]
    fn test_should_share_fingerprint_between_halves() {
        let full = RsaOaepKeyEncryptor::new("full", test_key()).expect("should build");
        let public_pem = RsaPublicKey::from(&test_key())
            .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
            .expect("pem");
        let public_only =
            RsaOaepKeyEncryptor::from_public_pem("pub", &public_pem).expect("should build");

        assert_eq!(full.fingerprint(), public_only.fingerprint());
    }

    #[test]
    fn test_should_reject_garbage_pem() {
        assert!(matches!(
            RsaOaepKeyEncryptor::from_private_pem("bad", "not a pem"),
            Err(CryptoError::InvalidKeyMaterial(_))
        ));
    }

    #[test]
    fn test_should_reject_tampered_wrapped_dek() {
        let kek = RsaOaepKeyEncryptor::new("rsa-kek", test_key()).expect("should build");
        let mut wrapped = kek.encrypt_dek(&Dek::generate()).expect("should wrap");
        wrapped[5] ^= 0x80;
        assert!(matches!(
            kek.decrypt_dek(&wrapped),
            Err(CryptoError::KeyWrap)
        ));
    }
}
