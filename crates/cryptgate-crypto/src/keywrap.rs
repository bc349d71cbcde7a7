//! AES Key Wrap (RFC 3394) KEK.
//!
//! Wraps the 32-byte DEK under a 256-bit symmetric KEK loaded from the
//! provider configuration. The wrapped blob is 40 bytes (DEK + 8-byte
//! integrity check value).

use aes_kw::KekAes256;
use tracing::debug;

use crate::{CryptoError, DEK_LEN, Dek, KeyAlgorithm, KeyEncryptor, fingerprint};

/// A symmetric KEK applying AES-KW to DEKs.
pub struct AesKwKeyEncryptor {
    name: String,
    fingerprint: String,
    kek: KekAes256,
}

impl std::fmt::Debug for AesKwKeyEncryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesKwKeyEncryptor")
            .field("name", &self.name)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

impl AesKwKeyEncryptor {
    /// Build a KEK from raw 32-byte key material.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyMaterial`] if `key` is not exactly
    /// 32 bytes.
    pub fn new(name: impl Into<String>, key: &[u8]) -> Result<Self, CryptoError> {
        let key_array: [u8; DEK_LEN] = key.try_into().map_err(|_| {
            CryptoError::InvalidKeyMaterial("AES-KW KEK must be 32 bytes".to_owned())
        })?;

        Ok(Self {
            name: name.into(),
            fingerprint: fingerprint(KeyAlgorithm::AesKw, &key_array),
            kek: KekAes256::new(&key_array.into()),
        })
    }
}

impl KeyEncryptor for AesKwKeyEncryptor {
    fn algorithm(&self) -> KeyAlgorithm {
        KeyAlgorithm::AesKw
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    fn encrypt_dek(&self, dek: &Dek) -> Result<Vec<u8>, CryptoError> {
        self.kek.wrap_vec(dek.as_bytes()).map_err(|e| {
            debug!(error = %e, kek = %self.name, "AES-KW wrap failed");
            CryptoError::KeyWrap
        })
    }

    fn decrypt_dek(&self, wrapped: &[u8]) -> Result<Dek, CryptoError> {
        let unwrapped = self.kek.unwrap_vec(wrapped).map_err(|e| {
            debug!(error = %e, kek = %self.name, "AES-KW unwrap failed");
            CryptoError::KeyWrap
        })?;
        Dek::from_bytes(&unwrapped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_kek() -> AesKwKeyEncryptor {
        AesKwKeyEncryptor::new("test-kek", &[0x42u8; 32]).expect("valid key")
    }

    #[test]
    fn test_should_round_trip_dek() {
        let kek = test_kek();
        let dek = Dek::generate();

        let wrapped = kek.encrypt_dek(&dek).expect("should wrap");
        // RFC 3394: wrapped size is input + 8 bytes.
        assert_eq!(wrapped.len(), 40);

        let unwrapped = kek.decrypt_dek(&wrapped).expect("should unwrap");
        assert_eq!(unwrapped.as_bytes(), dek.as_bytes());
    }

    #[test]
    fn test_should_reject_wrong_key_material_length() {
        assert!(matches!(
            AesKwKeyEncryptor::new("short", &[0u8; 16]),
            Err(CryptoError::InvalidKeyMaterial(_))
        ));
    }

    #[test]
    fn test_should_reject_tampered_wrapped_dek() {
        let kek = test_kek();
        let mut wrapped = kek.encrypt_dek(&Dek::generate()).expect("should wrap");
        wrapped[0] ^= 0xff;
        assert!(matches!(
            kek.decrypt_dek(&wrapped),
            Err(CryptoError::KeyWrap)
        ));
    }

    #[test]
    fn test_should_reject_unwrap_under_different_kek() {
        let kek_a = test_kek();
        let kek_b = AesKwKeyEncryptor::new("other", &[0x99u8; 32]).expect("valid key");

        let wrapped = kek_a.encrypt_dek(&Dek::generate()).expect("should wrap");
        assert!(kek_b.decrypt_dek(&wrapped).is_err());
    }

    #[test]
    fn test_should_derive_fingerprint_from_key_material() {
        let a = AesKwKeyEncryptor::new("a", &[1u8; 32]).expect("valid key");
        let b = AesKwKeyEncryptor::new("b", &[1u8; 32]).expect("valid key");
        let c = AesKwKeyEncryptor::new("c", &[2u8; 32]).expect("valid key");

        // Same material, same fingerprint, regardless of alias.
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }
}
