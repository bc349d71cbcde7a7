//! AES-256-GCM single-shot encryption.
//!
//! Ciphertext layout: `nonce (12 bytes) || ciphertext+tag`. The associated
//! data binds the ciphertext to its storage location (`bucket:key`), which
//! blocks cut-and-paste of ciphertext between objects.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use rand::RngCore;
use rand::rngs::OsRng;
use tracing::debug;

use crate::{CryptoError, DataAlgorithm, DataEncryptor, Dek, GCM_NONCE_LEN, GCM_TAG_LEN, IV_LEN, SealedData};

/// Encrypt `plaintext` under `dek` with a fresh random nonce.
///
/// # Errors
///
/// Returns an opaque [`CryptoError::Cipher`] on failure.
pub fn encrypt(dek: &Dek, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(dek.as_bytes()).map_err(|_| CryptoError::Cipher)?;

    let mut nonce_bytes = [0u8; GCM_NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Cipher)?;

    let mut out = Vec::with_capacity(GCM_NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a `nonce || ciphertext+tag` blob under `dek`.
///
/// # Errors
///
/// Returns [`CryptoError::Cipher`] if the blob is too short, the tag does
/// not verify, or the associated data does not match.
pub fn decrypt(dek: &Dek, data: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < GCM_NONCE_LEN + GCM_TAG_LEN {
        debug!(len = data.len(), "GCM blob shorter than nonce + tag");
        return Err(CryptoError::Cipher);
    }

    let (nonce_bytes, ciphertext) = data.split_at(GCM_NONCE_LEN);
    let cipher = Aes256Gcm::new_from_slice(dek.as_bytes()).map_err(|_| CryptoError::Cipher)?;

    cipher
        .decrypt(
            Nonce::from_slice(nonce_bytes),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Cipher)
}

/// The AES-256-GCM [`DataEncryptor`].
#[derive(Debug, Default, Clone, Copy)]
pub struct GcmDataEncryptor;

impl DataEncryptor for GcmDataEncryptor {
    fn algorithm(&self) -> DataAlgorithm {
        DataAlgorithm::Aes256Gcm
    }

    fn encrypt(&self, dek: &Dek, plaintext: &[u8], aad: &[u8]) -> Result<SealedData, CryptoError> {
        Ok(SealedData {
            ciphertext: encrypt(dek, plaintext, aad)?,
            iv: None,
            hmac: None,
        })
    }

    fn decrypt(
        &self,
        dek: &Dek,
        ciphertext: &[u8],
        _iv: Option<&[u8; IV_LEN]>,
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        decrypt(dek, ciphertext, aad)
    }
}
