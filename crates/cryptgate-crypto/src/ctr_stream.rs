//! AES-256-CTR with a seekable keystream.
//!
//! The counter layout puts a 96-bit nonce in the high 12 IV bytes and a
//! 32-bit big-endian block counter in the low 4 bytes; the counter for the
//! byte at plaintext offset `O` is `IV + O/16`. Because the keystream is a
//! pure function of (DEK, IV, offset), independently encrypted multipart
//! parts concatenate into exactly the stream a single pass would have
//! produced — the keystream-continuity invariant the multipart engine
//! depends on. Part boundaries need not align to the 16-byte block size:
//! seeking handles the mid-block residual.

use ctr::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};

use crate::{
    CryptoError, DataAlgorithm, DataEncryptor, Dek, IV_LEN, SealedData, generate_iv, integrity,
};

type Ctr32BeAes256 = ctr::Ctr32BE<aes::Aes256>;

/// Apply the CTR keystream for (`dek`, `iv`) to `buf` in place, starting at
/// byte `offset` of the logical stream.
///
/// Encryption and decryption are the same operation.
///
/// # Errors
///
/// Returns [`CryptoError::CounterOverflow`] if `offset + buf.len()` runs
/// past the 32-bit block counter range.
pub fn apply_keystream_at(
    dek: &Dek,
    iv: &[u8; IV_LEN],
    offset: u64,
    buf: &mut [u8],
) -> Result<(), CryptoError> {
    let mut cipher = Ctr32BeAes256::new(dek.as_bytes().into(), iv.into());
    cipher
        .try_seek(offset)
        .map_err(|_| CryptoError::CounterOverflow)?;
    cipher
        .try_apply_keystream(buf)
        .map_err(|_| CryptoError::CounterOverflow)?;
    Ok(())
}

/// An incremental CTR transform over one logical stream.
///
/// Used on the download path to decrypt chunks as they arrive from the
/// upstream store without knowing the total length up front.
pub struct CtrStream {
    cipher: Ctr32BeAes256,
}

impl std::fmt::Debug for CtrStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CtrStream(..)")
    }
}

impl CtrStream {
    /// Start a stream at offset zero.
    #[must_use]
    pub fn new(dek: &Dek, iv: &[u8; IV_LEN]) -> Self {
        Self {
            cipher: Ctr32BeAes256::new(dek.as_bytes().into(), iv.into()),
        }
    }

    /// Transform the next chunk of the stream in place.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::CounterOverflow`] past the counter range.
    pub fn apply(&mut self, buf: &mut [u8]) -> Result<(), CryptoError> {
        self.cipher
            .try_apply_keystream(buf)
            .map_err(|_| CryptoError::CounterOverflow)
    }
}

/// The AES-256-CTR [`DataEncryptor`]: whole-object seal at offset zero,
/// with the plaintext HMAC the unauthenticated mode requires.
#[derive(Debug, Default, Clone, Copy)]
pub struct CtrDataEncryptor;

impl DataEncryptor for CtrDataEncryptor {
    fn algorithm(&self) -> DataAlgorithm {
        DataAlgorithm::Aes256CtrStreaming
    }

    fn encrypt(&self, dek: &Dek, plaintext: &[u8], aad: &[u8]) -> Result<SealedData, CryptoError> {
        let _ = aad; // location binding for CTR comes from the HMAC check
        let iv = generate_iv();
        let mut ciphertext = plaintext.to_vec();
        apply_keystream_at(dek, &iv, 0, &mut ciphertext)?;
        Ok(SealedData {
            ciphertext,
            iv: Some(iv),
            hmac: Some(integrity::compute_hex(dek, plaintext)),
        })
    }

    fn decrypt(
        &self,
        dek: &Dek,
        ciphertext: &[u8],
        iv: Option<&[u8; IV_LEN]>,
        _aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let iv = iv.ok_or_else(|| {
            CryptoError::MalformedEnvelope("CTR envelope without IV".to_owned())
        })?;
        let mut plaintext = ciphertext.to_vec();
        apply_keystream_at(dek, iv, 0, &mut plaintext)?;
        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_round_trip() {
        let dek = Dek::generate();
        let iv = generate_iv();

        let mut data = b"streaming ciphertext bytes".to_vec();
        apply_keystream_at(&dek, &iv, 0, &mut data).expect("should encrypt");
        assert_ne!(data, b"streaming ciphertext bytes");

        apply_keystream_at(&dek, &iv, 0, &mut data).expect("should decrypt");
        assert_eq!(data, b"streaming ciphertext bytes");
    }

    #[test]
    fn test_should_match_single_pass_when_split_at_block_boundary() {
        let dek = Dek::generate();
        let iv = generate_iv();
        let plaintext: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();

        let mut whole = plaintext.clone();
        apply_keystream_at(&dek, &iv, 0, &mut whole).expect("should encrypt");

        let (a, b) = plaintext.split_at(512);
        let mut part_a = a.to_vec();
        let mut part_b = b.to_vec();
        apply_keystream_at(&dek, &iv, 0, &mut part_a).expect("should encrypt");
        apply_keystream_at(&dek, &iv, 512, &mut part_b).expect("should encrypt");

        let mut joined = part_a;
        joined.extend_from_slice(&part_b);
        assert_eq!(joined, whole);
    }

    #[test]
    fn test_should_match_single_pass_when_split_mid_block() {
        let dek = Dek::generate();
        let iv = generate_iv();
        let plaintext: Vec<u8> = (0..200u32).map(|i| (i * 7 % 256) as u8).collect();

        let mut whole = plaintext.clone();
        apply_keystream_at(&dek, &iv, 0, &mut whole).expect("should encrypt");

        // 13 and 187 are both unaligned to the 16-byte block size.
        let (a, rest) = plaintext.split_at(13);
        let (b, c) = rest.split_at(100);
        let mut parts = Vec::new();
        for (chunk, offset) in [(a, 0u64), (b, 13), (c, 113)] {
            let mut buf = chunk.to_vec();
            apply_keystream_at(&dek, &iv, offset, &mut buf).expect("should encrypt");
            parts.extend_from_slice(&buf);
        }
        assert_eq!(parts, whole);
    }

    #[test]
    fn test_should_match_incremental_stream() {
        let dek = Dek::generate();
        let iv = generate_iv();
        let plaintext: Vec<u8> = (0..4096u32).map(|i| (i % 256) as u8).collect();

        let mut whole = plaintext.clone();
        apply_keystream_at(&dek, &iv, 0, &mut whole).expect("should encrypt");

        let mut stream = CtrStream::new(&dek, &iv);
        let mut incremental = Vec::new();
        for chunk in plaintext.chunks(33) {
            let mut buf = chunk.to_vec();
            stream.apply(&mut buf).expect("should apply");
            incremental.extend_from_slice(&buf);
        }
        assert_eq!(incremental, whole);
    }

    #[test]
    fn test_should_differ_across_ivs() {
        let dek = Dek::generate();
        let mut a = b"identical plaintext".to_vec();
        let mut b = a.clone();
        apply_keystream_at(&dek, &generate_iv(), 0, &mut a).expect("should encrypt");
        apply_keystream_at(&dek, &generate_iv(), 0, &mut b).expect("should encrypt");
        assert_ne!(a, b);
    }
}
