//! The envelope factory: KEK registry plus algorithm selection.
//!
//! The registry is read-mostly: every request resolves a KEK, while
//! registration happens once at startup (and rarely afterwards, e.g. when
//! an operator adds a decryption-only KEK for old objects). Reads therefore
//! go through an `ArcSwap` snapshot and take no lock; registration is
//! serialized by a mutex and publishes a new snapshot.
//!
//! [`EnvelopeFactory::create_envelope_encryptor`] is the single place the
//! data algorithm is chosen:
//!
//! | Class                          | Algorithm            |
//! |--------------------------------|----------------------|
//! | WHOLE, size ≤ threshold        | AES-256-GCM          |
//! | WHOLE, forced by content type  | AES-256-GCM          |
//! | WHOLE, above threshold         | AES-256-CTR + HMAC   |
//! | MULTIPART                      | AES-256-CTR + HMAC   |
//!
//! Multipart parts share one DEK, and a GCM nonce reused across parts would
//! be catastrophic; CTR's seekable keystream is what makes per-part
//! encryption compose into one decryptable object.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::ctr_stream::CtrDataEncryptor;
use crate::gcm::GcmDataEncryptor;
use crate::metadata::EnvelopeMetadata;
use crate::{
    CryptoError, DataAlgorithm, DataEncryptor, Dek, IV_LEN, KeyAlgorithm, KeyEncryptor,
    generate_iv, integrity,
};

/// Resolve the stateless data encryptor for an algorithm.
fn data_encryptor(algorithm: DataAlgorithm) -> &'static dyn DataEncryptor {
    static GCM: GcmDataEncryptor = GcmDataEncryptor;
    static CTR: CtrDataEncryptor = CtrDataEncryptor;
    match algorithm {
        DataAlgorithm::Aes256Gcm => &GCM,
        DataAlgorithm::Aes256CtrStreaming => &CTR,
    }
}

/// The shape of an upload, as seen at encryption time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentClass {
    /// A single-shot object of known size.
    Whole {
        /// Plaintext size in bytes.
        size: u64,
        /// Set when the client sent the force-GCM content type hint.
        force_gcm: bool,
    },
    /// A multipart upload; parts are encrypted independently over one
    /// continuous keystream.
    Multipart,
}

/// Secrets minted for a new multipart upload at Create time.
pub struct MultipartSecrets {
    /// The upload's DEK; shared by every part.
    pub dek: Dek,
    /// The CTR IV anchoring the upload's keystream.
    pub iv: [u8; IV_LEN],
    /// The DEK wrapped by the KEK below.
    pub wrapped_dek: Vec<u8>,
    /// Fingerprint of the wrapping KEK.
    pub kek_fingerprint: String,
    /// The wrapping algorithm.
    pub key_algorithm: KeyAlgorithm,
}

impl std::fmt::Debug for MultipartSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultipartSecrets")
            .field("kek_fingerprint", &self.kek_fingerprint)
            .field("key_algorithm", &self.key_algorithm)
            .finish_non_exhaustive()
    }
}

/// Result of a factory decryption.
#[derive(Debug)]
pub struct DecryptedData {
    /// The recovered plaintext.
    pub plaintext: Vec<u8>,
    /// HMAC verdict: `None` for authenticated modes (GCM authenticates
    /// inline), otherwise whether the envelope HMAC matched.
    pub hmac_valid: Option<bool>,
}

/// Whether [`EnvelopeFactory::decrypt_data`] should spend cycles on the
/// envelope HMAC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityCheck {
    /// Compute and compare the plaintext HMAC.
    Verify,
    /// Skip the HMAC entirely (integrity verification configured off).
    Skip,
}

/// Registry of KEKs and the composition point for envelope encryption.
pub struct EnvelopeFactory {
    keks: ArcSwap<HashMap<String, Arc<dyn KeyEncryptor>>>,
    register_lock: Mutex<()>,
    active_fingerprint: ArcSwap<Option<String>>,
    gcm_size_threshold: u64,
}

impl std::fmt::Debug for EnvelopeFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeFactory")
            .field("keks", &self.keks.load().len())
            .field("active_fingerprint", &self.active_fingerprint.load())
            .field("gcm_size_threshold", &self.gcm_size_threshold)
            .finish()
    }
}

impl EnvelopeFactory {
    /// Create an empty factory.
    #[must_use]
    pub fn new(gcm_size_threshold: u64) -> Self {
        Self {
            keks: ArcSwap::from_pointee(HashMap::new()),
            register_lock: Mutex::new(()),
            active_fingerprint: ArcSwap::from_pointee(None),
            gcm_size_threshold,
        }
    }

    /// Register a KEK. Idempotent by fingerprint: re-registering a key with
    /// the same fingerprint is a no-op.
    pub fn register_kek(&self, kek: Arc<dyn KeyEncryptor>) {
        let _guard = self.register_lock.lock();

        let current = self.keks.load();
        if current.contains_key(kek.fingerprint()) {
            return;
        }

        info!(
            alias = kek.name(),
            fingerprint = kek.fingerprint(),
            algorithm = %kek.algorithm(),
            "registered KEK"
        );

        let mut next: HashMap<_, _> = current.as_ref().clone();
        next.insert(kek.fingerprint().to_owned(), kek);
        self.keks.store(Arc::new(next));
    }

    /// Nominate the KEK registered under the given provider alias as the
    /// active key for new encryptions.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::UnknownAlias`] if no registered KEK carries
    /// that alias.
    pub fn activate(&self, alias: &str) -> Result<(), CryptoError> {
        let keks = self.keks.load();
        let kek = keks
            .values()
            .find(|k| k.name() == alias)
            .ok_or_else(|| CryptoError::UnknownAlias(alias.to_owned()))?;

        info!(alias, fingerprint = kek.fingerprint(), "activated KEK");
        self.active_fingerprint
            .store(Arc::new(Some(kek.fingerprint().to_owned())));
        Ok(())
    }

    /// Look up a KEK by fingerprint.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::UnknownKek`]; this is permanent until an
    /// operator registers the missing key.
    pub fn kek(&self, fingerprint: &str) -> Result<Arc<dyn KeyEncryptor>, CryptoError> {
        self.keks
            .load()
            .get(fingerprint)
            .cloned()
            .ok_or_else(|| CryptoError::UnknownKek(fingerprint.to_owned()))
    }

    /// The currently active KEK.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::NoActiveKek`] before [`Self::activate`] has
    /// succeeded.
    pub fn active_kek(&self) -> Result<Arc<dyn KeyEncryptor>, CryptoError> {
        let fp = self.active_fingerprint.load();
        let fp = fp.as_ref().as_ref().ok_or(CryptoError::NoActiveKek)?;
        self.kek(fp)
    }

    /// The algorithm selection rule. This is the only place the data
    /// algorithm is chosen.
    #[must_use]
    pub fn select_algorithm(&self, class: ContentClass) -> DataAlgorithm {
        match class {
            ContentClass::Whole { force_gcm: true, .. } => DataAlgorithm::Aes256Gcm,
            ContentClass::Whole { size, .. } if size <= self.gcm_size_threshold => {
                DataAlgorithm::Aes256Gcm
            }
            ContentClass::Whole { .. } | ContentClass::Multipart => {
                DataAlgorithm::Aes256CtrStreaming
            }
        }
    }

    /// Compose an envelope encryptor for the given class.
    ///
    /// `kek_fingerprint` of `None` selects the active KEK.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::UnknownKek`] or [`CryptoError::NoActiveKek`]
    /// when the KEK cannot be resolved.
    pub fn create_envelope_encryptor(
        &self,
        class: ContentClass,
        kek_fingerprint: Option<&str>,
    ) -> Result<EnvelopeEncryptor, CryptoError> {
        let kek = match kek_fingerprint {
            Some(fp) => self.kek(fp)?,
            None => self.active_kek()?,
        };

        Ok(EnvelopeEncryptor {
            kek,
            data: data_encryptor(self.select_algorithm(class)),
        })
    }

    /// Unwrap the DEK named by an envelope.
    ///
    /// Used by the streaming download path, which drives the cipher
    /// incrementally instead of going through [`Self::decrypt_data`].
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::UnknownKek`] or [`CryptoError::KeyWrap`].
    pub fn unwrap_dek(&self, metadata: &EnvelopeMetadata) -> Result<Dek, CryptoError> {
        let kek = self.kek(&metadata.kek_fingerprint)?;
        kek.decrypt_dek(&metadata.wrapped_dek)
    }

    /// Decrypt a stored object using its envelope metadata.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::UnknownKek`] for an unregistered fingerprint,
    /// [`CryptoError::MalformedEnvelope`] for inconsistent metadata, and
    /// [`CryptoError::Cipher`] for GCM authentication failures. An HMAC
    /// mismatch is NOT an error here — it is reported in
    /// [`DecryptedData::hmac_valid`] so the caller can apply the configured
    /// strict/lenient policy.
    pub fn decrypt_data(
        &self,
        ciphertext: &[u8],
        metadata: &EnvelopeMetadata,
        aad: &[u8],
        integrity: IntegrityCheck,
    ) -> Result<DecryptedData, CryptoError> {
        let dek = self.unwrap_dek(metadata)?;

        let encryptor = data_encryptor(metadata.data_algorithm);
        let plaintext = encryptor.decrypt(&dek, ciphertext, metadata.iv.as_ref(), aad)?;

        // GCM authenticates inline and carries no envelope HMAC, so the
        // match below is effectively CTR-only.
        let hmac_valid = match (integrity, metadata.hmac.as_deref()) {
            (IntegrityCheck::Skip, _) | (IntegrityCheck::Verify, None) => None,
            (IntegrityCheck::Verify, Some(expected)) => {
                let mut mac = integrity::PlaintextHmac::new(&dek);
                mac.update(&plaintext);
                let ok = mac.verify_hex(expected).is_ok();
                if !ok {
                    warn!(
                        kek_fingerprint = %metadata.kek_fingerprint,
                        "plaintext HMAC mismatch on decrypt"
                    );
                }
                Some(ok)
            }
        };

        Ok(DecryptedData {
            plaintext,
            hmac_valid,
        })
    }
}

/// Composition of one [`KeyEncryptor`] with one [`DataEncryptor`], produced
/// by the factory for a specific content class.
pub struct EnvelopeEncryptor {
    kek: Arc<dyn KeyEncryptor>,
    data: &'static dyn DataEncryptor,
}

impl std::fmt::Debug for EnvelopeEncryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeEncryptor")
            .field("kek_fingerprint", &self.kek.fingerprint())
            .field("algorithm", &self.data.algorithm())
            .finish()
    }
}

impl EnvelopeEncryptor {
    /// The selected data algorithm.
    #[must_use]
    pub fn algorithm(&self) -> DataAlgorithm {
        self.data.algorithm()
    }

    /// Encrypt a whole object and produce its envelope.
    ///
    /// # Errors
    ///
    /// Returns a [`CryptoError`] if encryption or DEK wrapping fails.
    pub fn seal(
        &self,
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<(Vec<u8>, EnvelopeMetadata), CryptoError> {
        let dek = self.data.generate_dek();
        let sealed = self.data.encrypt(&dek, plaintext, aad)?;

        let metadata = EnvelopeMetadata {
            wrapped_dek: self.kek.encrypt_dek(&dek)?,
            kek_fingerprint: self.kek.fingerprint().to_owned(),
            data_algorithm: self.data.algorithm(),
            key_algorithm: self.kek.algorithm(),
            iv: sealed.iv,
            hmac: sealed.hmac,
            multipart: false,
            original_length: plaintext.len() as u64,
        };

        Ok((sealed.ciphertext, metadata))
    }

    /// Mint the secrets for a new multipart upload: a fresh DEK and IV,
    /// with the DEK already wrapped for the envelope written at Complete.
    ///
    /// # Errors
    ///
    /// Returns a [`CryptoError`] if DEK wrapping fails.
    pub fn start_multipart(&self) -> Result<MultipartSecrets, CryptoError> {
        let dek = Dek::generate();
        let wrapped_dek = self.kek.encrypt_dek(&dek)?;

        Ok(MultipartSecrets {
            iv: generate_iv(),
            wrapped_dek,
            kek_fingerprint: self.kek.fingerprint().to_owned(),
            key_algorithm: self.kek.algorithm(),
            dek,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keywrap::AesKwKeyEncryptor;

    const THRESHOLD: u64 = 1024;

    fn factory_with_kek() -> EnvelopeFactory {
        let factory = EnvelopeFactory::new(THRESHOLD);
        factory.register_kek(Arc::new(
            AesKwKeyEncryptor::new("primary", &[7u8; 32]).expect("valid key"),
        ));
        factory.activate("primary").expect("should activate");
        factory
    }

    #[test]
    fn test_should_register_kek_idempotently() {
        let factory = EnvelopeFactory::new(THRESHOLD);
        let kek = Arc::new(AesKwKeyEncryptor::new("primary", &[7u8; 32]).expect("valid key"));
        factory.register_kek(kek.clone());
        factory.register_kek(kek.clone());
        assert!(factory.kek(kek.fingerprint()).is_ok());
    }

    #[test]
    fn test_should_fail_activation_of_unknown_alias() {
        let factory = EnvelopeFactory::new(THRESHOLD);
        assert!(matches!(
            factory.activate("missing"),
            Err(CryptoError::UnknownAlias(_))
        ));
    }

    #[test]
    fn test_should_fail_without_active_kek() {
        let factory = EnvelopeFactory::new(THRESHOLD);
        assert!(matches!(
            factory.active_kek(),
            Err(CryptoError::NoActiveKek)
        ));
    }

    #[test]
    fn test_should_select_gcm_for_small_whole_objects() {
        let factory = factory_with_kek();
        let class = ContentClass::Whole {
            size: THRESHOLD,
            force_gcm: false,
        };
        assert_eq!(factory.select_algorithm(class), DataAlgorithm::Aes256Gcm);
    }

    #[test]
    fn test_should_select_ctr_for_large_whole_objects() {
        let factory = factory_with_kek();
        let class = ContentClass::Whole {
            size: THRESHOLD + 1,
            force_gcm: false,
        };
        assert_eq!(
            factory.select_algorithm(class),
            DataAlgorithm::Aes256CtrStreaming
        );
    }

    #[test]
    fn test_should_honor_gcm_force_hint_over_size() {
        let factory = factory_with_kek();
        let class = ContentClass::Whole {
            size: THRESHOLD * 100,
            force_gcm: true,
        };
        assert_eq!(factory.select_algorithm(class), DataAlgorithm::Aes256Gcm);
    }

    #[test]
    fn test_should_select_ctr_for_multipart() {
        let factory = factory_with_kek();
        assert_eq!(
            factory.select_algorithm(ContentClass::Multipart),
            DataAlgorithm::Aes256CtrStreaming
        );
    }

    #[test]
    fn test_should_round_trip_gcm_envelope() {
        let factory = factory_with_kek();
        let encryptor = factory
            .create_envelope_encryptor(
                ContentClass::Whole {
                    size: 13,
                    force_gcm: false,
                },
                None,
            )
            .expect("should compose");

        let (ciphertext, metadata) = encryptor.seal(b"Hello, World!", b"b:k").expect("seals");
        assert_eq!(ciphertext.len(), 13 + 28);
        assert_eq!(metadata.original_length, 13);
        assert!(!metadata.multipart);

        let decrypted = factory
            .decrypt_data(&ciphertext, &metadata, b"b:k", IntegrityCheck::Verify)
            .expect("should decrypt");
        assert_eq!(decrypted.plaintext, b"Hello, World!");
        assert!(decrypted.hmac_valid.is_none());
    }

    #[test]
    fn test_should_round_trip_ctr_envelope() {
        let factory = factory_with_kek();
        let payload: Vec<u8> = (0..4096u32).map(|i| (i % 256) as u8).collect();
        let encryptor = factory
            .create_envelope_encryptor(ContentClass::Multipart, None)
            .expect("should compose");

        let (ciphertext, metadata) = encryptor.seal(&payload, b"b:k").expect("seals");
        assert_eq!(ciphertext.len(), payload.len());
        assert!(metadata.iv.is_some());
        assert!(metadata.hmac.is_some());

        let decrypted = factory
            .decrypt_data(&ciphertext, &metadata, b"b:k", IntegrityCheck::Verify)
            .expect("should decrypt");
        assert_eq!(decrypted.plaintext, payload);
        assert_eq!(decrypted.hmac_valid, Some(true));
    }

    #[test]
    fn test_should_bind_gcm_ciphertext_to_location() {
        let factory = factory_with_kek();
        let encryptor = factory
            .create_envelope_encryptor(
                ContentClass::Whole {
                    size: 6,
                    force_gcm: false,
                },
                None,
            )
            .expect("should compose");

        let (ciphertext, metadata) = encryptor.seal(b"secret", b"bucket:a").expect("seals");
        let result = factory.decrypt_data(&ciphertext, &metadata, b"bucket:b", IntegrityCheck::Verify);
        assert!(matches!(result, Err(CryptoError::Cipher)));
    }

    #[test]
    fn test_should_flag_hmac_mismatch_on_swapped_ctr_ciphertext() {
        let factory = factory_with_kek();
        let encryptor = factory
            .create_envelope_encryptor(ContentClass::Multipart, None)
            .expect("should compose");

        let (_ciphertext_a, metadata_a) = encryptor.seal(b"object a", b"b:a").expect("seals");
        let (ciphertext_b, _metadata_b) = encryptor.seal(b"object b", b"b:b").expect("seals");

        // Object B's stored bytes swapped under object A's envelope.
        let decrypted = factory
            .decrypt_data(&ciphertext_b, &metadata_a, b"b:a", IntegrityCheck::Verify)
            .expect("CTR decrypt itself cannot fail");
        assert_eq!(decrypted.hmac_valid, Some(false));
    }

    #[test]
    fn test_should_skip_hmac_when_disabled() {
        let factory = factory_with_kek();
        let encryptor = factory
            .create_envelope_encryptor(ContentClass::Multipart, None)
            .expect("should compose");

        let (ciphertext, metadata) = encryptor.seal(b"payload", b"b:k").expect("seals");
        let decrypted = factory
            .decrypt_data(&ciphertext, &metadata, b"b:k", IntegrityCheck::Skip)
            .expect("should decrypt");
        assert!(decrypted.hmac_valid.is_none());
    }

    #[test]
    fn test_should_fail_decrypt_with_unknown_fingerprint() {
        let factory = factory_with_kek();
        let encryptor = factory
            .create_envelope_encryptor(ContentClass::Multipart, None)
            .expect("should compose");
        let (ciphertext, mut metadata) = encryptor.seal(b"data", b"b:k").expect("seals");

        metadata.kek_fingerprint = "ff".repeat(32);
        assert!(matches!(
            factory.decrypt_data(&ciphertext, &metadata, b"b:k", IntegrityCheck::Verify),
            Err(CryptoError::UnknownKek(_))
        ));
    }

    #[test]
    fn test_should_mint_distinct_multipart_secrets() {
        let factory = factory_with_kek();
        let encryptor = factory
            .create_envelope_encryptor(ContentClass::Multipart, None)
            .expect("should compose");

        let a = encryptor.start_multipart().expect("should mint");
        let b = encryptor.start_multipart().expect("should mint");
        assert_ne!(a.dek.as_bytes(), b.dek.as_bytes(), "one DEK per upload");
        assert_ne!(a.iv, b.iv);
        assert_eq!(a.kek_fingerprint, b.kek_fingerprint);
    }
}
