//! The gateway: construction and the plumbing shared by all operations.
//!
//! A [`Gateway`] ties together the validated configuration, the envelope
//! factory (absent when the `none` provider is active), the upstream
//! client, the multipart state table, and the metrics counters. The
//! encrypting pipelines live in `object.rs` and `multipart.rs`; this
//! module owns construction, header splicing, and the pass-through path
//! used by every operation the gateway does not interpose on.

use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, Method};
use tracing::warn;

use cryptgate_crypto::keywrap::AesKwKeyEncryptor;
use cryptgate_crypto::metadata::is_envelope_header;
use cryptgate_crypto::rsa_oaep::RsaOaepKeyEncryptor;
use cryptgate_crypto::{EnvelopeFactory, EnvelopeMetadata};
use cryptgate_model::S3Error;

use crate::config::{ConfigError, GatewayConfig, ProviderKind};
use crate::error::upstream_error_to_s3;
use crate::metrics::Metrics;
use crate::multipart::MultipartTable;
use crate::upstream::{UpstreamClient, UpstreamRequest, UpstreamResponse};

/// The encrypting gateway core.
pub struct Gateway {
    pub(crate) config: Arc<GatewayConfig>,
    /// `None` when the active provider is `none` (transparent passthrough).
    pub(crate) factory: Option<Arc<EnvelopeFactory>>,
    pub(crate) upstream: Arc<dyn UpstreamClient>,
    pub(crate) uploads: MultipartTable,
    pub(crate) metrics: Arc<Metrics>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("encryption", &self.factory.is_some())
            .field("active_uploads", &self.uploads.len())
            .finish_non_exhaustive()
    }
}

impl Gateway {
    /// Build a gateway from configuration, loading KEK material from disk.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if key material cannot be loaded.
    pub fn new(
        config: GatewayConfig,
        upstream: Arc<dyn UpstreamClient>,
    ) -> Result<Self, ConfigError> {
        let factory = build_encryption(&config)?;
        Ok(Self::from_parts(config, factory, upstream))
    }

    /// Build a gateway from pre-constructed parts (used by tests and by
    /// callers that assemble the factory themselves).
    #[must_use]
    pub fn from_parts(
        config: GatewayConfig,
        factory: Option<Arc<EnvelopeFactory>>,
        upstream: Arc<dyn UpstreamClient>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            factory,
            upstream,
            uploads: MultipartTable::new(),
            metrics: Arc::new(Metrics::new()),
        }
    }

    /// The gateway configuration.
    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// The shared metrics counters.
    #[must_use]
    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    /// The configured envelope metadata prefix.
    #[must_use]
    pub fn metadata_prefix(&self) -> &str {
        &self.config.encryption.metadata_key_prefix
    }

    /// Forward a request upstream untouched (modulo header sanitation and
    /// re-signing). Used for bucket operations, list operations, and every
    /// sub-resource the gateway does not interpose on.
    ///
    /// # Errors
    ///
    /// Returns a 500 `S3Error` on upstream transport failure.
    pub async fn passthrough(
        &self,
        method: Method,
        path: String,
        query: String,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<UpstreamResponse, S3Error> {
        let request = UpstreamRequest::new(method, path, query)
            .with_headers(sanitize_for_upstream(headers, self.metadata_prefix()))
            .with_body(body);

        let response = self.send_upstream(request).await?;
        Ok(self.filtered(response))
    }

    /// Execute one upstream request, counting transport failures.
    pub(crate) async fn send_upstream(
        &self,
        request: UpstreamRequest,
    ) -> Result<UpstreamResponse, S3Error> {
        self.upstream.execute(request).await.map_err(|e| {
            self.metrics.record_upstream_error();
            warn!(error = %e, "upstream request failed");
            upstream_error_to_s3(e)
        })
    }

    /// Scrub a response before it reaches a client: hop-by-hop headers and
    /// every envelope header (bare or transport-prefixed) are removed.
    pub(crate) fn filtered(&self, mut response: UpstreamResponse) -> UpstreamResponse {
        let prefix = self.metadata_prefix();
        let names: Vec<http::header::HeaderName> = response
            .headers
            .keys()
            .filter(|name| {
                let lower = name.as_str();
                cryptgate_auth::canonical::is_hop_by_hop(lower)
                    || is_envelope_header(prefix, lower)
            })
            .cloned()
            .collect();
        for name in names {
            response.headers.remove(name);
        }
        response
    }
}

/// Build the envelope factory from the provider configuration.
///
/// Returns `Ok(None)` when the active provider is `none`: the gateway
/// becomes a transparent proxy, loudly.
///
/// # Errors
///
/// Returns a [`ConfigError`] if a key file is missing or malformed.
pub fn build_encryption(config: &GatewayConfig) -> Result<Option<Arc<EnvelopeFactory>>, ConfigError> {
    let enc = &config.encryption;
    let active = config
        .active_provider()
        .expect("validated config names an active provider");

    if active.kind == ProviderKind::None {
        warn!(
            alias = %active.alias,
            "active encryption provider is 'none': objects will be stored in PLAINTEXT"
        );
        return Ok(None);
    }

    let factory = EnvelopeFactory::new(enc.gcm_size_threshold);

    for provider in &enc.providers {
        match provider.kind {
            ProviderKind::AesGcm | ProviderKind::AesCtr => {
                let path = provider
                    .config
                    .key_file
                    .as_ref()
                    .expect("validated config has key_file");
                let key = std::fs::read(path).map_err(|source| ConfigError::Io {
                    path: path.clone(),
                    source,
                })?;
                let kek = AesKwKeyEncryptor::new(&provider.alias, &key).map_err(|e| {
                    ConfigError::Invalid(format!("provider '{}': {e}", provider.alias))
                })?;
                factory.register_kek(Arc::new(kek));
            }
            ProviderKind::RsaEnvelope => {
                let kek = if let Some(path) = &provider.config.private_key_file {
                    let pem =
                        std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                            path: path.clone(),
                            source,
                        })?;
                    RsaOaepKeyEncryptor::from_private_pem(&provider.alias, &pem)
                } else {
                    let path = provider
                        .config
                        .public_key_file
                        .as_ref()
                        .expect("validated config has a key file");
                    let pem =
                        std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                            path: path.clone(),
                            source,
                        })?;
                    RsaOaepKeyEncryptor::from_public_pem(&provider.alias, &pem)
                };
                let kek = kek.map_err(|e| {
                    ConfigError::Invalid(format!("provider '{}': {e}", provider.alias))
                })?;
                factory.register_kek(Arc::new(kek));
            }
            ProviderKind::None => {
                // Registered but inactive passthrough providers have no key
                // material to load.
            }
        }
    }

    factory
        .activate(&active.alias)
        .map_err(|e| ConfigError::Invalid(e.to_string()))?;

    Ok(Some(Arc::new(factory)))
}

/// Headers a client PUT may carry through to the upstream store.
///
/// Whitelist-based: representation headers, a few `x-amz-` control
/// headers, and user metadata. Client-supplied envelope fields are
/// dropped — clients must not be able to forge or clobber the envelope.
pub(crate) fn forwardable_client_headers(headers: &HeaderMap, prefix: &str) -> HeaderMap {
    const PASS: &[&str] = &[
        "content-type",
        "cache-control",
        "content-disposition",
        "content-encoding",
        "content-language",
        "expires",
        "x-amz-acl",
        "x-amz-storage-class",
        "x-amz-tagging",
    ];

    let mut out = HeaderMap::new();
    for (name, value) in headers {
        let lower = name.as_str().to_ascii_lowercase();
        let forward = PASS.contains(&lower.as_str())
            || (lower.starts_with("x-amz-meta-") && !is_envelope_header(prefix, &lower));
        if forward {
            out.insert(name.clone(), value.clone());
        }
    }
    out
}

/// Sanitize arbitrary client headers for an upstream pass-through: strip
/// hop-by-hop headers, inbound auth material, and anything envelope-shaped.
pub(crate) fn sanitize_for_upstream(headers: &HeaderMap, prefix: &str) -> HeaderMap {
    const DROP: &[&str] = &[
        "authorization",
        "host",
        "x-amz-date",
        "x-amz-content-sha256",
        "content-length",
        "expect",
    ];

    let mut out = HeaderMap::new();
    for (name, value) in headers {
        let lower = name.as_str().to_ascii_lowercase();
        if DROP.contains(&lower.as_str())
            || cryptgate_auth::canonical::is_hop_by_hop(&lower)
            || is_envelope_header(prefix, &lower)
        {
            continue;
        }
        out.insert(name.clone(), value.clone());
    }
    out
}

/// Attach envelope metadata to an upstream write as user-metadata headers
/// (the upstream only round-trips custom metadata under `x-amz-meta-`).
pub(crate) fn attach_envelope(headers: &mut HeaderMap, metadata: &EnvelopeMetadata, prefix: &str) {
    for (name, value) in metadata.to_headers(prefix) {
        let transport = format!("x-amz-meta-{name}");
        if let (Ok(header_name), Ok(header_value)) = (
            transport.parse::<http::header::HeaderName>(),
            value.parse::<http::header::HeaderValue>(),
        ) {
            headers.insert(header_name, header_value);
        }
    }
}

/// Decode the envelope, if any, from upstream response headers.
///
/// Accepts both the transport-prefixed (`x-amz-meta-x-s3ep-*`) and bare
/// (`x-s3ep-*`) forms, since upstreams differ in what they echo back.
pub(crate) fn extract_envelope(
    headers: &HeaderMap,
    prefix: &str,
) -> Result<Option<EnvelopeMetadata>, cryptgate_crypto::CryptoError> {
    let logical: Vec<(String, String)> = headers
        .iter()
        .filter_map(|(name, value)| {
            let lower = name.as_str().to_ascii_lowercase();
            let logical_name = lower
                .strip_prefix("x-amz-meta-")
                .unwrap_or(&lower)
                .to_owned();
            value
                .to_str()
                .ok()
                .map(|v| (logical_name, v.to_owned()))
        })
        .collect();

    EnvelopeMetadata::from_headers(prefix, logical.iter().map(|(k, v)| (k.as_str(), v.as_str())))
}

/// The associated data binding a ciphertext to its storage location.
#[must_use]
pub(crate) fn object_aad(bucket: &str, key: &str) -> Vec<u8> {
    format!("{bucket}:{key}").into_bytes()
}
