//! Gateway configuration.
//!
//! Configuration is a YAML file selected by `CRYPTGATE_CONFIG` (or a CLI
//! argument), with environment overrides for the operational knobs:
//! `CRYPTGATE_LISTEN` for the bind address and `LOG_LEVEL` / `RUST_LOG` for
//! logging. Everything is validated at load; the process refuses to start
//! on an invalid file.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use cryptgate_auth::verify::VerifyPolicy;
use cryptgate_auth::{CredentialRecord, ServiceCredentials, StaticCredentialProvider};

/// Errors produced while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("cannot read config file {path}: {source}")]
    Io {
        /// Path of the unreadable file.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// The config file is not valid YAML for the expected shape.
    #[error("invalid config: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// The config parsed but failed a validation rule.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    /// Listener socket, e.g. `0.0.0.0:9000`.
    pub bind_address: String,
    /// Upstream S3 endpoint URL.
    pub target_endpoint: String,
    /// Service access key registered with the upstream store.
    pub access_key_id: String,
    /// Matching service secret key.
    pub secret_key: String,
    /// Upstream signing region.
    pub region: String,
    /// Client credentials accepted on the inbound side.
    pub s3_clients: Vec<ClientCredential>,
    /// Envelope encryption settings.
    pub encryption: EncryptionConfig,
    /// Optional listener TLS.
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    /// Request limits and timeouts.
    #[serde(default)]
    pub limits: Limits,
    /// Log level filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// When set, requests addressed virtual-hosted style against this
    /// domain (`<bucket>.<domain>`) are rejected with 400; path-style
    /// addressing is mandatory.
    #[serde(default)]
    pub virtual_host_domain: Option<String>,
}

/// One inbound client credential.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientCredential {
    /// Access key ID.
    pub access_key: String,
    /// Secret key.
    pub secret_key: String,
    /// Optional region binding for the credential scope.
    #[serde(default)]
    pub region: Option<String>,
}

/// Envelope encryption settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EncryptionConfig {
    /// Alias of the provider used for new encryptions.
    pub encryption_method_alias: String,
    /// Header prefix for envelope metadata.
    #[serde(default = "default_metadata_prefix")]
    pub metadata_key_prefix: String,
    /// Plaintext integrity verification mode for unauthenticated ciphers.
    #[serde(default)]
    pub integrity_verification: IntegrityMode,
    /// Whole-object size threshold up to which GCM is selected.
    #[serde(default = "default_gcm_threshold")]
    pub gcm_size_threshold: u64,
    /// Idle TTL after which orphaned multipart upload state is reaped.
    #[serde(default = "default_multipart_ttl")]
    pub multipart_idle_ttl_secs: u64,
    /// Registered encryption providers.
    pub providers: Vec<ProviderConfig>,
}

/// One registered encryption provider.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    /// Operator-facing provider alias.
    pub alias: String,
    /// The provider type.
    #[serde(rename = "type")]
    pub kind: ProviderKind,
    /// Key material locations.
    #[serde(default)]
    pub config: ProviderKeyConfig,
}

/// Provider type. The type selects the KEK scheme; the data algorithm is
/// chosen per object by content class, never by provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ProviderKind {
    /// AES-KW KEK from a 32-byte key file.
    #[serde(rename = "aes-gcm")]
    AesGcm,
    /// AES-KW KEK from a 32-byte key file (alias kept for config
    /// compatibility; identical to `aes-gcm` at the KEK level).
    #[serde(rename = "aes-ctr")]
    AesCtr,
    /// RSA-OAEP-SHA256 KEK from PEM key files.
    #[serde(rename = "rsa-envelope")]
    RsaEnvelope,
    /// Transparent passthrough: no encryption at all.
    #[serde(rename = "none")]
    None,
}

/// Key material locations for a provider.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderKeyConfig {
    /// Raw 32-byte symmetric key file (aes-gcm / aes-ctr providers).
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    /// PKCS#8 PEM private key (rsa-envelope provider).
    #[serde(default)]
    pub private_key_file: Option<PathBuf>,
    /// SPKI PEM public key (rsa-envelope provider, encrypt-only).
    #[serde(default)]
    pub public_key_file: Option<PathBuf>,
}

/// Plaintext integrity verification mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrityMode {
    /// Mismatch on download is a hard 500.
    #[default]
    Strict,
    /// Mismatch is logged and counted; the response proceeds.
    Lenient,
    /// HMACs are neither computed nor checked on download.
    Off,
}

/// Optional listener TLS parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    /// PEM certificate chain.
    pub cert_file: PathBuf,
    /// PEM private key.
    pub key_file: PathBuf,
}

/// Request limits and timeouts.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Limits {
    /// Maximum body size hashed for signed-payload verification.
    pub max_signed_body: usize,
    /// Accepted `X-Amz-Date` drift in seconds.
    pub clock_skew_secs: i64,
    /// Total-time cap for PUT-side requests, seconds.
    pub put_timeout_secs: u64,
    /// Total-time cap for GET-side requests, seconds.
    pub get_timeout_secs: u64,
    /// Maximum accepted `Authorization` header length in bytes.
    pub max_auth_header_len: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_signed_body: 1024 * 1024 * 1024,
            clock_skew_secs: 15 * 60,
            put_timeout_secs: 15 * 60,
            get_timeout_secs: 5 * 60,
            max_auth_header_len: 8 * 1024,
        }
    }
}

fn default_log_level() -> String {
    "info".to_owned()
}

fn default_metadata_prefix() -> String {
    cryptgate_crypto::metadata::DEFAULT_PREFIX.to_owned()
}

fn default_gcm_threshold() -> u64 {
    64 * 1024 * 1024
}

fn default_multipart_ttl() -> u64 {
    24 * 60 * 60
}

impl GatewayConfig {
    /// Load and validate configuration from a YAML file, applying
    /// environment overrides.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the file is unreadable, unparsable, or
    /// fails validation.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_yaml_str(&raw)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse and validate configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] on parse or validation failure.
    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(listen) = std::env::var("CRYPTGATE_LISTEN") {
            self.bind_address = listen;
        }
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            self.log_level = level;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.bind_address
            .parse::<std::net::SocketAddr>()
            .map_err(|_| {
                ConfigError::Invalid(format!("bind_address '{}' is not host:port", self.bind_address))
            })?;

        let endpoint = url::Url::parse(&self.target_endpoint)
            .map_err(|e| ConfigError::Invalid(format!("target_endpoint: {e}")))?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(ConfigError::Invalid(
                "target_endpoint must be an http(s) URL".to_owned(),
            ));
        }
        if endpoint.host_str().is_none() {
            return Err(ConfigError::Invalid(
                "target_endpoint has no host".to_owned(),
            ));
        }

        if self.s3_clients.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one entry in s3_clients is required".to_owned(),
            ));
        }

        let enc = &self.encryption;
        if enc.providers.is_empty() {
            return Err(ConfigError::Invalid(
                "encryption.providers must not be empty".to_owned(),
            ));
        }
        if !enc
            .providers
            .iter()
            .any(|p| p.alias == enc.encryption_method_alias)
        {
            return Err(ConfigError::Invalid(format!(
                "encryption_method_alias '{}' does not name a configured provider",
                enc.encryption_method_alias
            )));
        }
        for provider in &enc.providers {
            match provider.kind {
                ProviderKind::AesGcm | ProviderKind::AesCtr => {
                    if provider.config.key_file.is_none() {
                        return Err(ConfigError::Invalid(format!(
                            "provider '{}' requires config.key_file",
                            provider.alias
                        )));
                    }
                }
                ProviderKind::RsaEnvelope => {
                    if provider.config.private_key_file.is_none()
                        && provider.config.public_key_file.is_none()
                    {
                        return Err(ConfigError::Invalid(format!(
                            "provider '{}' requires config.private_key_file or config.public_key_file",
                            provider.alias
                        )));
                    }
                }
                ProviderKind::None => {}
            }
        }
        if !enc.metadata_key_prefix.ends_with('-') {
            return Err(ConfigError::Invalid(
                "encryption.metadata_key_prefix must end with '-'".to_owned(),
            ));
        }

        Ok(())
    }

    /// The inbound verification policy derived from the limits.
    #[must_use]
    pub fn verify_policy(&self) -> VerifyPolicy {
        VerifyPolicy {
            max_auth_header_len: self.limits.max_auth_header_len,
            max_clock_skew_secs: self.limits.clock_skew_secs,
            max_signed_body: self.limits.max_signed_body,
        }
    }

    /// The inbound credential provider built from `s3_clients`.
    #[must_use]
    pub fn credential_provider(&self) -> StaticCredentialProvider {
        StaticCredentialProvider::new(self.s3_clients.iter().map(|c| {
            (
                c.access_key.clone(),
                CredentialRecord {
                    secret_key: c.secret_key.clone(),
                    region: c.region.clone(),
                },
            )
        }))
    }

    /// The outbound service credentials.
    #[must_use]
    pub fn service_credentials(&self) -> ServiceCredentials {
        ServiceCredentials {
            access_key_id: self.access_key_id.clone(),
            secret_key: self.secret_key.clone(),
            region: self.region.clone(),
        }
    }

    /// The provider configured as active, if validation passed.
    #[must_use]
    pub fn active_provider(&self) -> Option<&ProviderConfig> {
        self.encryption
            .providers
            .iter()
            .find(|p| p.alias == self.encryption.encryption_method_alias)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r"
bind_address: 127.0.0.1:9000
target_endpoint: http://127.0.0.1:9001
access_key_id: GATEWAYKEY
secret_key: gatewaysecret
region: us-east-1
s3_clients:
  - access_key: CLIENTKEY
    secret_key: clientsecret
encryption:
  encryption_method_alias: primary
  providers:
    - alias: primary
      type: aes-gcm
      config:
        key_file: /etc/cryptgate/kek.bin
";

    #[test]
    fn test_should_parse_minimal_config() {
        let config = GatewayConfig::from_yaml_str(MINIMAL).expect("should parse");
        assert_eq!(config.bind_address, "127.0.0.1:9000");
        assert_eq!(config.region, "us-east-1");
        assert_eq!(config.encryption.metadata_key_prefix, "x-s3ep-");
        assert_eq!(config.encryption.integrity_verification, IntegrityMode::Strict);
        assert_eq!(config.encryption.gcm_size_threshold, 64 * 1024 * 1024);
        assert_eq!(config.encryption.multipart_idle_ttl_secs, 24 * 60 * 60);
        assert_eq!(config.limits.put_timeout_secs, 15 * 60);
        assert!(config.tls.is_none());
    }

    #[test]
    fn test_should_reject_invalid_bind_address() {
        let raw = MINIMAL.replace("127.0.0.1:9000", "not-an-address");
        assert!(matches!(
            GatewayConfig::from_yaml_str(&raw),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_should_reject_non_http_target() {
        let raw = MINIMAL.replace("http://127.0.0.1:9001", "ftp://127.0.0.1:9001");
        assert!(matches!(
            GatewayConfig::from_yaml_str(&raw),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_should_reject_missing_clients() {
        let raw = MINIMAL.replace(
            "s3_clients:\n  - access_key: CLIENTKEY\n    secret_key: clientsecret",
            "s3_clients: []",
        );
        assert!(matches!(
            GatewayConfig::from_yaml_str(&raw),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_should_reject_alias_without_provider() {
        let raw = MINIMAL.replace("encryption_method_alias: primary", "encryption_method_alias: other");
        assert!(matches!(
            GatewayConfig::from_yaml_str(&raw),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_should_reject_aes_provider_without_key_file() {
        let raw = MINIMAL.replace("      config:\n        key_file: /etc/cryptgate/kek.bin\n", "");
        assert!(matches!(
            GatewayConfig::from_yaml_str(&raw),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_should_parse_integrity_modes() {
        for (text, expected) in [
            ("strict", IntegrityMode::Strict),
            ("lenient", IntegrityMode::Lenient),
            ("off", IntegrityMode::Off),
        ] {
            let raw = MINIMAL.replace(
                "encryption_method_alias: primary",
                &format!("encryption_method_alias: primary\n  integrity_verification: {text}"),
            );
            let config = GatewayConfig::from_yaml_str(&raw).expect("should parse");
            assert_eq!(config.encryption.integrity_verification, expected);
        }
    }

    #[test]
    fn test_should_accept_none_provider() {
        let raw = MINIMAL
            .replace("type: aes-gcm", "type: none")
            .replace("      config:\n        key_file: /etc/cryptgate/kek.bin\n", "");
        let config = GatewayConfig::from_yaml_str(&raw).expect("should parse");
        assert_eq!(config.active_provider().map(|p| p.kind), Some(ProviderKind::None));
    }

    #[test]
    fn test_should_build_verify_policy_from_limits() {
        let config = GatewayConfig::from_yaml_str(MINIMAL).expect("should parse");
        let policy = config.verify_policy();
        assert_eq!(policy.max_auth_header_len, 8 * 1024);
        assert_eq!(policy.max_clock_skew_secs, 15 * 60);
    }

    #[test]
    fn test_should_build_credential_provider_with_region_binding() {
        let raw = MINIMAL.replace(
            "    secret_key: clientsecret",
            "    secret_key: clientsecret\n    region: eu-west-1",
        );
        let config = GatewayConfig::from_yaml_str(&raw).expect("should parse");
        let provider = config.credential_provider();
        use cryptgate_auth::CredentialProvider;
        let record = provider.get_credential("CLIENTKEY").expect("resolves");
        assert_eq!(record.region.as_deref(), Some("eu-west-1"));
    }
}
