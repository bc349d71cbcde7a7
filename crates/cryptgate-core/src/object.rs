//! The single-object encryption pipeline: PutObject, GetObject, HeadObject.
//!
//! Upload: the (already chunk-decoded) body is encrypted under a fresh DEK
//! and forwarded with the envelope attached as user metadata. Download: if
//! the stored object carries envelope headers it is decrypted and scrubbed;
//! otherwise it streams through byte-for-byte — the documented contract for
//! coexisting with objects written out-of-band.

use std::sync::Arc;
use std::task::Poll;

use bytes::Bytes;
use futures::StreamExt;
use http::{HeaderMap, Method, StatusCode};
use tracing::{debug, warn};

use cryptgate_crypto::ctr_stream::CtrStream;
use cryptgate_crypto::factory::{ContentClass, IntegrityCheck};
use cryptgate_crypto::integrity::PlaintextHmac;
use cryptgate_crypto::{CryptoError, DataAlgorithm, EnvelopeFactory, EnvelopeMetadata};
use cryptgate_model::S3Error;

use crate::config::IntegrityMode;
use crate::error::crypto_error_to_s3;
use crate::gateway::{
    Gateway, attach_envelope, extract_envelope, forwardable_client_headers, object_aad,
};
use crate::upstream::http::object_path;
use crate::upstream::{UpstreamBody, UpstreamError, UpstreamRequest, UpstreamResponse};

/// Content type that forces GCM for a large single PUT.
pub const FORCE_GCM_CONTENT_TYPE: &str = "application/x-s3ep-force-aes-gcm";

impl Gateway {
    /// Handle `PutObject`.
    ///
    /// # Errors
    ///
    /// Returns an `S3Error` on crypto or upstream transport failure.
    pub async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        client_headers: &HeaderMap,
        body: Bytes,
    ) -> Result<UpstreamResponse, S3Error> {
        let prefix = self.metadata_prefix().to_owned();
        let mut headers = forwardable_client_headers(client_headers, &prefix);

        let Some(factory) = &self.factory else {
            // Passthrough mode: store the plaintext, no envelope.
            let request = UpstreamRequest::new(Method::PUT, object_path(bucket, key), "")
                .with_headers(headers)
                .with_body(body);
            let response = self.send_upstream(request).await?;
            return Ok(self.filtered(response));
        };

        let force_gcm = client_headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct == FORCE_GCM_CONTENT_TYPE);

        let class = ContentClass::Whole {
            size: body.len() as u64,
            force_gcm,
        };
        let encryptor = factory
            .create_envelope_encryptor(class, None)
            .map_err(crypto_error_to_s3)?;

        let aad = object_aad(bucket, key);
        let (ciphertext, metadata) = encryptor
            .seal(&body, &aad)
            .map_err(crypto_error_to_s3)?;

        debug_assert_eq!(
            ciphertext.len() as u64,
            body.len() as u64 + metadata.data_algorithm.overhead()
        );
        debug!(
            bucket,
            key,
            algorithm = %metadata.data_algorithm,
            plaintext_len = body.len(),
            ciphertext_len = ciphertext.len(),
            "encrypting PutObject"
        );

        attach_envelope(&mut headers, &metadata, &prefix);

        let request = UpstreamRequest::new(Method::PUT, object_path(bucket, key), "")
            .with_headers(headers)
            .with_body(Bytes::from(ciphertext));
        let response = self.send_upstream(request).await?;
        Ok(self.filtered(response))
    }

    /// Handle `GetObject`.
    ///
    /// # Errors
    ///
    /// Returns an `S3Error` on malformed envelopes, unknown KEKs, cipher
    /// failure, or a strict-mode integrity mismatch.
    pub async fn get_object(&self, bucket: &str, key: &str) -> Result<UpstreamResponse, S3Error> {
        let request = UpstreamRequest::new(Method::GET, object_path(bucket, key), "");
        let response = self.send_upstream(request).await?;

        if !response.status.is_success() {
            return Ok(self.filtered(response));
        }

        let prefix = self.metadata_prefix();
        let envelope = extract_envelope(&response.headers, prefix).map_err(crypto_error_to_s3)?;

        let Some(metadata) = envelope else {
            // Stored as plaintext: stream through unchanged.
            return Ok(self.filtered(response));
        };

        let Some(factory) = &self.factory else {
            return Err(S3Error::internal_error(
                "stored object is encrypted but encryption is disabled",
            ));
        };

        let mode = self.config.encryption.integrity_verification;

        // CTR below strict mode decrypts chunk-by-chunk: the keystream is
        // seekless from offset zero and verification (lenient) happens at
        // end of stream, so nothing forces the object into memory. Strict
        // mode promises a 500 before any plaintext is sent, and GCM is a
        // single-shot primitive; both stay on the buffered path below.
        if metadata.data_algorithm == DataAlgorithm::Aes256CtrStreaming
            && mode != IntegrityMode::Strict
        {
            return self.stream_ctr_object(bucket, key, response, &metadata, mode, factory);
        }

        let integrity = match mode {
            IntegrityMode::Strict | IntegrityMode::Lenient => IntegrityCheck::Verify,
            IntegrityMode::Off => IntegrityCheck::Skip,
        };

        let status = response.status;
        let upstream_headers = response.headers;
        let ciphertext = response
            .body
            .collect()
            .await
            .map_err(crate::error::upstream_error_to_s3)?;

        let aad = object_aad(bucket, key);
        let decrypted = factory
            .decrypt_data(&ciphertext, &metadata, &aad, integrity)
            .map_err(crypto_error_to_s3)?;

        if decrypted.hmac_valid == Some(false) {
            self.metrics.record_hmac_mismatch();
            match mode {
                IntegrityMode::Strict => {
                    return Err(S3Error::internal_error(
                        "stored object failed integrity verification",
                    ));
                }
                IntegrityMode::Lenient => {
                    warn!(bucket, key, "integrity mismatch on download (lenient mode)");
                }
                IntegrityMode::Off => {}
            }
        }

        let mut filtered = self.filtered(UpstreamResponse {
            status,
            headers: upstream_headers,
            body: UpstreamBody::Buffered(Bytes::new()),
        });
        set_content_length(&mut filtered.headers, decrypted.plaintext.len() as u64);
        filtered.body = UpstreamBody::Buffered(Bytes::from(decrypted.plaintext));
        Ok(filtered)
    }

    /// Decrypt a CTR object as a pass-through stream (lenient / off
    /// integrity modes).
    fn stream_ctr_object(
        &self,
        bucket: &str,
        key: &str,
        response: UpstreamResponse,
        metadata: &EnvelopeMetadata,
        mode: IntegrityMode,
        factory: &Arc<EnvelopeFactory>,
    ) -> Result<UpstreamResponse, S3Error> {
        let dek = factory.unwrap_dek(metadata).map_err(crypto_error_to_s3)?;
        let iv = metadata.iv.ok_or_else(|| {
            crypto_error_to_s3(CryptoError::MalformedEnvelope(
                "CTR envelope without IV".to_owned(),
            ))
        })?;

        let UpstreamResponse {
            status,
            headers,
            body,
        } = response;

        let mut inner = match body {
            UpstreamBody::Stream(stream) => stream,
            UpstreamBody::Buffered(bytes) => futures::stream::iter(vec![Ok(bytes)]).boxed(),
        };

        let mut cipher = CtrStream::new(&dek, &iv);
        let mut mac = (mode == IntegrityMode::Lenient && metadata.hmac.is_some())
            .then(|| PlaintextHmac::new(&dek));
        let mut expected_hmac = metadata.hmac.clone();
        let metrics = Arc::clone(&self.metrics);
        let location = format!("{bucket}/{key}");

        let transformed = futures::stream::poll_fn(move |cx| {
            match inner.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    let mut buf = chunk.to_vec();
                    if let Err(e) = cipher.apply(&mut buf) {
                        return Poll::Ready(Some(Err(UpstreamError::InvalidResponse(format!(
                            "object exceeds the keystream range: {e}"
                        )))));
                    }
                    if let Some(mac) = &mut mac {
                        mac.update(&buf);
                    }
                    Poll::Ready(Some(Ok(Bytes::from(buf))))
                }
                Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e))),
                Poll::Ready(None) => {
                    // End of stream: settle the lenient verdict.
                    if let (Some(mac), Some(expected)) = (mac.take(), expected_hmac.take()) {
                        if mac.verify_hex(&expected).is_err() {
                            metrics.record_hmac_mismatch();
                            warn!(
                                object = %location,
                                "integrity mismatch on download (lenient mode)"
                            );
                        }
                    }
                    Poll::Ready(None)
                }
                Poll::Pending => Poll::Pending,
            }
        })
        .boxed();

        let mut filtered = self.filtered(UpstreamResponse {
            status,
            headers,
            body: UpstreamBody::Buffered(Bytes::new()),
        });
        filtered.body = UpstreamBody::Stream(transformed);
        Ok(filtered)
    }

    /// Handle `HeadObject`: same header filtering as GET, with
    /// `Content-Length` reporting the plaintext size for encrypted objects.
    ///
    /// # Errors
    ///
    /// Returns an `S3Error` on malformed envelopes or upstream transport
    /// failure.
    pub async fn head_object(&self, bucket: &str, key: &str) -> Result<UpstreamResponse, S3Error> {
        let request = UpstreamRequest::new(Method::HEAD, object_path(bucket, key), "");
        let response = self.send_upstream(request).await?;

        if response.status != StatusCode::OK {
            return Ok(self.filtered(response));
        }

        let envelope =
            extract_envelope(&response.headers, self.metadata_prefix()).map_err(crypto_error_to_s3)?;

        let mut filtered = self.filtered(response);
        if let Some(metadata) = envelope {
            set_content_length(&mut filtered.headers, metadata.original_length);
        }
        filtered.body = UpstreamBody::Buffered(Bytes::new());
        Ok(filtered)
    }
}

fn set_content_length(headers: &mut HeaderMap, len: u64) {
    headers.insert(
        http::header::CONTENT_LENGTH,
        len.to_string().parse().expect("decimal is a valid header"),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::GatewayConfig;
    use crate::upstream::UpstreamClient;
    use crate::upstream::memory::MemoryUpstream;
    use cryptgate_crypto::EnvelopeFactory;
    use cryptgate_crypto::keywrap::AesKwKeyEncryptor;

    const CONFIG: &str = r"
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
  gcm_size_threshold: 1024
  providers:
    - alias: primary
      type: aes-gcm
      config:
        key_file: /dev/null
";

    fn test_factory() -> Arc<EnvelopeFactory> {
        let factory = EnvelopeFactory::new(1024);
        factory.register_kek(Arc::new(
            AesKwKeyEncryptor::new("primary", &[9u8; 32]).expect("valid key"),
        ));
        factory.activate("primary").expect("activates");
        Arc::new(factory)
    }

    fn test_gateway(upstream: Arc<MemoryUpstream>) -> Gateway {
        let config = GatewayConfig::from_yaml_str(CONFIG).expect("valid config");
        Gateway::from_parts(config, Some(test_factory()), upstream)
    }

    fn test_gateway_with_integrity(upstream: Arc<MemoryUpstream>, mode: &str) -> Gateway {
        let raw = CONFIG.replace(
            "encryption_method_alias: primary",
            &format!("encryption_method_alias: primary\n  integrity_verification: {mode}"),
        );
        let config = GatewayConfig::from_yaml_str(&raw).expect("valid config");
        Gateway::from_parts(config, Some(test_factory()), upstream)
    }

    /// Flip one ciphertext byte of a stored object in place, keeping its
    /// envelope headers.
    async fn tamper_stored_object(upstream: &MemoryUpstream, bucket: &str, key: &str) {
        let stored = upstream.stored_object(bucket, key).expect("stored");
        let mut corrupted = stored.data.to_vec();
        corrupted[0] ^= 0xff;
        upstream
            .execute(
                UpstreamRequest::new(Method::PUT, format!("/{bucket}/{key}"), "")
                    .with_headers(stored.metadata)
                    .with_body(Bytes::from(corrupted)),
            )
            .await
            .expect("mem upstream");
    }

    #[tokio::test]
    async fn test_should_store_ciphertext_and_return_plaintext() {
        let upstream = Arc::new(MemoryUpstream::new());
        let gateway = test_gateway(Arc::clone(&upstream));

        let response = gateway
            .put_object("b", "k", &HeaderMap::new(), Bytes::from_static(b"Hello, World!"))
            .await
            .expect("put succeeds");
        assert_eq!(response.status, StatusCode::OK);

        // Upstream holds ciphertext: GCM adds 28 bytes and changes content.
        let stored = upstream.stored_object("b", "k").expect("stored");
        assert_eq!(stored.data.len(), 13 + 28);
        assert_ne!(&stored.data[..], b"Hello, World!");

        let response = gateway.get_object("b", "k").await.expect("get succeeds");
        assert_eq!(response.status, StatusCode::OK);
        let body = response.body.collect().await.expect("body");
        assert_eq!(body, Bytes::from_static(b"Hello, World!"));
    }

    #[tokio::test]
    async fn test_should_use_ctr_above_threshold() {
        let upstream = Arc::new(MemoryUpstream::new());
        let gateway = test_gateway(Arc::clone(&upstream));

        let payload: Vec<u8> = (0..4096u32).map(|i| (i % 256) as u8).collect();
        gateway
            .put_object("b", "big", &HeaderMap::new(), Bytes::from(payload.clone()))
            .await
            .expect("put succeeds");

        let stored = upstream.stored_object("b", "big").expect("stored");
        // CTR has no ciphertext overhead.
        assert_eq!(stored.data.len(), payload.len());
        assert!(
            stored
                .metadata
                .contains_key("x-amz-meta-x-s3ep-hmac")
        );

        let response = gateway.get_object("b", "big").await.expect("get succeeds");
        let body = response.body.collect().await.expect("body");
        assert_eq!(&body[..], &payload[..]);
    }

    #[tokio::test]
    async fn test_should_strip_envelope_headers_from_responses() {
        let upstream = Arc::new(MemoryUpstream::new());
        let gateway = test_gateway(Arc::clone(&upstream));

        gateway
            .put_object("b", "k", &HeaderMap::new(), Bytes::from_static(b"data"))
            .await
            .expect("put succeeds");

        let response = gateway.get_object("b", "k").await.expect("get succeeds");
        for name in response.headers.keys() {
            assert!(
                !name.as_str().contains("s3ep"),
                "leaked envelope header: {name}"
            );
        }
    }

    #[tokio::test]
    async fn test_should_pass_through_plaintext_objects() {
        let upstream = Arc::new(MemoryUpstream::new());
        // Object written out-of-band, no envelope headers.
        upstream
            .execute(
                UpstreamRequest::new(Method::PUT, "/b/plain", "")
                    .with_body(Bytes::from_static(b"already plaintext")),
            )
            .await
            .expect("mem upstream");
        let gateway = test_gateway(Arc::clone(&upstream));

        let response = gateway.get_object("b", "plain").await.expect("get succeeds");
        let body = response.body.collect().await.expect("body");
        assert_eq!(body, Bytes::from_static(b"already plaintext"));
    }

    #[tokio::test]
    async fn test_should_report_plaintext_length_on_head() {
        let upstream = Arc::new(MemoryUpstream::new());
        let gateway = test_gateway(Arc::clone(&upstream));

        gateway
            .put_object("b", "k", &HeaderMap::new(), Bytes::from_static(b"Hello, World!"))
            .await
            .expect("put succeeds");

        let response = gateway.head_object("b", "k").await.expect("head succeeds");
        assert_eq!(
            response
                .headers
                .get("content-length")
                .and_then(|v| v.to_str().ok()),
            Some("13"),
            "HEAD must report the plaintext length"
        );
    }

    #[tokio::test]
    async fn test_should_mirror_upstream_404() {
        let upstream = Arc::new(MemoryUpstream::new());
        let gateway = test_gateway(upstream);

        let response = gateway.get_object("b", "missing").await.expect("mirrors");
        assert_eq!(response.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_should_force_gcm_via_content_type() {
        let upstream = Arc::new(MemoryUpstream::new());
        let gateway = test_gateway(Arc::clone(&upstream));

        let payload: Vec<u8> = vec![7u8; 4096]; // above the 1024 threshold
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONTENT_TYPE,
            FORCE_GCM_CONTENT_TYPE.parse().expect("valid"),
        );

        gateway
            .put_object("b", "forced", &headers, Bytes::from(payload.clone()))
            .await
            .expect("put succeeds");

        let stored = upstream.stored_object("b", "forced").expect("stored");
        assert_eq!(stored.data.len(), payload.len() + 28, "GCM overhead present");
    }

    #[tokio::test]
    async fn test_should_stream_decrypt_ctr_object_in_lenient_mode() {
        let upstream = Arc::new(MemoryUpstream::new());
        let gateway = test_gateway_with_integrity(Arc::clone(&upstream), "lenient");

        let payload: Vec<u8> = (0..8192u32).map(|i| (i % 256) as u8).collect();
        gateway
            .put_object("b", "k", &HeaderMap::new(), Bytes::from(payload.clone()))
            .await
            .expect("put succeeds");

        let response = gateway.get_object("b", "k").await.expect("get succeeds");
        assert!(
            matches!(response.body, UpstreamBody::Stream(_)),
            "lenient CTR downloads must not be buffered"
        );
        let body = response.body.collect().await.expect("body");
        assert_eq!(&body[..], &payload[..]);
        assert_eq!(gateway.metrics().hmac_mismatches(), 0);
    }

    #[tokio::test]
    async fn test_should_return_500_on_tampered_ctr_object_in_strict_mode() {
        let upstream = Arc::new(MemoryUpstream::new());
        let gateway = test_gateway_with_integrity(Arc::clone(&upstream), "strict");

        // 4 KiB is above the 1 KiB threshold, so the CTR+HMAC path runs.
        let payload: Vec<u8> = (0..4096u32).map(|i| (i % 256) as u8).collect();
        gateway
            .put_object("b", "k", &HeaderMap::new(), Bytes::from(payload))
            .await
            .expect("put succeeds");
        tamper_stored_object(&upstream, "b", "k").await;

        let err = gateway
            .get_object("b", "k")
            .await
            .expect_err("strict mode must fail");
        assert_eq!(err.status_code, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(gateway.metrics().hmac_mismatches(), 1);
    }

    #[tokio::test]
    async fn test_should_pass_tampered_ctr_object_in_lenient_mode() {
        let upstream = Arc::new(MemoryUpstream::new());
        let gateway = test_gateway_with_integrity(Arc::clone(&upstream), "lenient");

        let payload: Vec<u8> = (0..4096u32).map(|i| (i % 256) as u8).collect();
        gateway
            .put_object("b", "k", &HeaderMap::new(), Bytes::from(payload.clone()))
            .await
            .expect("put succeeds");
        tamper_stored_object(&upstream, "b", "k").await;

        // Lenient: the response proceeds, the mismatch is counted.
        let response = gateway.get_object("b", "k").await.expect("get succeeds");
        assert_eq!(response.status, StatusCode::OK);
        let body = response.body.collect().await.expect("body");
        assert_ne!(&body[..], &payload[..], "first byte was corrupted");
        assert_eq!(gateway.metrics().hmac_mismatches(), 1);
    }

    #[tokio::test]
    async fn test_should_fail_closed_on_truncated_envelope() {
        let upstream = Arc::new(MemoryUpstream::new());
        let gateway = test_gateway(Arc::clone(&upstream));

        gateway
            .put_object("b", "k", &HeaderMap::new(), Bytes::from_static(b"data"))
            .await
            .expect("put succeeds");

        // Simulate an upstream that lost part of the envelope: rewrite the
        // object keeping only one envelope header.
        let stored = upstream.stored_object("b", "k").expect("stored");
        let mut partial = HeaderMap::new();
        let dek = stored
            .metadata
            .get("x-amz-meta-x-s3ep-dek")
            .expect("dek header")
            .clone();
        partial.insert("x-amz-meta-x-s3ep-dek", dek);
        upstream
            .execute(
                UpstreamRequest::new(Method::PUT, "/b/k", "")
                    .with_headers(partial)
                    .with_body(stored.data),
            )
            .await
            .expect("mem upstream");

        let result = gateway.get_object("b", "k").await;
        let err = result.expect_err("partial envelope must be fatal");
        assert_eq!(err.status_code, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
