//! The multipart encryption engine.
//!
//! One `UploadId`, one DEK, one CTR keystream. The engine keeps per-upload
//! state keyed by the upstream-issued `UploadId` and guarantees the
//! keystream-continuity invariant: the counter for the byte at assembled
//! plaintext offset `O` is `IV + O/16`, so the concatenation of
//! independently encrypted parts decrypts exactly like a single pass.
//!
//! That invariant forces encryption to proceed in PartNumber-contiguous
//! order — a part's starting offset is the total plaintext length of all
//! parts before it. Parts arriving ahead of a missing predecessor are held
//! in state (plaintext, bounded by the idle TTL) and flushed the moment
//! their offset becomes known. Clients always receive the gateway-computed
//! part ETag (quoted MD5 of the plaintext); the upstream ETags are recorded
//! and substituted into the part list at Complete.
//!
//! No envelope headers are written at Create — some upstreams drop
//! per-upload metadata on completion — so Complete issues a self-copy with
//! `x-amz-metadata-directive: REPLACE` to attach the envelope afterwards.
//!
//! The state table is a concurrent map with a per-entry async mutex: the
//! map's own locks guard insertion and removal only, so independent
//! uploads never contend.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use http::{HeaderMap, Method, StatusCode};
use md5::{Digest, Md5};
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use cryptgate_crypto::factory::{ContentClass, MultipartSecrets};
use cryptgate_crypto::integrity::PlaintextHmac;
use cryptgate_crypto::{DataAlgorithm, EnvelopeMetadata, ctr_stream, integrity};
use cryptgate_model::xml::{self, CompletedPart};
use cryptgate_model::{S3Error, S3ErrorCode, s3_error};

use crate::error::{client_xml_error_to_s3, crypto_error_to_s3};
use crate::gateway::{Gateway, attach_envelope, forwardable_client_headers};
use crate::upstream::http::{encode_copy_source, object_path};
use crate::upstream::{UpstreamBody, UpstreamRequest, UpstreamResponse};

/// S3's maximum part number.
const MAX_PART_NUMBER: u32 = 10_000;

/// How often the background reaper sweeps for idle uploads.
pub const REAPER_INTERVAL: Duration = Duration::from_secs(60);

/// One recorded (encrypted and forwarded) part.
#[derive(Debug, Clone)]
struct PartRecord {
    plaintext_len: u64,
    ciphertext_len: u64,
    /// Starting offset of this part in the assembled plaintext stream.
    offset: u64,
    /// HMAC-SHA256 over this part's plaintext, hex.
    part_hmac: String,
    /// The ETag the upstream store issued for the ciphertext part.
    upstream_etag: String,
    /// The ETag the gateway issued to the client (quoted plaintext MD5).
    client_etag: String,
}

/// A part that arrived before one of its predecessors: its keystream
/// offset is still unknown, so the plaintext is held until the gap closes.
#[derive(Debug)]
struct PendingPart {
    body: Bytes,
    client_etag: String,
}

/// Per-upload encryption state.
pub(crate) struct UploadState {
    bucket: String,
    key: String,
    secrets: MultipartSecrets,
    /// Client metadata captured at Create, replayed at the Complete-time
    /// metadata rewrite.
    user_metadata: HeaderMap,
    /// Plaintext bytes encrypted so far (the contiguous prefix).
    stream_offset: u64,
    /// The lowest part number not yet encrypted.
    next_part: u32,
    /// Whole-object HMAC, fed in PartNumber order as parts are encrypted.
    rolling_hmac: PlaintextHmac,
    recorded: BTreeMap<u32, PartRecord>,
    pending: BTreeMap<u32, PendingPart>,
    last_activity: Instant,
    /// Set by Complete/Abort/reap; late callers holding the `Arc` observe
    /// it and report `NoSuchUpload`.
    finished: bool,
}

impl std::fmt::Debug for UploadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadState")
            .field("bucket", &self.bucket)
            .field("key", &self.key)
            .field("stream_offset", &self.stream_offset)
            .field("next_part", &self.next_part)
            .field("recorded", &self.recorded.len())
            .field("pending", &self.pending.len())
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

/// The concurrent upload-state table.
#[derive(Debug, Default)]
pub struct MultipartTable {
    uploads: DashMap<String, Arc<Mutex<UploadState>>>,
}

impl MultipartTable {
    /// An empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live uploads.
    #[must_use]
    pub fn len(&self) -> usize {
        self.uploads.len()
    }

    /// Whether no uploads are in progress.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.uploads.is_empty()
    }

    fn get(&self, upload_id: &str) -> Option<Arc<Mutex<UploadState>>> {
        self.uploads.get(upload_id).map(|e| Arc::clone(&e))
    }

    fn insert(&self, upload_id: String, state: UploadState) {
        self.uploads.insert(upload_id, Arc::new(Mutex::new(state)));
    }

    fn remove(&self, upload_id: &str) {
        self.uploads.remove(upload_id);
    }

    /// Snapshot of (id, state) pairs; used by the reaper so no map lock is
    /// held across the per-entry mutexes.
    fn snapshot(&self) -> Vec<(String, Arc<Mutex<UploadState>>)> {
        self.uploads
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect()
    }
}

impl Gateway {
    /// Handle `CreateMultipartUpload`.
    ///
    /// # Errors
    ///
    /// Returns an `S3Error` on upstream transport or crypto failure.
    pub async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        client_headers: &HeaderMap,
    ) -> Result<UpstreamResponse, S3Error> {
        let prefix = self.metadata_prefix().to_owned();
        let user_metadata = forwardable_client_headers(client_headers, &prefix);

        // Envelope headers are deliberately NOT attached here; see the
        // module docs on the Complete-time rewrite.
        let request = UpstreamRequest::new(Method::POST, object_path(bucket, key), "uploads")
            .with_headers(user_metadata.clone());
        let response = self.send_upstream(request).await?;

        if !response.status.is_success() {
            return Ok(self.filtered(response));
        }

        let status = response.status;
        let headers = response.headers;
        let body = response
            .body
            .collect()
            .await
            .map_err(crate::error::upstream_error_to_s3)?;

        if let Some(factory) = &self.factory {
            let upload_id = xml::parse_initiate_result(&body).map_err(|e| {
                S3Error::internal_error(format!("upstream initiate response unparsable: {e}"))
            })?;

            let secrets = factory
                .create_envelope_encryptor(ContentClass::Multipart, None)
                .and_then(|enc| enc.start_multipart())
                .map_err(crypto_error_to_s3)?;

            info!(bucket, key, upload_id, "created multipart upload");

            let rolling_hmac = PlaintextHmac::new(&secrets.dek);
            self.uploads.insert(
                upload_id,
                UploadState {
                    bucket: bucket.to_owned(),
                    key: key.to_owned(),
                    secrets,
                    user_metadata,
                    stream_offset: 0,
                    next_part: 1,
                    rolling_hmac,
                    recorded: BTreeMap::new(),
                    pending: BTreeMap::new(),
                    last_activity: Instant::now(),
                    finished: false,
                },
            );
        }

        Ok(self.filtered(UpstreamResponse {
            status,
            headers,
            body: UpstreamBody::Buffered(body),
        }))
    }

    /// Handle `UploadPart`.
    ///
    /// # Errors
    ///
    /// Returns `NoSuchUpload` for unknown (or already finalized) uploads,
    /// `InvalidArgument` for out-of-range part numbers, and `InvalidPart`
    /// for re-uploads of parts already encrypted and forwarded.
    pub async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> Result<UpstreamResponse, S3Error> {
        if self.factory.is_none() {
            let query = part_query(part_number, upload_id);
            return self
                .passthrough(
                    Method::PUT,
                    object_path(bucket, key),
                    query,
                    &HeaderMap::new(),
                    body,
                )
                .await;
        }

        if part_number == 0 || part_number > MAX_PART_NUMBER {
            return Err(S3Error::invalid_argument(format!(
                "part number must be between 1 and {MAX_PART_NUMBER}"
            )));
        }

        let entry = self
            .uploads
            .get(upload_id)
            .ok_or_else(|| S3Error::no_such_upload(upload_id))?;
        let mut state = entry.lock().await;

        if state.finished || state.bucket != bucket || state.key != key {
            return Err(S3Error::no_such_upload(upload_id));
        }

        let client_etag = quoted_md5(&body);

        if state.recorded.contains_key(&part_number) {
            // The part's ciphertext is already part of the keystream and
            // sits upstream; re-encrypting different bytes at the same
            // counter position would both corrupt the stream and reuse the
            // keystream. Refuse.
            return Err(S3Error::invalid_part(format!(
                "part {part_number} of upload {upload_id} was already encrypted and forwarded"
            )));
        }

        if part_number == state.next_part {
            self.flush_contiguous(upload_id, &mut state, part_number, body, client_etag.clone())
                .await?;
        } else {
            debug!(
                upload_id,
                part_number,
                awaiting = state.next_part,
                "holding out-of-order part until its offset is known"
            );
            state.pending.insert(
                part_number,
                PendingPart {
                    body,
                    client_etag: client_etag.clone(),
                },
            );
        }

        state.last_activity = Instant::now();

        let mut headers = HeaderMap::new();
        headers.insert("etag", client_etag.parse().expect("hex etag is a valid header"));
        Ok(UpstreamResponse {
            status: StatusCode::OK,
            headers,
            body: UpstreamBody::Buffered(Bytes::new()),
        })
    }

    /// Encrypt and forward `part_number` (which must equal
    /// `state.next_part`), then drain any pending successors whose offsets
    /// have just become known.
    async fn flush_contiguous(
        &self,
        upload_id: &str,
        state: &mut UploadState,
        part_number: u32,
        body: Bytes,
        client_etag: String,
    ) -> Result<(), S3Error> {
        let mut current = Some((part_number, body, client_etag));

        while let Some((number, plaintext, etag)) = current.take() {
            let offset = state.stream_offset;

            let mut ciphertext = plaintext.to_vec();
            ctr_stream::apply_keystream_at(
                &state.secrets.dek,
                &state.secrets.iv,
                offset,
                &mut ciphertext,
            )
            .map_err(crypto_error_to_s3)?;

            let request = UpstreamRequest::new(
                Method::PUT,
                object_path(&state.bucket, &state.key),
                part_query(number, upload_id),
            )
            .with_body(Bytes::from(ciphertext));

            let response = match self.send_upstream(request).await {
                Ok(response) => response,
                Err(e) => {
                    // Nothing recorded for this part; put held data back so
                    // a retry of the predecessor can flush it again.
                    if number != part_number {
                        state.pending.insert(number, PendingPart { body: plaintext, client_etag: etag });
                    }
                    return Err(e);
                }
            };

            if !response.status.is_success() {
                warn!(
                    upload_id,
                    part = number,
                    status = %response.status,
                    "upstream rejected encrypted part"
                );
                if number != part_number {
                    state.pending.insert(number, PendingPart { body: plaintext, client_etag: etag });
                }
                return Err(S3Error::internal_error(format!(
                    "upstream rejected part {number} with status {}",
                    response.status
                )));
            }

            let upstream_etag = response
                .headers
                .get("etag")
                .and_then(|v| v.to_str().ok())
                .map(ToOwned::to_owned)
                .ok_or_else(|| {
                    S3Error::internal_error("upstream part response carried no ETag")
                })?;

            let plaintext_len = plaintext.len() as u64;
            state.rolling_hmac.update(&plaintext);
            state.recorded.insert(
                number,
                PartRecord {
                    plaintext_len,
                    ciphertext_len: plaintext_len,
                    offset,
                    part_hmac: integrity::compute_hex(&state.secrets.dek, &plaintext),
                    upstream_etag,
                    client_etag: etag,
                },
            );
            state.stream_offset += plaintext_len;
            state.next_part = number + 1;

            debug!(
                upload_id,
                part = number,
                offset,
                len = plaintext_len,
                "encrypted and forwarded part"
            );

            // A held successor may now be contiguous.
            if let Some(pending) = state.pending.remove(&state.next_part) {
                current = Some((state.next_part, pending.body, pending.client_etag));
            }
        }

        Ok(())
    }

    /// Handle `CompleteMultipartUpload`.
    ///
    /// # Errors
    ///
    /// Returns `MalformedXML` for an unparsable part list, `NoSuchUpload`
    /// for unknown uploads, `InvalidPartOrder` for a non-ascending list,
    /// and `InvalidPart` when the list does not match the recorded parts.
    pub async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        body: Bytes,
    ) -> Result<UpstreamResponse, S3Error> {
        if self.factory.is_none() {
            let query = format!("uploadId={}", encode_query_value(upload_id));
            return self
                .passthrough(
                    Method::POST,
                    object_path(bucket, key),
                    query,
                    &HeaderMap::new(),
                    body,
                )
                .await;
        }

        let client_parts = xml::parse_complete_request(&body).map_err(client_xml_error_to_s3)?;

        let entry = self
            .uploads
            .get(upload_id)
            .ok_or_else(|| S3Error::no_such_upload(upload_id))?;
        let mut state = entry.lock().await;

        if state.finished || state.bucket != bucket || state.key != key {
            return Err(S3Error::no_such_upload(upload_id));
        }

        // Validate while the upload is still alive: a bad part list is the
        // client's to fix and must not destroy the upload.
        let upstream_parts = validate_part_list(&client_parts, &state.recorded, upload_id)?;

        // From here on, in-flight UploadPart calls must observe a dead
        // upload. Mark first, then drop the table entry.
        state.finished = true;
        self.uploads.remove(upload_id);

        // Keystream bookkeeping sanity: recorded parts tile the stream.
        let mut expected_offset = 0u64;
        for (number, record) in &state.recorded {
            debug_assert_eq!(record.offset, expected_offset, "part {number} offset");
            expected_offset += record.plaintext_len;
            debug!(
                upload_id,
                part = number,
                ciphertext_len = record.ciphertext_len,
                part_hmac = %record.part_hmac,
                "finalizing part"
            );
        }
        debug_assert_eq!(expected_offset, state.stream_offset);

        let complete_body = xml::write_complete_request(&upstream_parts);
        let request = UpstreamRequest::new(
            Method::POST,
            object_path(bucket, key),
            format!("uploadId={}", encode_query_value(upload_id)),
        )
        .with_body(Bytes::from(complete_body));
        let response = self.send_upstream(request).await?;

        if !response.status.is_success() {
            warn!(upload_id, status = %response.status, "upstream completion failed");
            return Ok(self.filtered(response));
        }

        let status = response.status;
        let headers = response.headers;
        let result_body = response
            .body
            .collect()
            .await
            .map_err(crate::error::upstream_error_to_s3)?;

        // The upstream object now exists but still lacks its envelope;
        // attach it with a self-copy REPLACE.
        let metadata = EnvelopeMetadata {
            wrapped_dek: state.secrets.wrapped_dek.clone(),
            kek_fingerprint: state.secrets.kek_fingerprint.clone(),
            data_algorithm: DataAlgorithm::Aes256CtrStreaming,
            key_algorithm: state.secrets.key_algorithm,
            iv: Some(state.secrets.iv),
            hmac: Some(state.rolling_hmac.clone().finalize_hex()),
            multipart: true,
            original_length: state.stream_offset,
        };

        self.attach_envelope_by_copy(bucket, key, &state.user_metadata, &metadata)
            .await?;

        info!(
            bucket,
            key,
            upload_id,
            parts = state.recorded.len(),
            plaintext_len = state.stream_offset,
            "completed multipart upload"
        );

        Ok(self.filtered(UpstreamResponse {
            status,
            headers,
            body: UpstreamBody::Buffered(result_body),
        }))
    }

    /// Issue the Complete-time self-copy that attaches the envelope.
    async fn attach_envelope_by_copy(
        &self,
        bucket: &str,
        key: &str,
        user_metadata: &HeaderMap,
        metadata: &EnvelopeMetadata,
    ) -> Result<(), S3Error> {
        let mut headers = user_metadata.clone();
        headers.insert(
            "x-amz-copy-source",
            encode_copy_source(bucket, key)
                .parse()
                .map_err(|_| S3Error::internal_error("unrepresentable copy source"))?,
        );
        headers.insert(
            "x-amz-metadata-directive",
            "REPLACE".parse().expect("static header value"),
        );
        attach_envelope(&mut headers, metadata, self.metadata_prefix());

        let request = UpstreamRequest::new(Method::PUT, object_path(bucket, key), "")
            .with_headers(headers);
        let response = self.send_upstream(request).await?;

        if response.status.is_success() {
            Ok(())
        } else {
            // Without the envelope the stored ciphertext would be served as
            // if it were plaintext. Fail loudly; the object needs operator
            // attention.
            error!(
                bucket,
                key,
                status = %response.status,
                "failed to attach envelope metadata after completion"
            );
            Err(S3Error::internal_error(
                "failed to attach encryption metadata to completed upload",
            ))
        }
    }

    /// Handle `AbortMultipartUpload`. Idempotent: aborting an unknown or
    /// already-aborted upload succeeds with no upstream effect.
    ///
    /// # Errors
    ///
    /// Returns an `S3Error` only on upstream transport failure.
    pub async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<UpstreamResponse, S3Error> {
        let had_state = if let Some(entry) = self.uploads.get(upload_id) {
            let mut state = entry.lock().await;
            state.finished = true;
            self.uploads.remove(upload_id);
            true
        } else {
            false
        };

        let request = UpstreamRequest::new(
            Method::DELETE,
            object_path(bucket, key),
            format!("uploadId={}", encode_query_value(upload_id)),
        );
        let response = self.send_upstream(request).await?;

        if response.status == StatusCode::NOT_FOUND {
            // Second abort (or reaper got there first): succeed quietly.
            debug!(upload_id, had_state, "abort of unknown upstream upload");
            return Ok(UpstreamResponse::empty(StatusCode::NO_CONTENT));
        }

        info!(bucket, key, upload_id, "aborted multipart upload");
        Ok(self.filtered(response))
    }

    /// Abort and drop every upload idle for longer than `ttl`. Returns the
    /// number of uploads reaped.
    pub async fn reap_uploads_older_than(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let mut reaped = 0;

        for (upload_id, entry) in self.uploads.snapshot() {
            let (bucket, key, expired) = {
                let mut state = entry.lock().await;
                if state.finished || now.duration_since(state.last_activity) < ttl {
                    continue;
                }
                state.finished = true;
                (state.bucket.clone(), state.key.clone(), true)
            };

            if expired {
                self.uploads.remove(&upload_id);
                warn!(upload_id, bucket, key, "reaping idle multipart upload");
                if let Err(e) = self.abort_multipart_upload(&bucket, &key, &upload_id).await {
                    warn!(upload_id, error = %e, "failed to abort reaped upload upstream");
                }
                reaped += 1;
            }
        }

        reaped
    }

    /// Sweep once using the configured idle TTL.
    pub async fn reap_idle_uploads(&self) -> usize {
        let ttl = Duration::from_secs(self.config.encryption.multipart_idle_ttl_secs);
        self.reap_uploads_older_than(ttl).await
    }
}

/// Spawn the background reaper for orphaned multipart uploads.
pub fn spawn_reaper(gateway: Arc<Gateway>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(REAPER_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let reaped = gateway.reap_idle_uploads().await;
            if reaped > 0 {
                info!(reaped, "reaped idle multipart uploads");
            }
        }
    })
}

/// Validate the client's ordered part list against the recorded parts and
/// return the list rewritten with upstream ETags.
fn validate_part_list(
    client_parts: &[CompletedPart],
    recorded: &BTreeMap<u32, PartRecord>,
    upload_id: &str,
) -> Result<Vec<CompletedPart>, S3Error> {
    if client_parts.is_empty() {
        return Err(s3_error!(InvalidPart, "part list is empty"));
    }

    for window in client_parts.windows(2) {
        if window[1].part_number <= window[0].part_number {
            return Err(S3Error::new(S3ErrorCode::InvalidPartOrder).with_resource(upload_id));
        }
    }

    if client_parts.len() != recorded.len() {
        // A subset would leave holes in the keystream; the assembled
        // ciphertext could never decrypt to a contiguous stream.
        return Err(S3Error::invalid_part(format!(
            "upload {upload_id} has {} parts but {} were listed",
            recorded.len(),
            client_parts.len()
        )));
    }

    let mut upstream_parts = Vec::with_capacity(client_parts.len());
    for part in client_parts {
        let record = recorded.get(&part.part_number).ok_or_else(|| {
            S3Error::invalid_part(format!("part {} was never uploaded", part.part_number))
        })?;
        if record.client_etag != part.etag {
            return Err(S3Error::invalid_part(format!(
                "part {} ETag does not match",
                part.part_number
            )));
        }
        upstream_parts.push(CompletedPart {
            part_number: part.part_number,
            etag: record.upstream_etag.clone(),
        });
    }

    Ok(upstream_parts)
}

fn part_query(part_number: u32, upload_id: &str) -> String {
    format!(
        "partNumber={part_number}&uploadId={}",
        encode_query_value(upload_id)
    )
}

fn encode_query_value(value: &str) -> String {
    // RFC 3986 unreserved characters stay raw; everything else is encoded.
    const QUERY_VALUE_SET: &percent_encoding::AsciiSet = &NON_ALPHANUMERIC
        .remove(b'-')
        .remove(b'_')
        .remove(b'.')
        .remove(b'~');
    utf8_percent_encode(value, QUERY_VALUE_SET).to_string()
}

fn quoted_md5(data: &[u8]) -> String {
    format!("\"{}\"", hex::encode(Md5::digest(data)))
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::GatewayConfig;
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
      type: aes-ctr
      config:
        key_file: /dev/null
";

    fn test_gateway(upstream: Arc<MemoryUpstream>) -> Gateway {
        let config = GatewayConfig::from_yaml_str(CONFIG).expect("valid config");
        let factory = EnvelopeFactory::new(1024);
        factory.register_kek(Arc::new(
            AesKwKeyEncryptor::new("primary", &[3u8; 32]).expect("valid key"),
        ));
        factory.activate("primary").expect("activates");
        Gateway::from_parts(config, Some(Arc::new(factory)), upstream)
    }

    async fn create(gateway: &Gateway, bucket: &str, key: &str) -> String {
        let response = gateway
            .create_multipart_upload(bucket, key, &HeaderMap::new())
            .await
            .expect("create succeeds");
        assert_eq!(response.status, StatusCode::OK);
        let body = response.body.collect().await.expect("body");
        xml::parse_initiate_result(&body).expect("upload id")
    }

    async fn put_part(
        gateway: &Gateway,
        upload_id: &str,
        number: u32,
        data: &[u8],
    ) -> String {
        let response = gateway
            .upload_part("b", "k", upload_id, number, Bytes::copy_from_slice(data))
            .await
            .expect("upload part succeeds");
        assert_eq!(response.status, StatusCode::OK);
        response
            .headers
            .get("etag")
            .and_then(|v| v.to_str().ok())
            .expect("etag header")
            .to_owned()
    }

    async fn complete(
        gateway: &Gateway,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<UpstreamResponse, S3Error> {
        let body = xml::write_complete_request(&parts);
        gateway
            .complete_multipart_upload("b", "k", upload_id, Bytes::from(body))
            .await
    }

    fn parts_from(etags: &[(u32, String)]) -> Vec<CompletedPart> {
        etags
            .iter()
            .map(|(n, etag)| CompletedPart {
                part_number: *n,
                etag: etag.clone(),
            })
            .collect()
    }

    fn payload(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(seed).wrapping_add(seed)).collect()
    }

    #[tokio::test]
    async fn test_should_round_trip_ordered_multipart_upload() {
        let upstream = Arc::new(MemoryUpstream::new());
        let gateway = test_gateway(Arc::clone(&upstream));

        let part1 = payload(64 * 1024, 3);
        let part2 = payload(64 * 1024, 7);
        let part3 = payload(1000, 11);

        let upload_id = create(&gateway, "b", "k").await;
        let mut etags = Vec::new();
        for (n, data) in [(1u32, &part1), (2, &part2), (3, &part3)] {
            etags.push((n, put_part(&gateway, &upload_id, n, data).await));
        }

        let response = complete(&gateway, &upload_id, parts_from(&etags))
            .await
            .expect("complete succeeds");
        assert_eq!(response.status, StatusCode::OK);

        // The reassembled ciphertext must decrypt to the original bytes.
        let response = gateway.get_object("b", "k").await.expect("get succeeds");
        let body = response.body.collect().await.expect("body");
        let mut expected = part1.clone();
        expected.extend_from_slice(&part2);
        expected.extend_from_slice(&part3);
        assert_eq!(&body[..], &expected[..]);

        // And the stored bytes are not the plaintext.
        let stored = upstream.stored_object("b", "k").expect("stored");
        assert_eq!(stored.data.len(), expected.len());
        assert_ne!(&stored.data[..], &expected[..]);
        assert!(gateway.uploads.is_empty(), "state destroyed at Complete");
    }

    #[tokio::test]
    async fn test_should_round_trip_out_of_order_arrival() {
        let upstream = Arc::new(MemoryUpstream::new());
        let gateway = test_gateway(Arc::clone(&upstream));

        let part1 = payload(8192, 5);
        let part2 = payload(8192, 9);
        let part3 = payload(777, 13);

        let upload_id = create(&gateway, "b", "k").await;
        // Arrival order 2, 3, 1 — completion list stays [1, 2, 3].
        let etag2 = put_part(&gateway, &upload_id, 2, &part2).await;
        let etag3 = put_part(&gateway, &upload_id, 3, &part3).await;
        let etag1 = put_part(&gateway, &upload_id, 1, &part1).await;

        let response = complete(
            &gateway,
            &upload_id,
            parts_from(&[(1, etag1), (2, etag2), (3, etag3)]),
        )
        .await
        .expect("complete succeeds");
        assert_eq!(response.status, StatusCode::OK);

        let response = gateway.get_object("b", "k").await.expect("get succeeds");
        let body = response.body.collect().await.expect("body");
        let mut expected = part1;
        expected.extend_from_slice(&part2);
        expected.extend_from_slice(&part3);
        assert_eq!(&body[..], &expected[..]);
    }

    #[tokio::test]
    async fn test_should_reject_unknown_upload() {
        let gateway = test_gateway(Arc::new(MemoryUpstream::new()));
        let err = gateway
            .upload_part("b", "k", "missing", 1, Bytes::from_static(b"x"))
            .await
            .expect_err("must fail");
        assert_eq!(err.code, S3ErrorCode::NoSuchUpload);
    }

    #[tokio::test]
    async fn test_should_reject_out_of_range_part_number() {
        let upstream = Arc::new(MemoryUpstream::new());
        let gateway = test_gateway(upstream);
        let upload_id = create(&gateway, "b", "k").await;

        for bad in [0u32, MAX_PART_NUMBER + 1] {
            let err = gateway
                .upload_part("b", "k", &upload_id, bad, Bytes::from_static(b"x"))
                .await
                .expect_err("must fail");
            assert_eq!(err.code, S3ErrorCode::InvalidArgument);
        }
    }

    #[tokio::test]
    async fn test_should_reject_replacing_encrypted_part() {
        let upstream = Arc::new(MemoryUpstream::new());
        let gateway = test_gateway(upstream);
        let upload_id = create(&gateway, "b", "k").await;

        put_part(&gateway, &upload_id, 1, b"first version").await;
        let err = gateway
            .upload_part("b", "k", &upload_id, 1, Bytes::from_static(b"second"))
            .await
            .expect_err("must fail");
        assert_eq!(err.code, S3ErrorCode::InvalidPart);
    }

    #[tokio::test]
    async fn test_should_allow_replacing_pending_part() {
        let upstream = Arc::new(MemoryUpstream::new());
        let gateway = test_gateway(upstream);
        let upload_id = create(&gateway, "b", "k").await;

        // Part 2 is pending (part 1 missing); replacing it is fine.
        put_part(&gateway, &upload_id, 2, b"old part two").await;
        let etag2 = put_part(&gateway, &upload_id, 2, b"new part two").await;
        let etag1 = put_part(&gateway, &upload_id, 1, b"part one").await;

        let response = complete(
            &gateway,
            &upload_id,
            parts_from(&[(1, etag1), (2, etag2)]),
        )
        .await
        .expect("complete succeeds");
        assert_eq!(response.status, StatusCode::OK);

        let body = gateway
            .get_object("b", "k")
            .await
            .expect("get succeeds")
            .body
            .collect()
            .await
            .expect("body");
        assert_eq!(body, Bytes::from_static(b"part onenew part two"));
    }

    #[tokio::test]
    async fn test_should_reject_complete_with_wrong_etag() {
        let upstream = Arc::new(MemoryUpstream::new());
        let gateway = test_gateway(upstream);
        let upload_id = create(&gateway, "b", "k").await;
        put_part(&gateway, &upload_id, 1, b"data").await;

        let err = complete(
            &gateway,
            &upload_id,
            parts_from(&[(1, "\"wrong\"".to_owned())]),
        )
        .await
        .expect_err("must fail");
        assert_eq!(err.code, S3ErrorCode::InvalidPart);
    }

    #[tokio::test]
    async fn test_should_reject_descending_part_list() {
        let upstream = Arc::new(MemoryUpstream::new());
        let gateway = test_gateway(upstream);
        let upload_id = create(&gateway, "b", "k").await;
        let etag1 = put_part(&gateway, &upload_id, 1, b"one").await;
        let etag2 = put_part(&gateway, &upload_id, 2, b"two").await;

        let err = complete(
            &gateway,
            &upload_id,
            parts_from(&[(2, etag2), (1, etag1)]),
        )
        .await
        .expect_err("must fail");
        assert_eq!(err.code, S3ErrorCode::InvalidPartOrder);
    }

    #[tokio::test]
    async fn test_should_reject_complete_listing_subset_of_parts() {
        let upstream = Arc::new(MemoryUpstream::new());
        let gateway = test_gateway(upstream);
        let upload_id = create(&gateway, "b", "k").await;
        let etag1 = put_part(&gateway, &upload_id, 1, b"one").await;
        let _etag2 = put_part(&gateway, &upload_id, 2, b"two").await;

        let err = complete(&gateway, &upload_id, parts_from(&[(1, etag1)]))
            .await
            .expect_err("must fail");
        assert_eq!(err.code, S3ErrorCode::InvalidPart);
    }

    #[tokio::test]
    async fn test_should_report_no_such_upload_after_complete() {
        let upstream = Arc::new(MemoryUpstream::new());
        let gateway = test_gateway(upstream);
        let upload_id = create(&gateway, "b", "k").await;
        let etag1 = put_part(&gateway, &upload_id, 1, b"data").await;
        complete(&gateway, &upload_id, parts_from(&[(1, etag1)]))
            .await
            .expect("complete succeeds");

        let err = gateway
            .upload_part("b", "k", &upload_id, 2, Bytes::from_static(b"late"))
            .await
            .expect_err("must fail");
        assert_eq!(err.code, S3ErrorCode::NoSuchUpload);
    }

    #[tokio::test]
    async fn test_should_abort_idempotently() {
        let upstream = Arc::new(MemoryUpstream::new());
        let gateway = test_gateway(Arc::clone(&upstream));
        let upload_id = create(&gateway, "b", "k").await;
        put_part(&gateway, &upload_id, 1, b"data").await;

        let first = gateway
            .abort_multipart_upload("b", "k", &upload_id)
            .await
            .expect("first abort succeeds");
        assert_eq!(first.status, StatusCode::NO_CONTENT);
        assert!(!upstream.has_upload(&upload_id));

        let second = gateway
            .abort_multipart_upload("b", "k", &upload_id)
            .await
            .expect("second abort succeeds");
        assert_eq!(second.status, StatusCode::NO_CONTENT);
        assert!(!upstream.contains_object("b", "k"), "no residue after abort");
    }

    #[tokio::test]
    async fn test_should_reap_idle_uploads() {
        let upstream = Arc::new(MemoryUpstream::new());
        let gateway = test_gateway(Arc::clone(&upstream));
        let upload_id = create(&gateway, "b", "k").await;
        assert_eq!(gateway.uploads.len(), 1);

        // Nothing is older than an hour yet.
        assert_eq!(
            gateway
                .reap_uploads_older_than(Duration::from_secs(3600))
                .await,
            0
        );

        // Everything is older than zero.
        assert_eq!(
            gateway.reap_uploads_older_than(Duration::ZERO).await,
            1
        );
        assert!(gateway.uploads.is_empty());
        assert!(!upstream.has_upload(&upload_id), "reaper aborted upstream");
    }

    #[tokio::test]
    async fn test_should_use_one_dek_per_upload() {
        let upstream = Arc::new(MemoryUpstream::new());
        let gateway = test_gateway(Arc::clone(&upstream));

        let data = payload(2048, 17);
        for key in ["k1", "k2"] {
            let response = gateway
                .create_multipart_upload("b", key, &HeaderMap::new())
                .await
                .expect("create succeeds");
            let body = response.body.collect().await.expect("body");
            let upload_id = xml::parse_initiate_result(&body).expect("upload id");
            let response = gateway
                .upload_part("b", key, &upload_id, 1, Bytes::from(data.clone()))
                .await
                .expect("upload succeeds");
            let etag = response
                .headers
                .get("etag")
                .and_then(|v| v.to_str().ok())
                .expect("etag")
                .to_owned();
            let body = xml::write_complete_request(&[CompletedPart {
                part_number: 1,
                etag,
            }]);
            gateway
                .complete_multipart_upload("b", key, &upload_id, Bytes::from(body))
                .await
                .expect("complete succeeds");
        }

        // Same plaintext, distinct DEK/IV per upload: ciphertexts differ.
        let c1 = upstream.stored_object("b", "k1").expect("stored").data;
        let c2 = upstream.stored_object("b", "k2").expect("stored").data;
        assert_ne!(c1, c2);
    }
}
