//! The hyper service: the full request lifecycle.
//!
//! 1. Health / metrics endpoint interception (never proxied).
//! 2. Virtual-hosted-style rejection (path-style is mandatory).
//! 3. Routing.
//! 4. Body collection and SigV4 verification against registered clients —
//!    no upstream request is ever issued for a request that fails here.
//! 5. aws-chunked decoding for streaming payloads.
//! 6. Dispatch to the gateway core under the per-verb timeout.
//! 7. Error shaping into S3 XML and common response headers.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes};
use chrono::Utc;
use http_body_util::BodyExt;
use hyper::service::Service;
use tracing::{debug, info, warn};
use uuid::Uuid;

use cryptgate_auth::verify::{PayloadHash, VerifyPolicy, verify_request};
use cryptgate_auth::StaticCredentialProvider;
use cryptgate_core::Gateway;
use cryptgate_core::error::auth_error_to_s3;
use cryptgate_core::upstream::UpstreamResponse;
use cryptgate_model::xml::error_to_xml;
use cryptgate_model::{S3Error, S3ErrorCode};

use crate::body::{GatewayBody, into_http_response};
use crate::codec;
use crate::router::{self, GatewayOperation, RouteContext};

/// The S3-facing hyper service.
pub struct GatewayService {
    gateway: Arc<Gateway>,
    credentials: Arc<StaticCredentialProvider>,
    policy: VerifyPolicy,
    virtual_host_domain: Option<String>,
    put_timeout: Duration,
    get_timeout: Duration,
}

impl std::fmt::Debug for GatewayService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayService")
            .field("clients", &self.credentials.len())
            .field("virtual_host_domain", &self.virtual_host_domain)
            .finish_non_exhaustive()
    }
}

impl Clone for GatewayService {
    fn clone(&self) -> Self {
        Self {
            gateway: Arc::clone(&self.gateway),
            credentials: Arc::clone(&self.credentials),
            policy: self.policy.clone(),
            virtual_host_domain: self.virtual_host_domain.clone(),
            put_timeout: self.put_timeout,
            get_timeout: self.get_timeout,
        }
    }
}

impl GatewayService {
    /// Build the service around a gateway.
    #[must_use]
    pub fn new(gateway: Arc<Gateway>) -> Self {
        let config = gateway.config();
        Self {
            credentials: Arc::new(config.credential_provider()),
            policy: config.verify_policy(),
            virtual_host_domain: config.virtual_host_domain.clone(),
            put_timeout: Duration::from_secs(config.limits.put_timeout_secs),
            get_timeout: Duration::from_secs(config.limits.get_timeout_secs),
            gateway,
        }
    }

    async fn process<B>(
        &self,
        req: http::Request<B>,
        request_id: &str,
    ) -> Result<http::Response<GatewayBody>, S3Error>
    where
        B: http_body::Body + Send + 'static,
        B::Data: Buf + Send,
        B::Error: std::fmt::Display,
    {
        let metrics = self.gateway.metrics();
        metrics.record_request();

        let method = req.method().clone();
        let path = req.uri().path().to_owned();
        debug!(%method, path, request_id, "processing request");

        // Operational endpoints are served locally, never proxied.
        if method == http::Method::GET && (path == "/health" || path == "/_health") {
            return Ok(health_response());
        }
        if method == http::Method::GET && path == "/metrics" {
            return Ok(metrics_response(&metrics.render()));
        }

        self.reject_virtual_hosted(req.headers())?;

        let ctx = router::resolve(&req)?;

        let (mut parts, body) = req.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| S3Error::internal_error(format!("failed to read request body: {e}")))?
            .to_bytes();

        // Authentication gates everything that could reach the upstream.
        let auth = verify_request(
            &parts,
            &body,
            self.credentials.as_ref(),
            &self.policy,
            Utc::now(),
        )
        .map_err(|e| {
            metrics.record_auth_failure(e.metric_label());
            warn!(request_id, error = %e, "authentication failed");
            auth_error_to_s3(&e)
        })?;

        // Streaming payloads carry the aws-chunked framing; strip it so
        // only raw plaintext enters the crypto layer.
        let body = if auth.payload_hash == PayloadHash::Streaming || codec::is_aws_chunked(&parts)
        {
            let decoded = codec::decode_aws_chunked(&body)?;
            codec::strip_aws_chunked_encoding(&mut parts.headers);
            metrics.record_chunked_upload(decoded.chunks as u64);
            debug!(
                chunks = decoded.chunks,
                payload_len = decoded.data.len(),
                request_id,
                "decoded aws-chunked payload"
            );
            decoded.data
        } else {
            body
        };

        info!(
            %method,
            path,
            operation = ?ctx.operation,
            access_key = %auth.access_key_id,
            request_id,
            "dispatching request"
        );

        let timeout = self.timeout_for(&ctx.operation);
        let response = tokio::time::timeout(timeout, self.dispatch(ctx, &parts, body))
            .await
            .map_err(|_| S3Error::internal_error("request processing timed out"))??;

        Ok(into_http_response(response))
    }

    fn timeout_for(&self, operation: &GatewayOperation) -> Duration {
        match operation {
            GatewayOperation::PutObject
            | GatewayOperation::CreateBucket
            | GatewayOperation::CreateMultipartUpload
            | GatewayOperation::UploadPart { .. }
            | GatewayOperation::CompleteMultipartUpload { .. } => self.put_timeout,
            _ => self.get_timeout,
        }
    }

    /// Reject virtual-hosted-style addressing when a domain is configured.
    fn reject_virtual_hosted(&self, headers: &http::HeaderMap) -> Result<(), S3Error> {
        let Some(domain) = &self.virtual_host_domain else {
            return Ok(());
        };
        let Some(host) = headers.get(http::header::HOST).and_then(|v| v.to_str().ok()) else {
            return Ok(());
        };

        let host = host.split(':').next().unwrap_or(host);
        let suffix = format!(".{domain}");
        if host.ends_with(&suffix) && host.len() > suffix.len() {
            return Err(S3Error::with_message(
                S3ErrorCode::InvalidRequest,
                "virtual-hosted-style addressing is not supported; use path-style requests",
            ));
        }
        Ok(())
    }

    async fn dispatch(
        &self,
        ctx: RouteContext,
        parts: &http::request::Parts,
        body: Bytes,
    ) -> Result<UpstreamResponse, S3Error> {
        let gateway = &self.gateway;
        let raw_query = parts.uri.query().unwrap_or("").to_owned();
        let path = parts.uri.path().to_owned();

        let RouteContext {
            bucket,
            key,
            operation,
        } = ctx;
        // Object-level arms below each consume this exactly once.
        let object = bucket.zip(key);
        let missing = || S3Error::internal_error("object route without bucket/key");

        match operation {
            GatewayOperation::ListBuckets
            | GatewayOperation::CreateBucket
            | GatewayOperation::DeleteBucket
            | GatewayOperation::ListObjects
            | GatewayOperation::BucketPassthrough
            | GatewayOperation::ObjectPassthrough
            | GatewayOperation::DeleteObject => {
                gateway
                    .passthrough(parts.method.clone(), path, raw_query, &parts.headers, body)
                    .await
            }
            GatewayOperation::PutObject => {
                let (bucket, key) = object.ok_or_else(missing)?;
                gateway.put_object(&bucket, &key, &parts.headers, body).await
            }
            GatewayOperation::GetObject => {
                let (bucket, key) = object.ok_or_else(missing)?;
                gateway.get_object(&bucket, &key).await
            }
            GatewayOperation::HeadObject => {
                let (bucket, key) = object.ok_or_else(missing)?;
                gateway.head_object(&bucket, &key).await
            }
            GatewayOperation::CreateMultipartUpload => {
                let (bucket, key) = object.ok_or_else(missing)?;
                gateway
                    .create_multipart_upload(&bucket, &key, &parts.headers)
                    .await
            }
            GatewayOperation::UploadPart {
                part_number,
                upload_id,
            } => {
                let (bucket, key) = object.ok_or_else(missing)?;
                gateway
                    .upload_part(&bucket, &key, &upload_id, part_number, body)
                    .await
            }
            GatewayOperation::CompleteMultipartUpload { upload_id } => {
                let (bucket, key) = object.ok_or_else(missing)?;
                gateway
                    .complete_multipart_upload(&bucket, &key, &upload_id, body)
                    .await
            }
            GatewayOperation::AbortMultipartUpload { upload_id } => {
                let (bucket, key) = object.ok_or_else(missing)?;
                gateway
                    .abort_multipart_upload(&bucket, &key, &upload_id)
                    .await
            }
        }
    }
}

impl<B> Service<http::Request<B>> for GatewayService
where
    B: http_body::Body + Send + 'static,
    B::Data: Buf + Send,
    B::Error: std::fmt::Display,
{
    type Response = http::Response<GatewayBody>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, req: http::Request<B>) -> Self::Future {
        let service = self.clone();

        Box::pin(async move {
            let request_id = Uuid::new_v4().to_string();

            let response = match service.process(req, &request_id).await {
                Ok(response) => response,
                Err(err) => {
                    debug!(request_id, error = %err, "request failed");
                    error_response(&err, &request_id)
                }
            };

            Ok(add_common_headers(response, &request_id))
        })
    }
}

/// Render an `S3Error` as an XML error response.
#[must_use]
pub fn error_response(err: &S3Error, request_id: &str) -> http::Response<GatewayBody> {
    let xml = error_to_xml(
        err.code.as_str(),
        &err.message,
        err.resource.as_deref(),
        request_id,
    );

    http::Response::builder()
        .status(err.status_code)
        .header("Content-Type", "application/xml")
        .body(GatewayBody::from_bytes(xml))
        .unwrap_or_else(|_| {
            http::Response::builder()
                .status(http::StatusCode::INTERNAL_SERVER_ERROR)
                .body(GatewayBody::empty())
                .expect("static response should be valid")
        })
}

fn health_response() -> http::Response<GatewayBody> {
    http::Response::builder()
        .status(http::StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(GatewayBody::from_bytes(
            r#"{"status":"running","service":"cryptgate"}"#,
        ))
        .expect("static health response should be valid")
}

fn metrics_response(rendered: &str) -> http::Response<GatewayBody> {
    http::Response::builder()
        .status(http::StatusCode::OK)
        .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
        .body(GatewayBody::from_bytes(rendered.to_owned()))
        .expect("static metrics response should be valid")
}

fn add_common_headers(
    mut response: http::Response<GatewayBody>,
    request_id: &str,
) -> http::Response<GatewayBody> {
    let headers = response.headers_mut();

    if let Ok(value) = http::header::HeaderValue::from_str(request_id) {
        headers.insert("x-amz-request-id", value);
    }
    headers.insert(
        "Server",
        http::header::HeaderValue::from_static("cryptgate"),
    );

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_render_error_response_as_xml() {
        let err = S3Error::new(S3ErrorCode::SignatureDoesNotMatch);
        let response = error_response(&err, "req-1");
        assert_eq!(response.status(), http::StatusCode::FORBIDDEN);
        assert_eq!(
            response
                .headers()
                .get("Content-Type")
                .and_then(|v| v.to_str().ok()),
            Some("application/xml")
        );
    }

    #[test]
    fn test_should_add_common_headers() {
        let response = http::Response::builder()
            .status(http::StatusCode::OK)
            .body(GatewayBody::empty())
            .expect("valid response");
        let response = add_common_headers(response, "req-42");
        assert_eq!(
            response
                .headers()
                .get("x-amz-request-id")
                .and_then(|v| v.to_str().ok()),
            Some("req-42")
        );
        assert_eq!(
            response.headers().get("Server").and_then(|v| v.to_str().ok()),
            Some("cryptgate")
        );
    }

    #[test]
    fn test_should_produce_health_response() {
        let response = health_response();
        assert_eq!(response.status(), http::StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get("Content-Type")
                .and_then(|v| v.to_str().ok()),
            Some("application/json")
        );
    }
}
