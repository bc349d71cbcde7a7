//! The reqwest-backed upstream client.
//!
//! Signs every request with the gateway's service credentials (never a
//! client's) and exposes response bodies as streams so downloads are not
//! buffered on the pass-through path.

use chrono::Utc;
use futures::{StreamExt, TryStreamExt};
use tracing::debug;
use url::Url;

use cryptgate_auth::sign::{ServiceCredentials, sign_request};
use cryptgate_auth::verify::hash_payload;

use super::{UpstreamBody, UpstreamClient, UpstreamError, UpstreamRequest, UpstreamResponse};
use crate::config::GatewayConfig;

/// HTTP client toward the upstream S3 endpoint.
#[derive(Debug)]
pub struct HttpUpstream {
    endpoint: Url,
    host_header: String,
    credentials: ServiceCredentials,
    client: reqwest::Client,
}

impl HttpUpstream {
    /// Build from validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError::InvalidResponse`] if the endpoint URL is
    /// unusable (validation should have caught this earlier).
    pub fn from_config(config: &GatewayConfig) -> Result<Self, UpstreamError> {
        let endpoint = Url::parse(&config.target_endpoint)
            .map_err(|e| UpstreamError::InvalidResponse(format!("target endpoint: {e}")))?;

        let host = endpoint
            .host_str()
            .ok_or_else(|| UpstreamError::InvalidResponse("target endpoint has no host".into()))?;
        let host_header = match endpoint.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_owned(),
        };

        Ok(Self {
            endpoint,
            host_header,
            credentials: config.service_credentials(),
            client: reqwest::Client::new(),
        })
    }
}

#[async_trait::async_trait]
impl UpstreamClient for HttpUpstream {
    async fn execute(&self, request: UpstreamRequest) -> Result<UpstreamResponse, UpstreamError> {
        let mut url = self.endpoint.clone();
        url.set_path(&request.path);
        if request.query.is_empty() {
            url.set_query(None);
        } else {
            url.set_query(Some(&request.query));
        }

        let mut headers = request.headers;
        headers.insert(
            http::header::HOST,
            http::header::HeaderValue::from_str(&self.host_header)
                .map_err(|_| UpstreamError::InvalidResponse("unrepresentable host".into()))?,
        );

        let payload_hash = hash_payload(&request.body);
        sign_request(
            request.method.as_str(),
            &request.path,
            &request.query,
            &mut headers,
            &payload_hash,
            &self.credentials,
            Utc::now(),
        )?;

        debug!(method = %request.method, url = %url, "sending upstream request");

        let response = self
            .client
            .request(request.method, url)
            .headers(headers)
            .body(request.body)
            .send()
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        let status = response.status();
        let response_headers = response.headers().clone();
        let stream = response
            .bytes_stream()
            .map_err(|e| UpstreamError::Transport(e.to_string()))
            .boxed();

        Ok(UpstreamResponse {
            status,
            headers: response_headers,
            body: UpstreamBody::Stream(stream),
        })
    }
}

/// Percent-encode a copy-source header value (`/bucket/key`).
#[must_use]
pub fn encode_copy_source(bucket: &str, key: &str) -> String {
    use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
    // Keep `/` readable; encode everything S3 would reject in a header.
    const COPY_SOURCE_SET: &AsciiSet = &CONTROLS
        .add(b' ')
        .add(b'"')
        .add(b'%')
        .add(b'<')
        .add(b'>')
        .add(b'?')
        .add(b'#')
        .add(b'{')
        .add(b'}');
    format!(
        "/{}/{}",
        utf8_percent_encode(bucket, COPY_SOURCE_SET),
        utf8_percent_encode(key, COPY_SOURCE_SET)
    )
}

/// Encode a bucket/key pair into a request path.
#[must_use]
pub fn object_path(bucket: &str, key: &str) -> String {
    use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
    // RFC 3986 unreserved plus `/` for key separators.
    const PATH_SET: &AsciiSet = &CONTROLS
        .add(b' ')
        .add(b'"')
        .add(b'#')
        .add(b'%')
        .add(b'<')
        .add(b'>')
        .add(b'?')
        .add(b'[')
        .add(b']')
        .add(b'^')
        .add(b'`')
        .add(b'{')
        .add(b'|')
        .add(b'}')
        .add(b'\\');
    format!(
        "/{}/{}",
        utf8_percent_encode(bucket, PATH_SET),
        utf8_percent_encode(key, PATH_SET)
    )
}
