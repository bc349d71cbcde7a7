//! The upstream store seam.
//!
//! Everything the gateway sends to or receives from the S3-compatible
//! upstream goes through [`UpstreamClient`]. The production implementation
//! ([`http::HttpUpstream`]) re-signs each request with the gateway's
//! service credentials and speaks real HTTP; the in-memory implementation
//! ([`memory::MemoryUpstream`], `test-util`) emulates just enough of the
//! S3 surface for the test suite to exercise the full pipeline.

pub mod http;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;

use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;

/// A request bound for the upstream store.
///
/// The path and query are sent verbatim; the implementation adds `Host`,
/// `x-amz-date`, `x-amz-content-sha256`, and `Authorization`. Request
/// bodies are buffered: every body the gateway forwards has already been
/// collected for payload-hash verification or encryption.
#[derive(Debug)]
pub struct UpstreamRequest {
    /// HTTP method.
    pub method: ::http::Method,
    /// URI path, percent-encoded, e.g. `/bucket/key`.
    pub path: String,
    /// Raw query string without the leading `?`; empty for none.
    pub query: String,
    /// Headers to forward; hop-by-hop and auth headers are ignored.
    pub headers: ::http::HeaderMap,
    /// The request body.
    pub body: Bytes,
}

impl UpstreamRequest {
    /// A bodyless request.
    #[must_use]
    pub fn new(method: ::http::Method, path: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: query.into(),
            headers: ::http::HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Attach a body.
    #[must_use]
    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    /// Attach headers.
    #[must_use]
    pub fn with_headers(mut self, headers: ::http::HeaderMap) -> Self {
        self.headers = headers;
        self
    }
}

/// A response from the upstream store.
#[derive(Debug)]
pub struct UpstreamResponse {
    /// HTTP status.
    pub status: ::http::StatusCode,
    /// Response headers as received.
    pub headers: ::http::HeaderMap,
    /// Response body.
    pub body: UpstreamBody,
}

impl UpstreamResponse {
    /// An empty response with the given status.
    #[must_use]
    pub fn empty(status: ::http::StatusCode) -> Self {
        Self {
            status,
            headers: ::http::HeaderMap::new(),
            body: UpstreamBody::Buffered(Bytes::new()),
        }
    }
}

/// A response body: buffered for bodies the gateway must transform, or a
/// stream for pass-through downloads where back-pressure should flow from
/// the client to the upstream connection.
pub enum UpstreamBody {
    /// Fully buffered bytes.
    Buffered(Bytes),
    /// A byte stream.
    Stream(BoxStream<'static, Result<Bytes, UpstreamError>>),
}

impl std::fmt::Debug for UpstreamBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buffered(bytes) => f.debug_tuple("Buffered").field(&bytes.len()).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

impl UpstreamBody {
    /// Collect the body into contiguous bytes.
    ///
    /// # Errors
    ///
    /// Returns the first transport error the stream yields.
    pub async fn collect(self) -> Result<Bytes, UpstreamError> {
        match self {
            Self::Buffered(bytes) => Ok(bytes),
            Self::Stream(mut stream) => {
                let mut out = Vec::new();
                while let Some(chunk) = stream.next().await {
                    out.extend_from_slice(&chunk?);
                }
                Ok(Bytes::from(out))
            }
        }
    }
}

/// Transport-level upstream failures. HTTP error *responses* are not
/// errors here; they are returned as [`UpstreamResponse`]s and mirrored to
/// the client.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    /// The request could not be sent or the response could not be read.
    #[error("upstream transport failure: {0}")]
    Transport(String),

    /// The response violated an assumption the gateway depends on.
    #[error("invalid upstream response: {0}")]
    InvalidResponse(String),

    /// Outbound signing failed.
    #[error("failed to sign upstream request: {0}")]
    Signing(#[from] cryptgate_auth::AuthError),
}

/// The seam between the gateway and the upstream store.
#[async_trait::async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Execute one request against the upstream store.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError`] only for transport-level failures;
    /// HTTP-level errors come back as responses.
    async fn execute(&self, request: UpstreamRequest) -> Result<UpstreamResponse, UpstreamError>;
}
