//! The gateway response body.
//!
//! Three modes: buffered (error XML, decrypted objects, multipart results),
//! empty (HEAD, 204s), and streaming (pass-through downloads, where
//! back-pressure should flow from the client socket to the upstream
//! connection).

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use futures::stream::BoxStream;
use http_body_util::Full;

use cryptgate_core::upstream::{UpstreamBody, UpstreamResponse};

/// Response body handed to hyper.
#[derive(Default)]
pub enum GatewayBody {
    /// Fully buffered body.
    Buffered(Full<Bytes>),
    /// No body at all.
    #[default]
    Empty,
    /// Streamed body fed from the upstream connection.
    Streaming(BoxStream<'static, Result<Bytes, io::Error>>),
}

impl std::fmt::Debug for GatewayBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buffered(_) => f.write_str("Buffered(..)"),
            Self::Empty => f.write_str("Empty"),
            Self::Streaming(_) => f.write_str("Streaming(..)"),
        }
    }
}

impl GatewayBody {
    /// A buffered body from bytes; empty input becomes [`Self::Empty`].
    #[must_use]
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        let bytes = data.into();
        if bytes.is_empty() {
            Self::Empty
        } else {
            Self::Buffered(Full::new(bytes))
        }
    }

    /// An empty body.
    #[must_use]
    pub fn empty() -> Self {
        Self::Empty
    }
}

impl From<UpstreamBody> for GatewayBody {
    fn from(body: UpstreamBody) -> Self {
        match body {
            UpstreamBody::Buffered(bytes) => Self::from_bytes(bytes),
            UpstreamBody::Stream(stream) => Self::Streaming(Box::pin(
                futures::StreamExt::map(stream, |chunk| chunk.map_err(io::Error::other)),
            )),
        }
    }
}

impl http_body::Body for GatewayBody {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<http_body::Frame<Self::Data>, Self::Error>>> {
        match self.get_mut() {
            Self::Buffered(full) => Pin::new(full)
                .poll_frame(cx)
                .map_err(|never| match never {}),
            Self::Empty => Poll::Ready(None),
            Self::Streaming(stream) => match Pin::new(stream).poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    Poll::Ready(Some(Ok(http_body::Frame::data(chunk))))
                }
                Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e))),
                Poll::Ready(None) => Poll::Ready(None),
                Poll::Pending => Poll::Pending,
            },
        }
    }

    fn is_end_stream(&self) -> bool {
        match self {
            Self::Buffered(full) => full.is_end_stream(),
            Self::Empty => true,
            Self::Streaming(_) => false,
        }
    }

    fn size_hint(&self) -> http_body::SizeHint {
        match self {
            Self::Buffered(full) => full.size_hint(),
            Self::Empty => http_body::SizeHint::with_exact(0),
            Self::Streaming(_) => http_body::SizeHint::default(),
        }
    }
}

/// Convert a gateway-core response into a hyper response.
#[must_use]
pub fn into_http_response(response: UpstreamResponse) -> http::Response<GatewayBody> {
    let mut builder = http::Response::builder().status(response.status);
    if let Some(headers) = builder.headers_mut() {
        *headers = response.headers;
    }
    builder
        .body(GatewayBody::from(response.body))
        .unwrap_or_else(|_| {
            http::Response::builder()
                .status(http::StatusCode::INTERNAL_SERVER_ERROR)
                .body(GatewayBody::empty())
                .expect("static response should be valid")
        })
}
