//! AWS streaming-payload (aws-chunked) decoder.
//!
//! Clients signing with `STREAMING-AWS4-HMAC-SHA256-PAYLOAD` frame the body
//! as:
//!
//! ```text
//! <hex-size>;chunk-signature=<sig>\r\n
//! <data>\r\n
//! 0;chunk-signature=<sig>\r\n
//! [trailer lines]
//! \r\n
//! ```
//!
//! The decoder enforces the framing end to end — size lines, CRLF
//! delimiters, the signature extension's shape, the terminal frame, and
//! the trailer section — and yields only the raw payload bytes, because
//! the framing must never reach the crypto layer or the upstream store.
//!
//! Chunk signature VALUES are deliberately not verified. The signature
//! chain is keyed to the client-gateway leg: this proxy re-signs toward
//! the upstream under its own credentials, so the chain ends here by
//! construction. Transport integrity on this leg is TLS's job; payload
//! integrity after this point is carried by the envelope HMAC. What the
//! gateway does keep from the framing is its [`DecodedPayload::chunks`]
//! count, which the service feeds into the streaming-upload metrics.

use bytes::{Bytes, BytesMut};
use cryptgate_model::{S3Error, s3_error};

/// Hex length of a SigV4 chunk signature (HMAC-SHA256).
const CHUNK_SIGNATURE_LEN: usize = 64;

/// An aws-chunked body with its framing removed.
#[derive(Debug)]
pub struct DecodedPayload {
    /// The concatenated raw payload bytes.
    pub data: Bytes,
    /// How many non-terminal data chunks the client sent.
    pub chunks: usize,
}

/// Return `true` if the request body uses the aws-chunked framing.
///
/// Detection checks:
/// - `Content-Encoding` carries an `aws-chunked` token, OR
/// - `x-amz-content-sha256` starts with `STREAMING-`
#[must_use]
pub fn is_aws_chunked(parts: &http::request::Parts) -> bool {
    let header = |name: &str| {
        parts
            .headers
            .get(name)
            .and_then(|value| value.to_str().ok())
    };

    header("content-encoding").is_some_and(|value| {
        value
            .split(',')
            .any(|token| token.trim().eq_ignore_ascii_case("aws-chunked"))
    }) || header("x-amz-content-sha256").is_some_and(|value| value.starts_with("STREAMING-"))
}

/// Decode an aws-chunked body into its raw payload.
///
/// # Errors
///
/// Returns `InvalidArgument` if the framing is malformed: a missing or
/// non-hex size line, a chunk-signature extension of the wrong shape,
/// truncated chunk data, a missing terminal frame, or bytes after the
/// trailer section.
pub fn decode_aws_chunked(body: &[u8]) -> Result<DecodedPayload, S3Error> {
    let mut cursor = ChunkCursor::new(body);
    let mut data = BytesMut::new();
    let mut chunks = 0;

    loop {
        let size = parse_size_line(cursor.line("chunk size line")?)?;
        if size == 0 {
            break;
        }
        data.extend_from_slice(cursor.chunk(size)?);
        chunks += 1;
    }

    // Trailer section: zero or more header lines, ended by an empty line.
    // Trailing checksums are not interpreted, but the section must be
    // well-formed and nothing may follow it.
    while !cursor.is_empty() {
        if cursor.line("trailer line")?.is_empty() {
            if !cursor.is_empty() {
                return Err(s3_error!(
                    InvalidArgument,
                    "malformed aws-chunked body: data after the trailer section"
                ));
            }
            break;
        }
    }

    Ok(DecodedPayload {
        data: data.freeze(),
        chunks,
    })
}

/// Remove `aws-chunked` from the `Content-Encoding` header.
///
/// Once the framing is decoded the stored object is no longer aws-chunked;
/// leaving the token in place would corrupt the object's representation
/// metadata. If the header becomes empty it is deleted entirely.
pub fn strip_aws_chunked_encoding(headers: &mut http::HeaderMap) {
    let Some(value) = headers
        .get(http::header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(ToOwned::to_owned)
    else {
        return;
    };

    let remaining = value
        .split(',')
        .map(str::trim)
        .filter(|token| !token.eq_ignore_ascii_case("aws-chunked"))
        .collect::<Vec<_>>()
        .join(", ");

    if remaining.is_empty() {
        headers.remove(http::header::CONTENT_ENCODING);
    } else if let Ok(new_value) = http::header::HeaderValue::from_str(&remaining) {
        headers.insert(http::header::CONTENT_ENCODING, new_value);
    }
}

/// Byte cursor over the framed body.
struct ChunkCursor<'a> {
    rest: &'a [u8],
}

impl<'a> ChunkCursor<'a> {
    fn new(body: &'a [u8]) -> Self {
        Self { rest: body }
    }

    fn is_empty(&self) -> bool {
        self.rest.is_empty()
    }

    /// Consume up to the next CRLF, returning the line without it.
    fn line(&mut self, expected: &str) -> Result<&'a [u8], S3Error> {
        let pos = self
            .rest
            .windows(2)
            .position(|window| window == b"\r\n")
            .ok_or_else(|| {
                s3_error!(
                    InvalidArgument,
                    format!("malformed aws-chunked body: missing {expected}")
                )
            })?;
        let (line, rest) = self.rest.split_at(pos);
        self.rest = &rest[2..];
        Ok(line)
    }

    /// Consume exactly `len` payload bytes plus their trailing CRLF.
    fn chunk(&mut self, len: usize) -> Result<&'a [u8], S3Error> {
        if self.rest.len() < len + 2 {
            return Err(s3_error!(
                InvalidArgument,
                "malformed aws-chunked body: chunk data truncated"
            ));
        }
        let (data, rest) = self.rest.split_at(len);
        if &rest[..2] != b"\r\n" {
            return Err(s3_error!(
                InvalidArgument,
                "malformed aws-chunked body: missing CRLF after chunk data"
            ));
        }
        self.rest = &rest[2..];
        Ok(data)
    }
}

/// Parse a `<hex-size>[;chunk-signature=<hex>]` size line.
fn parse_size_line(line: &[u8]) -> Result<usize, S3Error> {
    let (size_hex, extension) = match line.iter().position(|&b| b == b';') {
        Some(pos) => (&line[..pos], Some(&line[pos + 1..])),
        None => (line, None),
    };

    let size = std::str::from_utf8(size_hex)
        .ok()
        .and_then(|s| usize::from_str_radix(s.trim(), 16).ok())
        .ok_or_else(|| {
            s3_error!(
                InvalidArgument,
                format!(
                    "malformed aws-chunked body: invalid chunk size '{}'",
                    String::from_utf8_lossy(size_hex)
                )
            )
        })?;

    if let Some(extension) = extension {
        validate_signature_extension(extension)?;
    }

    Ok(size)
}

/// Structurally validate a `chunk-signature=<hex>` extension.
///
/// The value itself stays opaque (see the module docs), but a signature of
/// the wrong shape means the framing is corrupt, not merely unverifiable.
fn validate_signature_extension(extension: &[u8]) -> Result<(), S3Error> {
    let Some(signature) = extension.strip_prefix(b"chunk-signature=") else {
        // Unknown extensions pass through untouched.
        return Ok(());
    };

    if signature.len() != CHUNK_SIGNATURE_LEN
        || !signature.iter().all(u8::is_ascii_hexdigit)
    {
        return Err(s3_error!(
            InvalidArgument,
            "malformed aws-chunked body: chunk-signature is not a 64-digit hex value"
        ));
    }
    Ok(())
}

/// Build an aws-chunked body from plaintext chunks (test helper for the
/// encoder side of the framing).
#[must_use]
pub fn encode_aws_chunked(chunks: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::new();
    for chunk in chunks {
        out.extend_from_slice(
            format!("{:x};chunk-signature={}\r\n", chunk.len(), "0".repeat(64)).as_bytes(),
        );
        out.extend_from_slice(chunk);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(format!("0;chunk-signature={}\r\n\r\n", "0".repeat(64)).as_bytes());
    out
}
