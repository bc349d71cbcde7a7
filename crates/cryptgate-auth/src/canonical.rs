//! Canonical request construction for AWS Signature Version 4.
//!
//! Both sides of the proxy build signatures through [`CanonicalRequest`]:
//! the inbound verifier reconstructs what the client signed, and the
//! outbound re-signer covers what actually goes to the upstream. Sharing
//! one type keeps the two from drifting apart, and puts the gateway's
//! signing rule in exactly one place: hop-by-hop headers and the
//! `Authorization` header itself never enter the signed set. An
//! intermediary is free to rewrite hop-by-hop headers, so a proxy that
//! signed them would produce signatures the upstream could never check —
//! and the verifier refuses inbound requests that claim to cover them.
//!
//! The rendered format follows the SigV4 specification:
//!
//! ```text
//! HTTPRequestMethod\n
//! CanonicalURI\n
//! CanonicalQueryString\n
//! CanonicalHeaders\n\n
//! SignedHeaders\n
//! HashedPayload
//! ```

use std::collections::BTreeMap;
use std::fmt;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use sha2::{Digest, Sha256};

/// Characters left raw in canonical URI path segments: the RFC 3986
/// unreserved set. Slashes separate segments and are handled around the
/// encoder.
const SEGMENT_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Hop-by-hop headers, connection-scoped and rewritable by any
/// intermediary.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Return `true` if the (lowercase) header name is hop-by-hop.
#[must_use]
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name) || name.starts_with("proxy-")
}

/// Return `true` if the (lowercase) header name can never participate in
/// signing: hop-by-hop headers, and `Authorization` — a signature cannot
/// cover the header that carries it.
#[must_use]
pub fn is_unsignable(name: &str) -> bool {
    name == "authorization" || is_hop_by_hop(name)
}

/// A SigV4 canonical request.
///
/// Construction normalizes everything once: header names are lowercased,
/// values whitespace-collapsed, duplicates merged in arrival order, and
/// unsignable names dropped. The signed-header list is derived from what
/// survived ([`Self::signed_headers`]), so callers cannot sign one set and
/// declare another.
#[derive(Debug)]
pub struct CanonicalRequest {
    method: String,
    canonical_uri: String,
    canonical_query: String,
    headers: BTreeMap<String, String>,
    payload_hash: String,
}

impl CanonicalRequest {
    /// Assemble a canonical request from raw request components.
    ///
    /// `path` and `query` are taken as they appear on the wire; `headers`
    /// may be in any case and order and may contain repeats.
    #[must_use]
    pub fn new(
        method: &str,
        path: &str,
        query: &str,
        headers: &[(&str, &str)],
        payload_hash: &str,
    ) -> Self {
        let mut canonical_headers: BTreeMap<String, String> = BTreeMap::new();
        for (name, value) in headers {
            let name = name.to_ascii_lowercase();
            if is_unsignable(&name) {
                continue;
            }
            let value = canonical_header_value(value);
            canonical_headers
                .entry(name)
                .and_modify(|existing| {
                    existing.push(',');
                    existing.push_str(&value);
                })
                .or_insert(value);
        }

        Self {
            method: method.to_owned(),
            canonical_uri: canonical_uri(path),
            canonical_query: canonical_query(query),
            headers: canonical_headers,
            payload_hash: payload_hash.to_owned(),
        }
    }

    /// The sorted, semicolon-separated `SignedHeaders` list this request
    /// covers.
    #[must_use]
    pub fn signed_headers(&self) -> String {
        self.headers
            .keys()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(";")
    }

    /// Hex SHA-256 over the rendered canonical request — the value that
    /// enters the string to sign.
    #[must_use]
    pub fn hash_hex(&self) -> String {
        hex::encode(Sha256::digest(self.to_string().as_bytes()))
    }
}

impl fmt::Display for CanonicalRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.method)?;
        writeln!(f, "{}", self.canonical_uri)?;
        writeln!(f, "{}", self.canonical_query)?;
        for (name, value) in &self.headers {
            writeln!(f, "{name}:{value}")?;
        }
        writeln!(f)?;
        writeln!(f, "{}", self.signed_headers())?;
        write!(f, "{}", self.payload_hash)
    }
}

/// Canonicalize a header value: trim, and collapse interior whitespace
/// runs to single spaces.
fn canonical_header_value(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Canonicalize a URI path: each segment is decoded and re-encoded against
/// the unreserved set, so an already percent-encoded path comes out
/// unchanged rather than double-encoded. Empty paths normalize to `/`.
fn canonical_uri(path: &str) -> String {
    if path.is_empty() {
        return "/".to_owned();
    }
    path.split('/')
        .map(encode_segment)
        .collect::<Vec<_>>()
        .join("/")
}

fn encode_segment(segment: &str) -> String {
    let decoded = percent_decode_str(segment).decode_utf8_lossy();
    utf8_percent_encode(&decoded, SEGMENT_ENCODE_SET).to_string()
}

/// Canonicalize a query string: parameters grouped by name, names in byte
/// order, repeated names ordered by value.
///
/// Values are preserved exactly as they appear on the wire — no decode or
/// re-encode. Clients disagree on query encoding (AWS SDKs percent-encode
/// `:` and `*`, OkHttp-based clients leave them raw), and the verifier
/// must reproduce whichever form the client actually signed.
fn canonical_query(query: &str) -> String {
    let mut params: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        params.entry(name).or_default().push(value);
    }

    let mut rendered = Vec::new();
    for (name, mut values) in params {
        values.sort_unstable();
        for value in values {
            rendered.push(format!("{name}={value}"));
        }
    }
    rendered.join("&")
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The AWS SigV4 GET Object test vector, built through
    /// [`CanonicalRequest`].
    fn aws_vector_request() -> CanonicalRequest {
        let empty_hash = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
        CanonicalRequest::new(
            "GET",
            "/test.txt",
            "",
            &[
                ("Host", "examplebucket.s3.amazonaws.com"),
                ("Range", "bytes=0-9"),
                ("x-amz-content-sha256", empty_hash),
                ("x-amz-date", "20130524T000000Z"),
            ],
            empty_hash,
        )
    }

    #[test]
    fn test_should_hash_aws_test_vector() {
        assert_eq!(
            aws_vector_request().hash_hex(),
            "7344ae5b7ee6c3e7e6b0fe0640412a37625d1fbfff95c48bbb2dc43964946972"
        );
    }

    #[test]
    fn test_should_derive_sorted_signed_headers() {
        let request = CanonicalRequest::new(
            "PUT",
            "/b/k",
            "",
            &[
                ("x-amz-date", "20130524T000000Z"),
                ("Host", "gateway.local"),
                ("x-amz-meta-owner", "alice"),
            ],
            "UNSIGNED-PAYLOAD",
        );
        assert_eq!(request.signed_headers(), "host;x-amz-date;x-amz-meta-owner");
    }

    #[test]
    fn test_should_drop_unsignable_headers_from_signed_set() {
        let request = CanonicalRequest::new(
            "PUT",
            "/b/k",
            "",
            &[
                ("Host", "gateway.local"),
                ("Connection", "keep-alive"),
                ("Transfer-Encoding", "chunked"),
                ("Proxy-Authorization", "Basic abc"),
                ("Authorization", "AWS4-HMAC-SHA256 ..."),
            ],
            "UNSIGNED-PAYLOAD",
        );
        assert_eq!(request.signed_headers(), "host");
        let rendered = request.to_string();
        assert!(!rendered.contains("connection"));
        assert!(!rendered.contains("authorization"));
    }

    #[test]
    fn test_should_merge_repeated_headers_in_arrival_order() {
        let request = CanonicalRequest::new(
            "GET",
            "/b",
            "",
            &[
                ("Host", "gateway.local"),
                ("X-Custom", "second"),
                ("x-custom", "first"),
            ],
            "UNSIGNED-PAYLOAD",
        );
        assert!(request.to_string().contains("x-custom:second,first"));
    }

    #[test]
    fn test_should_normalize_header_whitespace() {
        let request = CanonicalRequest::new(
            "GET",
            "/b",
            "",
            &[("Host", "  gateway.local "), ("X-Note", "a \t b\t\tc")],
            "UNSIGNED-PAYLOAD",
        );
        let rendered = request.to_string();
        assert!(rendered.contains("host:gateway.local\n"));
        assert!(rendered.contains("x-note:a b c\n"));
    }

    #[test]
    fn test_should_render_canonical_layout() {
        let rendered = aws_vector_request().to_string();
        let lines: Vec<&str> = rendered.split('\n').collect();
        assert_eq!(lines[0], "GET");
        assert_eq!(lines[1], "/test.txt");
        assert_eq!(lines[2], "");
        // Method, URI, empty query, four header lines, a blank separator,
        // the signed list, and the payload hash.
        assert_eq!(lines.len(), 10);
        assert_eq!(lines[7], "");
        assert_eq!(lines[8], "host;range;x-amz-content-sha256;x-amz-date");
    }

    #[test]
    fn test_should_normalize_uri_paths() {
        assert_eq!(canonical_uri(""), "/");
        assert_eq!(canonical_uri("/"), "/");
        assert_eq!(canonical_uri("/bucket/my key"), "/bucket/my%20key");
    }

    #[test]
    fn test_should_not_double_encode_uri_segments() {
        assert_eq!(canonical_uri("/bucket/my%20key"), "/bucket/my%20key");
        assert_eq!(canonical_uri("/bucket/my key"), canonical_uri("/bucket/my%20key"));
    }

    #[test]
    fn test_should_order_query_by_name_then_value() {
        assert_eq!(
            canonical_query("uploadId=u&partNumber=2&partNumber=10"),
            "partNumber=10&partNumber=2&uploadId=u"
        );
    }

    #[test]
    fn test_should_keep_query_values_as_sent() {
        // Percent-encoded and raw forms both survive untouched.
        assert_eq!(
            canonical_query("events=s3%3AObjectCreated%3A%2A"),
            "events=s3%3AObjectCreated%3A%2A"
        );
        assert_eq!(
            canonical_query("events=s3:ObjectCreated:*"),
            "events=s3:ObjectCreated:*"
        );
    }

    #[test]
    fn test_should_handle_valueless_query_parameters() {
        assert_eq!(canonical_query("uploads&prefix=a"), "prefix=a&uploads=");
        assert_eq!(canonical_query(""), "");
    }

    #[test]
    fn test_should_classify_hop_by_hop_headers() {
        assert!(is_hop_by_hop("connection"));
        assert!(is_hop_by_hop("te"));
        assert!(is_hop_by_hop("proxy-anything"));
        assert!(!is_hop_by_hop("host"));

        assert!(is_unsignable("authorization"));
        assert!(is_unsignable("transfer-encoding"));
        assert!(!is_unsignable("x-amz-date"));
    }
}
