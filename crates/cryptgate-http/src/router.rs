//! S3 request routing.
//!
//! Maps (method, path shape, first query sub-resource) onto a gateway
//! operation. Path-style addressing only; the service layer rejects
//! virtual-hosted requests before routing. The gateway interposes on
//! object data operations and the multipart lifecycle; every other
//! operation — bucket CRUD, listings, and all sub-resources — is forwarded
//! upstream untouched, re-signed.

use http::Method;
use percent_encoding::percent_decode_str;

use cryptgate_model::{S3Error, S3ErrorCode};

/// The operation a request resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayOperation {
    /// GET on the service root.
    ListBuckets,
    /// PUT on a bucket with no sub-resource.
    CreateBucket,
    /// DELETE on a bucket with no sub-resource.
    DeleteBucket,
    /// GET on a bucket: list objects (v1 or v2).
    ListObjects,
    /// Any other bucket-level request (sub-resources, HEAD, POST).
    BucketPassthrough,
    /// PUT on an object with no sub-resource (and no copy source).
    PutObject,
    /// GET on an object with no sub-resource.
    GetObject,
    /// HEAD on an object.
    HeadObject,
    /// DELETE on an object with no sub-resource.
    DeleteObject,
    /// POST `?uploads`.
    CreateMultipartUpload,
    /// PUT `?partNumber=N&uploadId=U`.
    UploadPart {
        /// The 1-based part number.
        part_number: u32,
        /// The upstream-issued upload id.
        upload_id: String,
    },
    /// POST `?uploadId=U`.
    CompleteMultipartUpload {
        /// The upstream-issued upload id.
        upload_id: String,
    },
    /// DELETE `?uploadId=U`.
    AbortMultipartUpload {
        /// The upstream-issued upload id.
        upload_id: String,
    },
    /// Any other object-level request (ACL, tagging, copy, ListParts, ...).
    ObjectPassthrough,
}

/// The result of routing a request.
#[derive(Debug, Clone)]
pub struct RouteContext {
    /// Decoded bucket name, if any.
    pub bucket: Option<String>,
    /// Decoded object key, if any.
    pub key: Option<String>,
    /// The resolved operation.
    pub operation: GatewayOperation,
}

/// Object sub-resources the gateway recognizes as pass-through. Anything
/// else with a query key is also forwarded; the list exists only to keep
/// plain `?versionId=...` GETs on the pass-through path too.
const OBJECT_SUBRESOURCES: &[&str] = &[
    "acl",
    "tagging",
    "retention",
    "legal-hold",
    "attributes",
    "torrent",
    "versionId",
];

/// Resolve a request to a gateway operation.
///
/// # Errors
///
/// Returns `MethodNotAllowed` for methods the S3 surface does not accept.
pub fn resolve<B>(req: &http::Request<B>) -> Result<RouteContext, S3Error> {
    let method = req.method();
    let path = req.uri().path();
    let query = parse_query_params(req.uri().query().unwrap_or(""));

    let (bucket, key) = parse_path(path);

    let operation = match (&bucket, &key) {
        (None, _) => match *method {
            Method::GET => GatewayOperation::ListBuckets,
            _ => {
                return Err(S3Error::with_message(
                    S3ErrorCode::MethodNotAllowed,
                    "only GET is allowed at the service level",
                ));
            }
        },
        (Some(_), None) => resolve_bucket_operation(method, &query)?,
        (Some(_), Some(_)) => resolve_object_operation(method, &query, req.headers())?,
    };

    Ok(RouteContext {
        bucket,
        key,
        operation,
    })
}

fn resolve_bucket_operation(
    method: &Method,
    query: &[(String, String)],
) -> Result<GatewayOperation, S3Error> {
    let has_subresource = !query.is_empty() && !is_plain_list_query(query);

    Ok(match *method {
        Method::PUT if !has_subresource => GatewayOperation::CreateBucket,
        Method::DELETE if !has_subresource => GatewayOperation::DeleteBucket,
        Method::GET if !has_subresource => GatewayOperation::ListObjects,
        Method::GET | Method::PUT | Method::DELETE | Method::HEAD | Method::POST => {
            GatewayOperation::BucketPassthrough
        }
        _ => return Err(S3Error::method_not_allowed(method.as_str())),
    })
}

/// Query keys that are list-operation parameters rather than sub-resources.
fn is_plain_list_query(query: &[(String, String)]) -> bool {
    const LIST_PARAMS: &[&str] = &[
        "list-type",
        "prefix",
        "delimiter",
        "marker",
        "max-keys",
        "continuation-token",
        "start-after",
        "encoding-type",
        "fetch-owner",
    ];
    query.iter().all(|(k, _)| LIST_PARAMS.contains(&k.as_str()))
}

fn resolve_object_operation(
    method: &Method,
    query: &[(String, String)],
    headers: &http::HeaderMap,
) -> Result<GatewayOperation, S3Error> {
    let upload_id = query_value(query, "uploadId").map(ToOwned::to_owned);
    let has_copy_source = headers.contains_key("x-amz-copy-source");
    let has_known_subresource = OBJECT_SUBRESOURCES
        .iter()
        .any(|sub| query_has_key(query, sub));

    match *method {
        Method::POST => {
            if query_has_key(query, "uploads") {
                Ok(GatewayOperation::CreateMultipartUpload)
            } else if let Some(upload_id) = upload_id {
                Ok(GatewayOperation::CompleteMultipartUpload { upload_id })
            } else {
                Ok(GatewayOperation::ObjectPassthrough)
            }
        }
        Method::PUT => {
            if let Some(upload_id) = upload_id {
                if has_copy_source {
                    // UploadPartCopy would splice foreign ciphertext into
                    // the upload's keystream; the upstream cannot produce
                    // bytes that decrypt under this upload's DEK.
                    return Err(S3Error::with_message(
                        S3ErrorCode::NotImplemented,
                        "UploadPartCopy is not supported by this gateway",
                    ));
                }
                let part_number = query_value(query, "partNumber")
                    .and_then(|v| v.parse::<u32>().ok())
                    .ok_or_else(|| {
                        S3Error::invalid_argument("partNumber must be a positive integer")
                    })?;
                Ok(GatewayOperation::UploadPart {
                    part_number,
                    upload_id,
                })
            } else if has_known_subresource || has_copy_source || !query.is_empty() {
                Ok(GatewayOperation::ObjectPassthrough)
            } else {
                Ok(GatewayOperation::PutObject)
            }
        }
        Method::GET => {
            if upload_id.is_some() || has_known_subresource || !query.is_empty() {
                // ListParts and every sub-resource GET pass through.
                Ok(GatewayOperation::ObjectPassthrough)
            } else {
                Ok(GatewayOperation::GetObject)
            }
        }
        Method::HEAD => Ok(GatewayOperation::HeadObject),
        Method::DELETE => {
            if let Some(upload_id) = upload_id {
                Ok(GatewayOperation::AbortMultipartUpload { upload_id })
            } else if !query.is_empty() {
                Ok(GatewayOperation::ObjectPassthrough)
            } else {
                Ok(GatewayOperation::DeleteObject)
            }
        }
        _ => Err(S3Error::method_not_allowed(method.as_str())),
    }
}

/// Parse the URI path into an optional bucket and optional key.
///
/// Path format: `/{bucket}` or `/{bucket}/{key...}`.
fn parse_path(path: &str) -> (Option<String>, Option<String>) {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    if trimmed.is_empty() {
        return (None, None);
    }

    match trimmed.find('/') {
        Some(pos) => {
            let bucket = decode_uri_component(&trimmed[..pos]);
            let key_raw = &trimmed[pos + 1..];
            let key = if key_raw.is_empty() {
                None
            } else {
                Some(decode_uri_component(key_raw))
            };
            (Some(bucket), key)
        }
        None => (Some(decode_uri_component(trimmed)), None),
    }
}

fn decode_uri_component(s: &str) -> String {
    percent_decode_str(s).decode_utf8_lossy().into_owned()
}

fn parse_query_params(query: &str) -> Vec<(String, String)> {
    if query.is_empty() {
        return Vec::new();
    }

    query
        .split('&')
        .filter(|s| !s.is_empty())
        .map(|pair| match pair.find('=') {
            Some(pos) => (
                decode_uri_component(&pair[..pos]),
                decode_uri_component(&pair[pos + 1..]),
            ),
            None => (decode_uri_component(pair), String::new()),
        })
        .collect()
}

fn query_has_key(params: &[(String, String)], key: &str) -> bool {
    params.iter().any(|(k, _)| k == key)
}

fn query_value<'a>(params: &'a [(String, String)], key: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}
