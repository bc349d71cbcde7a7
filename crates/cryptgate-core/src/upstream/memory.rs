//! An in-memory upstream store for tests and local development.
//!
//! Emulates the slice of the S3 surface the gateway depends on: object
//! put/get/head/delete, multipart create/upload/complete/abort, and the
//! copy-in-place metadata rewrite. Deliberately small — anything the
//! gateway never exercises is a 501.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use http::{HeaderMap, Method, StatusCode};
use md5::{Digest, Md5};

use cryptgate_model::xml::{self, CompletedPart};

use super::{UpstreamBody, UpstreamClient, UpstreamError, UpstreamRequest, UpstreamResponse};

/// A stored object: bytes plus the metadata headers it was written with.
#[derive(Debug, Clone)]
pub struct StoredObject {
    /// Object bytes as stored (ciphertext, for encrypted writes).
    pub data: Bytes,
    /// Metadata headers (`content-type`, `x-amz-meta-*`).
    pub metadata: HeaderMap,
    /// The object's ETag, quotes included.
    pub etag: String,
}

#[derive(Debug)]
struct MemUpload {
    bucket: String,
    key: String,
    metadata: HeaderMap,
    parts: Mutex<BTreeMap<u32, (String, Bytes)>>,
}

/// The in-memory upstream.
#[derive(Debug, Default)]
pub struct MemoryUpstream {
    objects: DashMap<String, StoredObject>,
    uploads: DashMap<String, MemUpload>,
    upload_counter: AtomicU64,
    request_counter: AtomicU64,
}

impl MemoryUpstream {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct read of a stored object, bypassing the gateway — what a
    /// client talking straight to the upstream would see.
    #[must_use]
    pub fn stored_object(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.objects.get(&object_id(bucket, key)).map(|o| o.clone())
    }

    /// Whether any object exists under the key.
    #[must_use]
    pub fn contains_object(&self, bucket: &str, key: &str) -> bool {
        self.objects.contains_key(&object_id(bucket, key))
    }

    /// Whether an in-progress multipart upload exists.
    #[must_use]
    pub fn has_upload(&self, upload_id: &str) -> bool {
        self.uploads.contains_key(upload_id)
    }

    /// Total requests this store has served.
    #[must_use]
    pub fn request_count(&self) -> u64 {
        self.request_counter.load(Ordering::Relaxed)
    }

    fn put_object(&self, bucket: &str, key: &str, request: &UpstreamRequest) -> UpstreamResponse {
        // Copy-in-place with REPLACE is how the gateway attaches envelope
        // metadata after CompleteMultipartUpload.
        if let Some(source) = header_str(&request.headers, "x-amz-copy-source") {
            let directive = header_str(&request.headers, "x-amz-metadata-directive");
            let source_id = source.trim_start_matches('/').replace("%20", " ");
            let Some(existing) = self.objects.get(&source_id).map(|o| o.clone()) else {
                return error_response(StatusCode::NOT_FOUND, "NoSuchKey", &source_id);
            };

            let metadata = if directive == Some("REPLACE".to_owned()) {
                metadata_headers(&request.headers)
            } else {
                existing.metadata.clone()
            };

            let stored = StoredObject {
                data: existing.data,
                etag: existing.etag,
                metadata,
            };
            self.objects.insert(object_id(bucket, key), stored);

            let body = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
                 <CopyObjectResult><ETag>\"copied\"</ETag></CopyObjectResult>";
            return xml_response(StatusCode::OK, body.into());
        }

        let etag = quoted_md5(&request.body);
        let stored = StoredObject {
            data: request.body.clone(),
            metadata: metadata_headers(&request.headers),
            etag: etag.clone(),
        };
        self.objects.insert(object_id(bucket, key), stored);

        let mut headers = HeaderMap::new();
        headers.insert("etag", etag.parse().expect("valid etag header"));
        UpstreamResponse {
            status: StatusCode::OK,
            headers,
            body: UpstreamBody::Buffered(Bytes::new()),
        }
    }

    fn get_object(&self, bucket: &str, key: &str, head: bool) -> UpstreamResponse {
        let Some(stored) = self.stored_object(bucket, key) else {
            return if head {
                UpstreamResponse::empty(StatusCode::NOT_FOUND)
            } else {
                error_response(StatusCode::NOT_FOUND, "NoSuchKey", key)
            };
        };

        let mut headers = stored.metadata.clone();
        headers.insert("etag", stored.etag.parse().expect("valid etag header"));
        headers.insert(
            "content-length",
            stored.data.len().to_string().parse().expect("valid length"),
        );
        UpstreamResponse {
            status: StatusCode::OK,
            headers,
            body: UpstreamBody::Buffered(if head { Bytes::new() } else { stored.data }),
        }
    }

    fn delete_object(&self, bucket: &str, key: &str) -> UpstreamResponse {
        self.objects.remove(&object_id(bucket, key));
        UpstreamResponse::empty(StatusCode::NO_CONTENT)
    }

    fn create_upload(&self, bucket: &str, key: &str, request: &UpstreamRequest) -> UpstreamResponse {
        let n = self.upload_counter.fetch_add(1, Ordering::SeqCst);
        let upload_id = format!("upload-{n:08}");

        self.uploads.insert(
            upload_id.clone(),
            MemUpload {
                bucket: bucket.to_owned(),
                key: key.to_owned(),
                metadata: metadata_headers(&request.headers),
                parts: Mutex::new(BTreeMap::new()),
            },
        );

        let body = format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
             <InitiateMultipartUploadResult xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">\
             <Bucket>{bucket}</Bucket><Key>{key}</Key><UploadId>{upload_id}</UploadId>\
             </InitiateMultipartUploadResult>"
        );
        xml_response(StatusCode::OK, body)
    }

    fn upload_part(
        &self,
        upload_id: &str,
        part_number: u32,
        request: &UpstreamRequest,
    ) -> UpstreamResponse {
        let Some(upload) = self.uploads.get(upload_id) else {
            return error_response(StatusCode::NOT_FOUND, "NoSuchUpload", upload_id);
        };

        let etag = quoted_md5(&request.body);
        upload
            .parts
            .lock()
            .expect("parts mutex")
            .insert(part_number, (etag.clone(), request.body.clone()));

        let mut headers = HeaderMap::new();
        headers.insert("etag", etag.parse().expect("valid etag header"));
        UpstreamResponse {
            status: StatusCode::OK,
            headers,
            body: UpstreamBody::Buffered(Bytes::new()),
        }
    }

    fn complete_upload(&self, upload_id: &str, request: &UpstreamRequest) -> UpstreamResponse {
        let Some((_, upload)) = self.uploads.remove(upload_id) else {
            return error_response(StatusCode::NOT_FOUND, "NoSuchUpload", upload_id);
        };

        let listed: Vec<CompletedPart> = match xml::parse_complete_request(&request.body) {
            Ok(parts) => parts,
            Err(e) => {
                return error_response(StatusCode::BAD_REQUEST, "MalformedXML", &e.to_string());
            }
        };

        let parts = upload.parts.lock().expect("parts mutex");
        let mut assembled = Vec::new();
        for part in &listed {
            let Some((etag, data)) = parts.get(&part.part_number) else {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "InvalidPart",
                    &part.part_number.to_string(),
                );
            };
            if *etag != part.etag {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "InvalidPart",
                    &part.part_number.to_string(),
                );
            }
            assembled.extend_from_slice(data);
        }

        let data = Bytes::from(assembled);
        let etag = format!("{}-{}", quoted_md5(&data).trim_end_matches('"'), listed.len());
        self.objects.insert(
            object_id(&upload.bucket, &upload.key),
            StoredObject {
                data,
                metadata: upload.metadata.clone(),
                etag: format!("{etag}\""),
            },
        );

        let body = format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
             <CompleteMultipartUploadResult xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">\
             <Bucket>{}</Bucket><Key>{}</Key><ETag>{etag}\"</ETag>\
             </CompleteMultipartUploadResult>",
            upload.bucket, upload.key
        );
        xml_response(StatusCode::OK, body)
    }

    fn abort_upload(&self, upload_id: &str) -> UpstreamResponse {
        if self.uploads.remove(upload_id).is_some() {
            UpstreamResponse::empty(StatusCode::NO_CONTENT)
        } else {
            error_response(StatusCode::NOT_FOUND, "NoSuchUpload", upload_id)
        }
    }
}

#[async_trait::async_trait]
impl UpstreamClient for MemoryUpstream {
    async fn execute(&self, request: UpstreamRequest) -> Result<UpstreamResponse, UpstreamError> {
        self.request_counter.fetch_add(1, Ordering::Relaxed);

        let query = parse_query(&request.query);
        let (bucket, key) = split_path(&request.path);

        let response = match (&request.method, bucket, key) {
            (&Method::GET, None, None) => xml_response(
                StatusCode::OK,
                "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
                 <ListAllMyBucketsResult><Buckets/></ListAllMyBucketsResult>"
                    .to_owned(),
            ),
            (&Method::PUT, Some(_), None) | (&Method::DELETE, Some(_), None) => {
                UpstreamResponse::empty(StatusCode::OK)
            }
            (&Method::GET, Some(_), None) => xml_response(
                StatusCode::OK,
                "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
                 <ListBucketResult><IsTruncated>false</IsTruncated></ListBucketResult>"
                    .to_owned(),
            ),
            (&Method::POST, Some(bucket), Some(key)) if query.contains_key("uploads") => {
                self.create_upload(bucket, key, &request)
            }
            (&Method::PUT, Some(_), Some(_))
                if query.contains_key("partNumber") && query.contains_key("uploadId") =>
            {
                let part_number: u32 = query
                    .get("partNumber")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                let upload_id = query.get("uploadId").cloned().unwrap_or_default();
                self.upload_part(&upload_id, part_number, &request)
            }
            (&Method::POST, Some(_), Some(_)) if query.contains_key("uploadId") => {
                let upload_id = query.get("uploadId").cloned().unwrap_or_default();
                self.complete_upload(&upload_id, &request)
            }
            (&Method::DELETE, Some(_), Some(_)) if query.contains_key("uploadId") => {
                let upload_id = query.get("uploadId").cloned().unwrap_or_default();
                self.abort_upload(&upload_id)
            }
            (&Method::PUT, Some(bucket), Some(key)) => self.put_object(bucket, key, &request),
            (&Method::GET, Some(bucket), Some(key)) => self.get_object(bucket, key, false),
            (&Method::HEAD, Some(bucket), Some(key)) => self.get_object(bucket, key, true),
            (&Method::DELETE, Some(bucket), Some(key)) => self.delete_object(bucket, key),
            _ => UpstreamResponse::empty(StatusCode::NOT_IMPLEMENTED),
        };

        Ok(response)
    }
}

fn object_id(bucket: &str, key: &str) -> String {
    format!("{bucket}/{key}")
}

fn split_path(path: &str) -> (Option<&str>, Option<&str>) {
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() {
        return (None, None);
    }
    match trimmed.split_once('/') {
        Some((bucket, key)) if !key.is_empty() => (Some(bucket), Some(key)),
        Some((bucket, _)) => (Some(bucket), None),
        None => (Some(trimmed), None),
    }
}

fn parse_query(query: &str) -> std::collections::HashMap<String, String> {
    query
        .split('&')
        .filter(|s| !s.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_owned(), v.to_owned()),
            None => (pair.to_owned(), String::new()),
        })
        .collect()
}

/// Keep the headers an S3 store would persist as object metadata.
fn metadata_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        let lower = name.as_str().to_ascii_lowercase();
        if lower == "content-type" || lower.starts_with("x-amz-meta-") {
            out.insert(name.clone(), value.clone());
        }
    }
    out
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(ToOwned::to_owned)
}

fn quoted_md5(data: &[u8]) -> String {
    format!("\"{}\"", hex::encode(Md5::digest(data)))
}

fn xml_response(status: StatusCode, body: String) -> UpstreamResponse {
    let mut headers = HeaderMap::new();
    headers.insert("content-type", "application/xml".parse().expect("valid"));
    UpstreamResponse {
        status,
        headers,
        body: UpstreamBody::Buffered(Bytes::from(body)),
    }
}

fn error_response(status: StatusCode, code: &str, resource: &str) -> UpstreamResponse {
    let body = xml::error_to_xml(code, code, Some(resource), "mem-upstream");
    let mut headers = HeaderMap::new();
    headers.insert("content-type", "application/xml".parse().expect("valid"));
    UpstreamResponse {
        status,
        headers,
        body: UpstreamBody::Buffered(Bytes::from(body)),
    }
}
