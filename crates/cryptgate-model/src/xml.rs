//! The S3 XML documents the gateway must understand.
//!
//! The proxy forwards most XML bodies as opaque bytes. Three documents are
//! the exception:
//!
//! - **Error responses** the gateway originates itself.
//! - **`InitiateMultipartUploadResult`** from the upstream store, parsed to
//!   recover the `UploadId` that keys the encryption state.
//! - **`CompleteMultipartUpload`** request bodies, parsed to validate the
//!   client's part list and re-serialized with the upstream ETags.

use std::io;

use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesText, Event};

/// Errors that can occur while parsing or writing S3 XML.
#[derive(Debug, thiserror::Error)]
pub enum XmlError {
    /// An I/O error during XML writing.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// An error from the underlying quick-xml library.
    #[error("XML processing error: {0}")]
    QuickXml(#[from] quick_xml::Error),

    /// A required XML element was missing.
    #[error("missing required XML element: {0}")]
    MissingElement(String),

    /// An error parsing a value from XML text content.
    #[error("failed to parse value: {0}")]
    ParseError(String),
}

/// The S3 XML namespace used on documents the gateway originates.
const S3_XMLNS: &str = "http://s3.amazonaws.com/doc/2006-03-01/";

/// Format an S3 error as XML.
///
/// S3 errors are a flat `<Error>` element without an outer wrapper.
///
/// # Example output
///
/// ```xml
/// <?xml version="1.0" encoding="UTF-8"?>
/// <Error>
///   <Code>SignatureDoesNotMatch</Code>
///   <Message>The request signature does not match</Message>
///   <Resource>/mybucket/mykey</Resource>
///   <RequestId>tx00000...</RequestId>
/// </Error>
/// ```
pub fn error_to_xml(
    code: &str,
    message: &str,
    resource: Option<&str>,
    request_id: &str,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(256);
    if let Err(e) = write_error_xml(&mut buf, code, message, resource, request_id) {
        tracing::error!(error = %e, "failed to serialize S3 error XML");
        buf.clear();
    }
    buf
}

fn write_error_xml(
    buf: &mut Vec<u8>,
    code: &str,
    message: &str,
    resource: Option<&str>,
    request_id: &str,
) -> io::Result<()> {
    let mut writer = Writer::new(buf);

    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    writer.create_element("Error").write_inner_content(|w| {
        w.create_element("Code")
            .write_text_content(BytesText::new(code))?;
        w.create_element("Message")
            .write_text_content(BytesText::new(message))?;
        if let Some(res) = resource {
            w.create_element("Resource")
                .write_text_content(BytesText::new(res))?;
        }
        w.create_element("RequestId")
            .write_text_content(BytesText::new(request_id))?;
        Ok(())
    })?;

    Ok(())
}

/// One `<Part>` entry of a `CompleteMultipartUpload` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    /// The part number (1-based).
    pub part_number: u32,
    /// The entity tag the client received for this part, quotes included.
    pub etag: String,
}

/// Parse the `UploadId` out of an upstream `InitiateMultipartUploadResult`.
///
/// # Errors
///
/// Returns [`XmlError::MissingElement`] if no `UploadId` element is present.
pub fn parse_initiate_result(xml: &[u8]) -> Result<String, XmlError> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);

    let mut in_upload_id = false;
    loop {
        match reader.read_event()? {
            Event::Start(e) if e.local_name().as_ref() == b"UploadId" => {
                in_upload_id = true;
            }
            Event::Text(e) if in_upload_id => {
                let text = e
                    .decode()
                    .map_err(|err| XmlError::ParseError(err.to_string()))?;
                return Ok(text.into_owned());
            }
            Event::End(e) if e.local_name().as_ref() == b"UploadId" => {
                in_upload_id = false;
            }
            Event::Eof => {
                return Err(XmlError::MissingElement("UploadId".to_owned()));
            }
            _ => {}
        }
    }
}

/// Parse a client `CompleteMultipartUpload` request body into its part list.
///
/// The parts are returned in document order; the caller validates ordering
/// and completeness against the recorded upload state.
///
/// # Errors
///
/// Returns an error if the XML is malformed, a `<Part>` lacks `PartNumber`
/// or `ETag`, or `PartNumber` is not a positive integer.
pub fn parse_complete_request(xml: &[u8]) -> Result<Vec<CompletedPart>, XmlError> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);

    let mut parts = Vec::new();
    let mut part_number: Option<u32> = None;
    let mut etag: Option<String> = None;
    // Tracks which leaf element we are inside, if any.
    let mut current: Option<&'static str> = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"Part" => {
                    part_number = None;
                    etag = None;
                }
                b"PartNumber" => current = Some("PartNumber"),
                b"ETag" => current = Some("ETag"),
                _ => {}
            },
            Event::Text(e) => {
                let text = e
                    .decode()
                    .map_err(|err| XmlError::ParseError(err.to_string()))?;
                let text = quick_xml::escape::unescape(&text)
                    .map_err(|err| XmlError::ParseError(err.to_string()))?;
                match current {
                    Some("PartNumber") => {
                        let n: u32 = text.trim().parse().map_err(|_| {
                            XmlError::ParseError(format!("invalid PartNumber '{text}'"))
                        })?;
                        if n == 0 {
                            return Err(XmlError::ParseError(
                                "PartNumber must be positive".to_owned(),
                            ));
                        }
                        part_number = Some(n);
                    }
                    Some("ETag") => etag = Some(text.into_owned()),
                    _ => {}
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"PartNumber" | b"ETag" => current = None,
                b"Part" => {
                    let number = part_number
                        .take()
                        .ok_or_else(|| XmlError::MissingElement("PartNumber".to_owned()))?;
                    let tag = etag
                        .take()
                        .ok_or_else(|| XmlError::MissingElement("ETag".to_owned()))?;
                    parts.push(CompletedPart {
                        part_number: number,
                        etag: tag,
                    });
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    if parts.is_empty() {
        return Err(XmlError::MissingElement("Part".to_owned()));
    }

    Ok(parts)
}

/// Serialize a `CompleteMultipartUpload` request body from a part list.
///
/// Used when forwarding the completion upstream with the upstream-issued
/// ETags substituted for the gateway-issued ones.
pub fn write_complete_request(parts: &[CompletedPart]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(128 + parts.len() * 96);
    if let Err(e) = write_complete_xml(&mut buf, parts) {
        tracing::error!(error = %e, "failed to serialize CompleteMultipartUpload XML");
        buf.clear();
    }
    buf
}

fn write_complete_xml(buf: &mut Vec<u8>, parts: &[CompletedPart]) -> io::Result<()> {
    let mut writer = Writer::new(buf);

    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    writer
        .create_element("CompleteMultipartUpload")
        .with_attribute(("xmlns", S3_XMLNS))
        .write_inner_content(|w| {
            for part in parts {
                w.create_element("Part").write_inner_content(|pw| {
                    pw.create_element("PartNumber")
                        .write_text_content(BytesText::new(&part.part_number.to_string()))?;
                    pw.create_element("ETag")
                        .write_text_content(BytesText::new(&part.etag))?;
                    Ok(())
                })?;
            }
            Ok(())
        })?;

    Ok(())
}
