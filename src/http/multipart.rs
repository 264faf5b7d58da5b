//! multipart/form-data decoding.
//!
//! Non-file parts populate the request's parameter map. File parts are
//! written to the blob directory under a generated UUID filename; the
//! parameter map then carries the UUID plus the original `filename`,
//! `content_type` and `content_len` for the handler's stored procedure.
//! Every written file is tracked on the request so error paths roll it
//! back.

use crate::error::HandlerError;
use crate::http::request::{find_subsequence, Request};
use std::path::Path;
use uuid::Uuid;

struct Part<'a> {
    name: String,
    filename: Option<String>,
    content_type: Option<String>,
    data: &'a [u8],
}

pub(crate) fn parse_into_request(req: &mut Request, blob_dir: &str) -> Result<(), HandlerError> {
    let body = req.body().to_vec();
    let boundary = req.boundary.clone();
    let parts = split_parts(&body, &boundary)?;
    for part in parts {
        match &part.filename {
            Some(filename) => {
                let uuid = Uuid::new_v4().to_string();
                let path = Path::new(blob_dir).join(&uuid);
                std::fs::write(&path, part.data).map_err(|e| {
                    HandlerError::internal(format!(
                        "cannot save blob {}: {e}",
                        path.display()
                    ))
                })?;
                req.track_blob(path);
                let content_type = part
                    .content_type
                    .clone()
                    .unwrap_or_else(|| "application/octet-stream".to_string());
                let len = part.data.len().to_string();
                req.set_param(&part.name, uuid);
                req.set_param("filename", filename.clone());
                req.set_param("content_type", content_type);
                req.set_param("content_len", len);
            }
            None => {
                let value = String::from_utf8_lossy(part.data).into_owned();
                req.set_param(&part.name, value);
            }
        }
    }
    Ok(())
}

fn split_parts<'a>(body: &'a [u8], boundary: &str) -> Result<Vec<Part<'a>>, HandlerError> {
    let delimiter = format!("--{boundary}");
    let delim = delimiter.as_bytes();
    let mut segments = Vec::new();
    let mut pos = match find_subsequence(body, delim) {
        Some(idx) => idx + delim.len(),
        None => return Err(HandlerError::internal("malformed multipart body: no boundary")),
    };
    loop {
        let rest = &body[pos..];
        match find_subsequence(rest, delim) {
            Some(idx) => {
                segments.push(&rest[..idx]);
                pos += idx + delim.len();
            }
            None => break,
        }
    }

    let mut parts = Vec::new();
    for segment in segments {
        // each segment sits between delimiters: "\r\n<headers>\r\n\r\n<data>\r\n"
        let segment = strip_crlf(segment);
        let Some(header_end) = find_subsequence(segment, b"\r\n\r\n") else {
            return Err(HandlerError::internal("malformed multipart part headers"));
        };
        let headers = String::from_utf8_lossy(&segment[..header_end]).into_owned();
        let data = &segment[header_end + 4..];
        let mut name = None;
        let mut filename = None;
        let mut content_type = None;
        for line in headers.split("\r\n") {
            let lower = line.to_ascii_lowercase();
            if lower.starts_with("content-disposition:") {
                name = quoted_attr(line, "name");
                filename = quoted_attr(line, "filename");
            } else if let Some(ct) = lower.strip_prefix("content-type:") {
                content_type = Some(ct.trim().to_string());
            }
        }
        let Some(name) = name else {
            return Err(HandlerError::internal(
                "multipart part without a form field name",
            ));
        };
        parts.push(Part {
            name,
            filename,
            content_type,
            data,
        });
    }
    Ok(parts)
}

fn strip_crlf(mut segment: &[u8]) -> &[u8] {
    if segment.starts_with(b"\r\n") {
        segment = &segment[2..];
    }
    if segment.ends_with(b"\r\n") {
        segment = &segment[..segment.len() - 2];
    }
    segment
}

fn quoted_attr(line: &str, attr: &str) -> Option<String> {
    // boundary check keeps `name=` from matching inside `filename=`
    let marker = format!("{attr}=\"");
    let mut from = 0;
    while let Some(rel) = line[from..].find(&marker) {
        let idx = from + rel;
        if idx == 0 || !line.as_bytes()[idx - 1].is_ascii_alphanumeric() {
            let start = idx + marker.len();
            let end = line[start..].find('"')? + start;
            return Some(line[start..end].to_string());
        }
        from = idx + marker.len();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::request::Request;

    const BOUNDARY: &str = "----testboundary";

    fn multipart_request(body: &[u8]) -> Request {
        let head = format!(
            "POST /api/blob/add HTTP/1.1\r\nContent-Type: multipart/form-data; boundary={BOUNDARY}\r\nContent-Length: {}\r\n\r\n",
            body.len()
        );
        let mut raw = head.into_bytes();
        raw.extend_from_slice(body);
        let mut req = Request::new("127.0.0.1".to_string(), 8 * 1024 * 1024);
        for chunk in raw.chunks(512) {
            req.payload.space()[..chunk.len()].copy_from_slice(chunk);
            req.payload.advance(chunk.len());
            req.on_data();
        }
        assert!(req.is_multipart);
        req
    }

    fn form_body() -> Vec<u8> {
        let mut b = Vec::new();
        b.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"title\"\r\n\r\nQ1 report\r\n"
            )
            .as_bytes(),
        );
        b.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"document\"; filename=\"report.pdf\"\r\nContent-Type: application/pdf\r\n\r\n%PDF-1.4 fake\r\n"
            )
            .as_bytes(),
        );
        b.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        b
    }

    #[test]
    fn test_file_and_field_parts() {
        let dir = tempfile::tempdir().unwrap();
        let mut req = multipart_request(&form_body());
        req.parse_body(dir.path().to_str().unwrap()).unwrap();

        assert_eq!(req.get_param("title"), "Q1 report");
        assert_eq!(req.get_param("filename"), "report.pdf");
        assert_eq!(req.get_param("content_type"), "application/pdf");
        assert_eq!(req.get_param("content_len"), "13");

        let uuid = req.get_param("document").to_string();
        assert_eq!(uuid.len(), 36, "uuid filename");
        let stored = std::fs::read(dir.path().join(&uuid)).unwrap();
        assert_eq!(stored, b"%PDF-1.4 fake");
        assert_eq!(req.blobs.len(), 1);
    }

    #[test]
    fn test_delete_blobs_rolls_back_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut req = multipart_request(&form_body());
        req.parse_body(dir.path().to_str().unwrap()).unwrap();
        let uuid = req.get_param("document").to_string();
        let path = dir.path().join(&uuid);
        assert!(path.exists());
        req.delete_blobs();
        assert!(!path.exists());
        assert!(req.blobs.is_empty());
    }

    #[test]
    fn test_quoted_attr_boundaries() {
        let line = r#"Content-Disposition: form-data; filename="f.txt"; name="doc""#;
        assert_eq!(quoted_attr(line, "name").as_deref(), Some("doc"));
        assert_eq!(quoted_attr(line, "filename").as_deref(), Some("f.txt"));
        assert_eq!(quoted_attr(line, "missing"), None);
    }

    #[test]
    fn test_malformed_body_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut req = multipart_request(b"no boundary markers here");
        assert!(req.parse_body(dir.path().to_str().unwrap()).is_err());
    }

    #[test]
    fn test_unwritable_blob_dir_fails_without_params() {
        let mut req = multipart_request(&form_body());
        let result = req.parse_body("/nonexistent-blob-dir-for-tests");
        assert!(matches!(result, Err(HandlerError::Internal(_))));
    }
}
