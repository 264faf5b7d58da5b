//! HTTP/1.1 response serialization.
//!
//! A [`ResponseStream`] is an append-only byte buffer plus a write cursor.
//! The reactor calls [`ResponseStream::write`] whenever the socket is
//! writable; it pushes as many bytes as the kernel accepts and reports
//! completion when the cursor reaches the end. Every response carries
//! `Connection: close`, one request per connection.

use chrono::Utc;
use std::io::{self, Write};

fn status_reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        _ => "OK",
    }
}

fn http_date() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Response buffer with partial-write support.
#[derive(Debug, Default)]
pub struct ResponseStream {
    buffer: Vec<u8>,
    cursor: usize,
    origin: String,
    content_disposition: String,
    request_id: String,
}

impl ResponseStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Origin to echo in `Access-Control-Allow-Origin`. Only ever set for
    /// origins that already passed the allow-list.
    pub fn set_origin(&mut self, origin: &str) {
        self.origin = origin.to_string();
    }

    /// Header echoed back on every response when the client sent one.
    pub fn set_request_id(&mut self, request_id: &str) {
        self.request_id = request_id.to_string();
    }

    /// Content-Disposition honored by the next [`Self::set_body_blob`].
    pub fn set_content_disposition(&mut self, disposition: &str) {
        self.content_disposition = disposition.to_string();
    }

    /// Build a `200 OK` with the standard header set.
    pub fn set_body(&mut self, body: &str, content_type: &str) {
        self.build(200, body.as_bytes(), content_type, false);
    }

    /// Same as [`Self::set_body`] for binary payloads, honoring a
    /// previously set `Content-Disposition` (file downloads).
    pub fn set_body_blob(&mut self, body: &[u8], content_type: &str) {
        self.build(200, body, content_type, true);
    }

    /// Error template: plain-text reason body, no nosniff header, same
    /// transport-security envelope.
    pub fn send_error(&mut self, status: u16, msg: &str) {
        self.buffer.clear();
        self.cursor = 0;
        let mut head = format!(
            "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nContent-Type: text/plain\r\nDate: {}\r\n",
            status,
            status_reason(status),
            msg.len(),
            http_date(),
        );
        if !self.origin.is_empty() {
            head.push_str(&format!(
                "Access-Control-Allow-Origin: {}\r\nAccess-Control-Allow-Credentials: true\r\n",
                self.origin
            ));
        }
        head.push_str(
            "Strict-Transport-Security: max-age=31536000; includeSubDomains; preload;\r\n\
             X-Frame-Options: SAMEORIGIN\r\n",
        );
        if !self.request_id.is_empty() {
            head.push_str(&format!("X-Request-ID: {}\r\n", self.request_id));
        }
        head.push_str("Connection: close\r\n\r\n");
        self.buffer.extend_from_slice(head.as_bytes());
        self.buffer.extend_from_slice(msg.as_bytes());
    }

    /// CORS preflight reply: `204`, methods `GET, POST`, mirrored request
    /// headers, ten-minute cache. An empty origin degrades to `*`.
    pub fn send_options(&mut self, origin: &str, request_headers: &str) {
        let origin = if origin.is_empty() {
            tracing::error!(target: "server", "preflight without origin header, answering *");
            "*"
        } else {
            origin
        };
        self.buffer.clear();
        self.cursor = 0;
        let mut head = format!(
            "HTTP/1.1 204 No Content\r\nDate: {}\r\nAccess-Control-Allow-Origin: {}\r\n\
             Access-Control-Allow-Methods: GET, POST\r\nAccess-Control-Allow-Headers: {}\r\n\
             Access-Control-Max-Age: 600\r\nVary: Origin\r\n",
            http_date(),
            origin,
            request_headers,
        );
        if !self.request_id.is_empty() {
            head.push_str(&format!("X-Request-ID: {}\r\n", self.request_id));
        }
        head.push_str("Connection: close\r\n\r\n");
        self.buffer.extend_from_slice(head.as_bytes());
    }

    fn build(&mut self, status: u16, body: &[u8], content_type: &str, with_disposition: bool) {
        self.buffer.clear();
        self.cursor = 0;
        let mut head = format!(
            "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nContent-Type: {}\r\nDate: {}\r\n",
            status,
            status_reason(status),
            body.len(),
            content_type,
            http_date(),
        );
        if !self.origin.is_empty() {
            head.push_str(&format!(
                "Access-Control-Allow-Origin: {}\r\nAccess-Control-Allow-Credentials: true\r\n",
                self.origin
            ));
        }
        head.push_str(
            "Strict-Transport-Security: max-age=31536000; includeSubDomains; preload;\r\n\
             X-Frame-Options: SAMEORIGIN\r\nX-Content-Type-Options: nosniff\r\n",
        );
        if with_disposition && !self.content_disposition.is_empty() {
            head.push_str(&format!(
                "Content-Disposition: {}\r\n",
                self.content_disposition
            ));
        }
        if !self.request_id.is_empty() {
            head.push_str(&format!("X-Request-ID: {}\r\n", self.request_id));
        }
        head.push_str("Connection: close\r\n\r\n");
        self.buffer.extend_from_slice(head.as_bytes());
        self.buffer.extend_from_slice(body);
    }

    /// Whether a response has been prepared.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Push pending bytes into `out`. Returns `Ok(true)` once everything
    /// has been written, `Ok(false)` when the socket stopped accepting
    /// (try again on the next writable event).
    pub fn write<W: Write>(&mut self, out: &mut W) -> io::Result<bool> {
        while self.cursor < self.buffer.len() {
            match out.write(&self.buffer[self.cursor..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "connection closed during response write",
                    ))
                }
                Ok(n) => self.cursor += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}
