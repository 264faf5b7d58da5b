//! Incremental HTTP/1.1 request parsing and the per-request state.
//!
//! A [`Request`] is created by the reactor on the first read of a
//! connection and accumulates bytes across any number of reads. Header
//! parsing runs once the `\r\n\r\n` terminator arrives; body completion is
//! then a pure arithmetic check against `Content-Length`. Parameter
//! decoding (urlencoded, JSON, multipart) happens on the worker thread via
//! [`Request::parse_body`], so blob writes never stall the event loop.

use crate::api::{FieldType, InputRule};
use crate::error::HandlerError;
use crate::http::buffer::SocketBuffer;
use crate::http::multipart;
use crate::http::response::ResponseStream;
use crate::security::{token::UserInfo, TokenService};
use crate::util::encode_sql;
use chrono::NaiveDate;
use http::Method;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::warn;
use url::form_urlencoded;

/// Cap on the header section; a client that never sends the terminator
/// cannot grow the buffer forever.
const MAX_HEADER_BYTES: usize = 16 * 1024;

/// Length cap for STRING-typed parameters.
const MAX_STRING_PARAM: usize = 4096;

/// Parse failure recorded on the request. The reactor answers with the
/// stored status (400 for malformed input, 413 for an oversized body).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub status: u16,
    pub message: String,
}

/// Parser bookkeeping shared with the reactor.
#[derive(Debug, Default)]
pub struct RequestInternals {
    pub body_start: usize,
    pub content_length: usize,
    pub error: Option<ParseError>,
}

/// One in-flight HTTP exchange. Owned by the connection store while
/// reading, moved to a worker for execution, and back for writing.
pub struct Request {
    pub remote_ip: String,
    pub payload: SocketBuffer,
    pub response: ResponseStream,
    pub method: Method,
    pub path: String,
    pub query_string: String,
    pub origin: String,
    /// Bearer token from the `Authorization` header, empty when absent.
    pub token: String,
    pub boundary: String,
    pub is_multipart: bool,
    pub internals: RequestInternals,
    pub user_info: Option<UserInfo>,
    pub input_rules: Vec<InputRule>,
    /// Temp blob files written for this request, removed on any error path.
    pub blobs: Vec<PathBuf>,
    headers: HashMap<String, String>,
    params: HashMap<String, String>,
    headers_parsed: bool,
    max_payload: usize,
}

impl Request {
    pub fn new(remote_ip: String, max_payload: usize) -> Self {
        Self {
            remote_ip,
            payload: SocketBuffer::new(),
            response: ResponseStream::new(),
            method: Method::GET,
            path: String::new(),
            query_string: String::new(),
            origin: String::new(),
            token: String::new(),
            boundary: String::new(),
            is_multipart: false,
            internals: RequestInternals::default(),
            user_info: None,
            input_rules: Vec::new(),
            blobs: Vec::new(),
            headers: HashMap::new(),
            params: HashMap::new(),
            headers_parsed: false,
            max_payload,
        }
    }

    /// Called by the reactor after every successful read. Returns `true`
    /// once the request is complete (or irrecoverably malformed) and ready
    /// for dispatch.
    pub fn on_data(&mut self) -> bool {
        if self.internals.error.is_some() {
            return true;
        }
        if !self.headers_parsed {
            let terminator = find_subsequence(self.payload.view(), b"\r\n\r\n");
            let Some(idx) = terminator else {
                if self.payload.len() > MAX_HEADER_BYTES {
                    self.set_parse_error(400, "header section too large");
                    return true;
                }
                return false;
            };
            let head = String::from_utf8_lossy(&self.payload.view()[..idx]).into_owned();
            self.headers_parsed = true;
            self.internals.body_start = idx + 4;
            self.parse_head(&head);
            if self.internals.error.is_some() {
                return true;
            }
            if self.method == Method::GET || self.method == Method::OPTIONS {
                return true;
            }
            return self.eof();
        }
        self.eof()
    }

    /// Body completion: received bytes past the header terminator cover
    /// the declared `Content-Length`.
    pub fn eof(&self) -> bool {
        self.payload.len() - self.internals.body_start >= self.internals.content_length
    }

    fn parse_head(&mut self, head: &str) {
        let mut lines = head.split("\r\n");
        let Some(request_line) = lines.next() else {
            self.set_parse_error(400, "empty request line");
            return;
        };
        let mut parts = request_line.split_whitespace();
        let (Some(method), Some(target), Some(version)) =
            (parts.next(), parts.next(), parts.next())
        else {
            self.set_parse_error(400, "malformed request line");
            return;
        };
        self.method = match method {
            "GET" => Method::GET,
            "POST" => Method::POST,
            "OPTIONS" => Method::OPTIONS,
            other => {
                self.set_parse_error(400, &format!("unsupported method: {other}"));
                return;
            }
        };
        if version != "HTTP/1.1" {
            self.set_parse_error(400, &format!("unsupported protocol version: {version}"));
            return;
        }
        if !target.starts_with('/') {
            self.set_parse_error(400, "request target must be absolute");
            return;
        }
        match target.split_once('?') {
            Some((path, query)) => {
                self.path = path.to_string();
                self.query_string = query.to_string();
            }
            None => self.path = target.to_string(),
        }
        if !self.query_string.is_empty() {
            let pairs: Vec<(String, String)> = form_urlencoded::parse(self.query_string.as_bytes())
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            for (k, v) in pairs {
                self.set_param(&k, v);
            }
        }

        for line in lines {
            if line.is_empty() {
                continue;
            }
            let Some((name, value)) = line.split_once(':') else {
                self.set_parse_error(400, "malformed header line");
                return;
            };
            self.headers
                .insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }

        if self.method == Method::POST {
            if let Some(raw) = self.headers.get("content-length") {
                match raw.parse::<usize>() {
                    Ok(n) => self.internals.content_length = n,
                    Err(_) => {
                        self.set_parse_error(400, "invalid content-length");
                        return;
                    }
                }
            }
            if self.internals.content_length > self.max_payload {
                self.set_parse_error(413, "request body exceeds the configured limit");
                return;
            }
        }

        if let Some(ct) = self.headers.get("content-type") {
            if ct.starts_with("multipart/form-data") {
                match parse_boundary(ct) {
                    Some(b) => {
                        self.boundary = b;
                        self.is_multipart = true;
                    }
                    None => {
                        self.set_parse_error(400, "multipart content without boundary");
                        return;
                    }
                }
            }
        }

        self.origin = self.get_header("origin").to_string();
        if let Some(auth) = self.headers.get("authorization") {
            if let Some(token) = auth.strip_prefix("Bearer ") {
                self.token = token.trim().to_string();
            }
        }
    }

    pub fn set_parse_error(&mut self, status: u16, message: &str) {
        if self.internals.error.is_none() {
            self.internals.error = Some(ParseError {
                status,
                message: message.to_string(),
            });
        }
    }

    /// Decode body parameters. Runs once, on the worker thread, before
    /// rule enforcement. Multipart file parts are streamed to `blob_dir`
    /// under generated UUID names and recorded for error-path cleanup.
    pub fn parse_body(&mut self, blob_dir: &str) -> Result<(), HandlerError> {
        if self.method != Method::POST || self.internals.content_length == 0 {
            return Ok(());
        }
        if self.is_multipart {
            return multipart::parse_into_request(self, blob_dir);
        }
        let content_type = self.get_header("content-type").to_string();
        if content_type.starts_with("application/json") {
            let value: serde_json::Value = serde_json::from_slice(self.body())?;
            let Some(object) = value.as_object() else {
                return Err(HandlerError::invalid_input("_body_", "expected a JSON object"));
            };
            let fields: Vec<(String, String)> = object
                .iter()
                .filter_map(|(k, v)| match v {
                    serde_json::Value::String(s) => Some((k.clone(), s.clone())),
                    serde_json::Value::Number(n) => Some((k.clone(), n.to_string())),
                    serde_json::Value::Bool(b) => Some((k.clone(), b.to_string())),
                    // nested objects and arrays are skipped by contract
                    _ => None,
                })
                .collect();
            for (k, v) in fields {
                self.set_param(&k, v);
            }
            return Ok(());
        }
        // default body encoding: application/x-www-form-urlencoded
        let pairs: Vec<(String, String)> = form_urlencoded::parse(self.body())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        for (k, v) in pairs {
            self.set_param(&k, v);
        }
        Ok(())
    }

    /// Raw body bytes (everything past the header terminator, clamped to
    /// the declared length).
    pub fn body(&self) -> &[u8] {
        let start = self.internals.body_start.min(self.payload.len());
        let end = (start + self.internals.content_length).min(self.payload.len());
        &self.payload.view()[start..end]
    }

    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(self.body()).into_owned()
    }

    /// Header lookup, case-insensitive; empty string when absent.
    pub fn get_header(&self, name: &str) -> &str {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
            .unwrap_or("")
    }

    /// Parameter lookup, case-insensitive; empty string when absent.
    pub fn get_param(&self, name: &str) -> &str {
        self.params
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn set_param(&mut self, name: &str, value: String) {
        self.params.insert(name.to_ascii_lowercase(), value);
    }

    /// Reject the request unless its method matches the endpoint's verb.
    pub fn enforce_verb(&self, verb: &Method) -> Result<(), HandlerError> {
        if &self.method != verb {
            return Err(HandlerError::MethodNotAllowed(self.method.to_string()));
        }
        Ok(())
    }

    /// Apply the endpoint's input rules. Extra parameters outside the rule
    /// list are permitted but untyped.
    pub fn enforce_rules(&mut self, rules: &[InputRule]) -> Result<(), HandlerError> {
        for rule in rules {
            let value = self.get_param(&rule.name).to_string();
            if value.is_empty() {
                if rule.required {
                    return Err(HandlerError::invalid_input(&rule.name, "required"));
                }
                continue;
            }
            test_field(rule, &value)?;
        }
        self.input_rules = rules.to_vec();
        Ok(())
    }

    /// Handler-side custom validator: raises `InvalidInput(id, description)`
    /// when the predicate does not hold.
    pub fn enforce_that<F: FnOnce() -> bool>(
        &self,
        id: &str,
        description: &str,
        predicate: F,
    ) -> Result<(), HandlerError> {
        if predicate() {
            Ok(())
        } else {
            Err(HandlerError::invalid_input(id, description))
        }
    }

    /// Bearer-token authentication and role authorization. On success the
    /// decoded identity is attached to the request.
    pub fn check_security(
        &mut self,
        tokens: &TokenService,
        roles: &[String],
    ) -> Result<(), HandlerError> {
        if self.token.is_empty() {
            return Err(HandlerError::LoginRequired {
                remote_ip: self.remote_ip.clone(),
                reason: "no authorization token".into(),
            });
        }
        let Some(user) = tokens.validate(&self.token) else {
            return Err(HandlerError::LoginRequired {
                remote_ip: self.remote_ip.clone(),
                reason: "invalid or expired token".into(),
            });
        };
        if !roles.is_empty() && !user.has_any_role(roles) {
            return Err(HandlerError::AccessDenied {
                user: user.login,
                remote_ip: self.remote_ip.clone(),
                reason: "user roles not authorized for this service".into(),
            });
        }
        self.user_info = Some(user);
        Ok(())
    }

    /// Expand a SQL template: `$name` becomes the SQL-escaped parameter
    /// value, `$userlogin` the authenticated login. Unknown names stay in
    /// place and are logged.
    pub fn get_sql(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut chars = template.char_indices().peekable();
        while let Some((_, c)) = chars.next() {
            if c != '$' {
                out.push(c);
                continue;
            }
            let mut name = String::new();
            while let Some(&(_, n)) = chars.peek() {
                if n.is_ascii_lowercase() || n.is_ascii_digit() || n == '_' {
                    name.push(n);
                    chars.next();
                } else {
                    break;
                }
            }
            if name == "userlogin" {
                let login = self.user_info.as_ref().map(|u| u.login.as_str()).unwrap_or("");
                out.push_str(&encode_sql(login));
            } else if let Some(value) = self.params.get(&name) {
                out.push_str(&encode_sql(value));
            } else {
                warn!(target: "server", path = %self.path, name = %name, "unresolved SQL template variable");
                out.push('$');
                out.push_str(&name);
            }
        }
        out
    }

    /// Remove every blob file written for this request. Called on all
    /// error paths and before 400 aborts.
    pub fn delete_blobs(&mut self) {
        for path in self.blobs.drain(..) {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(target: "server", path = %path.display(), error = %e, "failed to remove blob");
            }
        }
    }

    /// Record a blob file so error paths can roll it back.
    pub fn track_blob(&mut self, path: PathBuf) {
        self.blobs.push(path);
    }
}

fn test_field(rule: &InputRule, value: &str) -> Result<(), HandlerError> {
    let ok = match rule.datatype {
        FieldType::Integer => is_integer(value),
        FieldType::Double => is_double(value),
        FieldType::Date => value.len() == 10 && NaiveDate::parse_from_str(value, "%Y-%m-%d").is_ok(),
        FieldType::String => {
            value.len() <= MAX_STRING_PARAM && !value.chars().any(char::is_control)
        }
    };
    if ok {
        Ok(())
    } else {
        Err(HandlerError::invalid_input(&rule.name, "invalid"))
    }
}

fn is_integer(value: &str) -> bool {
    let digits = value.strip_prefix(['+', '-']).unwrap_or(value);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

fn is_double(value: &str) -> bool {
    // decimal with optional sign/exponent; the alphabetic guard rejects
    // the "inf"/"NaN" spellings f64::from_str would otherwise accept
    if value
        .chars()
        .any(|c| c.is_alphabetic() && !matches!(c, 'e' | 'E'))
    {
        return false;
    }
    value.parse::<f64>().map(|v| v.is_finite()).unwrap_or(false)
}

fn parse_boundary(content_type: &str) -> Option<String> {
    let marker = "boundary=";
    let idx = content_type.find(marker)?;
    let raw = content_type[idx + marker.len()..]
        .split(';')
        .next()?
        .trim()
        .trim_matches('"');
    if raw.is_empty() {
        None
    } else {
        Some(raw.to_string())
    }
}

pub(crate) fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
