//! Shared helpers for the integration suite: a canned in-memory database
//! and authenticator, a server bootstrapper on an ephemeral port, and a
//! small raw-socket HTTP client (responses carry `Connection: close` and
//! the server holds the socket until the client hangs up, so the client
//! reads exactly `Content-Length` bytes and then closes).

use apiserver::db::{Authenticator, Database, DatabaseError, LoginOutcome, Record, SqlParam};
use apiserver::{Config, Server, ServerHandle};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Mutex;
use std::time::Duration;

/// Canned database + authenticator. JSON replies are keyed by the exact
/// SQL text; everything executed is recorded for assertions.
#[derive(Default)]
pub struct MockDb {
    pub json: Mutex<HashMap<String, String>>,
    pub execs: Mutex<Vec<(String, String)>>,
    pub param_calls: Mutex<Vec<(String, String, Vec<SqlParam>)>>,
    /// login → (password, display name, roles CSV)
    pub users: HashMap<String, (String, String, String)>,
}

impl MockDb {
    pub fn with_user(login: &str, password: &str, display: &str, roles: &str) -> Self {
        let mut db = Self::default();
        db.users.insert(
            login.to_string(),
            (password.to_string(), display.to_string(), roles.to_string()),
        );
        db
    }

    pub fn stub_json(&self, sql: &str, json: &str) {
        self.json
            .lock()
            .unwrap()
            .insert(sql.to_string(), json.to_string());
    }
}

impl Database for MockDb {
    fn exec_sql(&self, db: &str, sql: &str) -> Result<(), DatabaseError> {
        self.execs
            .lock()
            .unwrap()
            .push((db.to_string(), sql.to_string()));
        Ok(())
    }

    fn exec_sql_params(
        &self,
        db: &str,
        sql: &str,
        params: &[SqlParam],
    ) -> Result<(), DatabaseError> {
        self.param_calls
            .lock()
            .unwrap()
            .push((db.to_string(), sql.to_string(), params.to_vec()));
        Ok(())
    }

    fn get_json_response(&self, _db: &str, sql: &str) -> Result<String, DatabaseError> {
        self.json
            .lock()
            .unwrap()
            .get(sql)
            .cloned()
            .ok_or_else(|| DatabaseError::new(format!("no stub for: {sql}")))
    }

    fn get_record(&self, _db: &str, _sql: &str) -> Result<Record, DatabaseError> {
        Ok(Record::new())
    }

    fn has_rows(&self, _db: &str, _sql: &str) -> Result<bool, DatabaseError> {
        Ok(false)
    }
}

impl Authenticator for MockDb {
    fn bind(
        &self,
        login: &str,
        password: &str,
        _session_id: &str,
        _remote_ip: &str,
    ) -> Result<LoginOutcome, DatabaseError> {
        match self.users.get(login) {
            Some((expected, display, roles)) if expected == password => Ok(LoginOutcome::granted(
                display,
                &format!("{login}@example.com"),
                roles,
            )),
            _ => Ok(LoginOutcome::rejected("login.failed", "err.badcredentials")),
        }
    }
}

/// Config pointing at an ephemeral port, secret `test` and the spec's
/// CORS allow-list.
pub fn test_config(blob_path: &str) -> Config {
    Config {
        port: 0,
        pool_size: 4,
        http_log: false,
        login_log: false,
        jwt_expiration: 600,
        jwt_secret: "test".to_string(),
        enable_audit: false,
        allow_origins: vec!["https://example.com".to_string()],
        max_payload: 8 * 1024 * 1024,
        blob_path: blob_path.to_string(),
    }
}

/// Boot a server, wait until it accepts connections.
pub fn boot(server: Server) -> (ServerHandle, SocketAddr) {
    let handle = server.spawn().expect("server must bind");
    handle.wait_ready().expect("server must become ready");
    let addr = handle.addr();
    (handle, addr)
}

pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> &str {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body).expect("response body must be JSON")
    }
}

/// Send raw bytes and read one full response (headers + declared body).
pub fn send_raw(addr: SocketAddr, raw: &[u8]) -> HttpResponse {
    let mut stream = TcpStream::connect(addr).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream.write_all(raw).expect("request write");

    let mut data = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut chunk).expect("response read");
        assert!(n > 0, "connection closed before response headers");
        data.extend_from_slice(&chunk[..n]);
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&data[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap_or("");
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .expect("status code");
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    let content_length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    while data.len() < header_end + content_length {
        let n = stream.read(&mut chunk).expect("body read");
        assert!(n > 0, "connection closed before declared body");
        data.extend_from_slice(&chunk[..n]);
    }
    let body = String::from_utf8_lossy(&data[header_end..header_end + content_length]).to_string();
    HttpResponse {
        status,
        headers,
        body,
    }
}

pub fn get(addr: SocketAddr, path: &str, extra_headers: &[(&str, &str)]) -> HttpResponse {
    let mut raw = format!("GET {path} HTTP/1.1\r\nHost: test\r\n");
    for (name, value) in extra_headers {
        raw.push_str(&format!("{name}: {value}\r\n"));
    }
    raw.push_str("\r\n");
    send_raw(addr, raw.as_bytes())
}

pub fn post(
    addr: SocketAddr,
    path: &str,
    body: &str,
    extra_headers: &[(&str, &str)],
) -> HttpResponse {
    let mut raw = format!(
        "POST {path} HTTP/1.1\r\nHost: test\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n",
        body.len()
    );
    for (name, value) in extra_headers {
        raw.push_str(&format!("{name}: {value}\r\n"));
    }
    raw.push_str("\r\n");
    raw.push_str(body);
    send_raw(addr, raw.as_bytes())
}
