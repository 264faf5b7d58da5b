//! Read-once configuration snapshot.
//!
//! Every tunable comes from a `CPP_*` environment variable, read exactly
//! once at startup. Numeric parsing is lenient: an unparsable value logs a
//! warning and keeps the compiled-in default, so a bad deployment manifest
//! degrades instead of crashing.

use std::env;
use tracing::{error, warn};

/// Immutable server configuration, built with [`Config::from_env`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen port (`CPP_PORT`, default 8080).
    pub port: u16,
    /// Worker thread count (`CPP_POOL_SIZE`, default 4).
    pub pool_size: usize,
    /// Per-request access log (`CPP_HTTP_LOG`, default off).
    pub http_log: bool,
    /// Login-success trace (`CPP_LOGIN_LOG`, default off).
    pub login_log: bool,
    /// Token TTL in seconds (`CPP_JWT_EXP`, default 600).
    pub jwt_expiration: u64,
    /// HMAC secret (`CPP_JWT_SECRET`). Empty is a misconfiguration,
    /// reported as an error when the first token is issued.
    pub jwt_secret: String,
    /// Audit drain writes enabled (`CPP_ENABLE_AUDIT`, default off).
    pub enable_audit: bool,
    /// CORS origin allow-list (`CPP_ALLOW_ORIGINS`, comma separated).
    pub allow_origins: Vec<String>,
    /// Maximum request body size in bytes (`CPP_MAX_PAYLOAD`, default 8 MiB).
    /// A larger `Content-Length` is answered with 413.
    pub max_payload: usize,
    /// Directory receiving multipart file uploads (`CPP_BLOB_PATH`).
    pub blob_path: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: read_num("CPP_PORT", 8080),
            pool_size: read_num("CPP_POOL_SIZE", 4),
            http_log: read_num::<u8>("CPP_HTTP_LOG", 0) != 0,
            login_log: read_num::<u8>("CPP_LOGIN_LOG", 0) != 0,
            jwt_expiration: read_num("CPP_JWT_EXP", 600),
            jwt_secret: env::var("CPP_JWT_SECRET").unwrap_or_default(),
            enable_audit: read_num::<u8>("CPP_ENABLE_AUDIT", 0) != 0,
            allow_origins: env::var("CPP_ALLOW_ORIGINS")
                .unwrap_or_default()
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            max_payload: read_num("CPP_MAX_PAYLOAD", 8 * 1024 * 1024),
            blob_path: env::var("CPP_BLOB_PATH").unwrap_or_else(|_| "/var/blobs/".to_string()),
        }
    }

    /// Whether `origin` passes the CORS allow-list. An empty origin header
    /// bypasses the check entirely (same-origin or non-browser client).
    pub fn origin_allowed(&self, origin: &str) -> bool {
        origin.is_empty() || self.allow_origins.iter().any(|o| o == origin)
    }

    /// Look up a named connection string (e.g. `DB1`, `CPP_AUDITDB`).
    ///
    /// Values ending in `.enc` denote RSA-encrypted files handled by the
    /// external decryption helper; this build has none wired in, so the
    /// value is returned verbatim after an error trace.
    pub fn get_str(name: &str) -> String {
        let value = env::var(name).unwrap_or_default();
        if value.ends_with(".enc") {
            error!(
                target: "env",
                env_var = name,
                "encrypted connection string requires the external decryption helper"
            );
        }
        value
    }
}

fn read_num<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(target: "env", env_var = name, value = %raw, "unparsable numeric value, using default");
            default
        }),
        Err(_) => default,
    }
}
