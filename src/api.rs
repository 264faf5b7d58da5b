//! Endpoint catalog: WebAPI descriptors and registration-time validation.
//!
//! The catalog is built single-threaded before the reactor starts and is
//! read-only afterwards, so lookups on the hot path take no locks.

use crate::error::HandlerError;
use crate::http::Request;
use http::Method;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Declared type of one request parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Integer,
    Double,
    String,
    /// `YYYY-MM-DD`, validated as a real calendar date.
    Date,
}

/// Declarative constraint on one request parameter.
#[derive(Debug, Clone)]
pub struct InputRule {
    pub name: String,
    pub datatype: FieldType,
    pub required: bool,
}

impl InputRule {
    pub fn new(name: &str, datatype: FieldType, required: bool) -> Self {
        Self {
            name: name.to_string(),
            datatype,
            required,
        }
    }
}

/// Endpoint handler closure. Runs on an arbitrary worker thread; must be
/// safe to call concurrently.
pub type Handler = Box<dyn Fn(&mut Request) -> Result<(), HandlerError> + Send + Sync>;

/// One registered endpoint, immutable after startup.
pub struct WebApi {
    pub description: String,
    pub verb: Method,
    pub rules: Vec<InputRule>,
    pub roles: Vec<String>,
    pub handler: Handler,
    pub is_secure: bool,
}

impl std::fmt::Debug for WebApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebApi")
            .field("description", &self.description)
            .field("verb", &self.verb)
            .field("rules", &self.rules)
            .field("roles", &self.roles)
            .field("is_secure", &self.is_secure)
            .finish()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("invalid WebAPI path '{0}': contains whitespace")]
    PathContainsWhitespace(String),
    #[error("invalid WebAPI path '{0}': must start with '/'")]
    PathMissingLeadingSlash(String),
    #[error("invalid WebAPI path '{0}': cannot end with '/'")]
    PathTrailingSlash(String),
    #[error("invalid WebAPI path '{0}': contains an invalid character")]
    PathInvalidCharacter(String),
    #[error("duplicate WebAPI path '{0}'")]
    DuplicatePath(String),
}

/// Validate an endpoint path at registration time. Paths use only
/// `[a-z0-9_/-]`, start with `/` and do not end with `/`.
pub fn validate_path(path: &str) -> Result<(), RegistrationError> {
    if path.contains(char::is_whitespace) {
        return Err(RegistrationError::PathContainsWhitespace(path.to_string()));
    }
    if !path.starts_with('/') {
        return Err(RegistrationError::PathMissingLeadingSlash(path.to_string()));
    }
    if path.ends_with('/') {
        return Err(RegistrationError::PathTrailingSlash(path.to_string()));
    }
    let valid = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || "_-/".contains(c);
    if !path.chars().all(valid) {
        return Err(RegistrationError::PathInvalidCharacter(path.to_string()));
    }
    Ok(())
}

/// Path → descriptor mapping, frozen before serving begins.
#[derive(Debug, Default)]
pub struct Catalog {
    entries: HashMap<String, Arc<WebApi>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor. Duplicate paths are rejected explicitly;
    /// silently keeping the first registration hides wiring mistakes.
    pub fn insert(&mut self, path: &str, api: WebApi) -> Result<(), RegistrationError> {
        validate_path(path)?;
        if self.entries.contains_key(path) {
            return Err(RegistrationError::DuplicatePath(path.to_string()));
        }
        self.entries.insert(path.to_string(), Arc::new(api));
        Ok(())
    }

    pub fn get(&self, path: &str) -> Option<Arc<WebApi>> {
        self.entries.get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_api(verb: Method) -> WebApi {
        WebApi {
            description: "test".into(),
            verb,
            rules: vec![],
            roles: vec![],
            handler: Box::new(|_req| Ok(())),
            is_secure: false,
        }
    }

    #[test]
    fn test_validate_path_accepts_catalog_style_paths() {
        for p in ["/api/ping", "/api/categ/add", "/api/blob-2/view", "/x_1"] {
            assert_eq!(validate_path(p), Ok(()), "{p}");
        }
    }

    #[test]
    fn test_validate_path_rejections() {
        assert!(matches!(
            validate_path("api/ping"),
            Err(RegistrationError::PathMissingLeadingSlash(_))
        ));
        assert!(matches!(
            validate_path("/api/ping/"),
            Err(RegistrationError::PathTrailingSlash(_))
        ));
        assert!(matches!(
            validate_path("/api/pi ng"),
            Err(RegistrationError::PathContainsWhitespace(_))
        ));
        assert!(matches!(
            validate_path("/api/Ping"),
            Err(RegistrationError::PathInvalidCharacter(_))
        ));
        assert!(matches!(
            validate_path("/api/ping?x=1"),
            Err(RegistrationError::PathInvalidCharacter(_))
        ));
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let mut catalog = Catalog::new();
        catalog.insert("/api/one", noop_api(Method::GET)).unwrap();
        assert_eq!(
            catalog.insert("/api/one", noop_api(Method::POST)),
            Err(RegistrationError::DuplicatePath("/api/one".into()))
        );
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn test_lookup_is_exact() {
        let mut catalog = Catalog::new();
        catalog.insert("/api/one", noop_api(Method::GET)).unwrap();
        assert!(catalog.get("/api/one").is_some());
        assert!(catalog.get("/api/one/extra").is_none());
        assert!(catalog.get("/api/on").is_none());
    }
}
