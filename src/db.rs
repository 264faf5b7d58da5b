//! Database access seam.
//!
//! The engine never talks to a driver directly; handlers, the audit drain
//! and the login endpoint go through the [`Database`] and [`Authenticator`]
//! traits. A concrete implementation owns its connections (one per calling
//! thread, rebuilt in place on failure) and hides pooling behind the trait.

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Failure reported by the database layer. The lifecycle wrapper maps it to
/// the generic service-error body; the message only reaches the log.
#[derive(Debug, Error)]
#[error("database error: {0}")]
pub struct DatabaseError(pub String);

impl DatabaseError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// One dynamically-typed statement argument.
///
/// Drivers bind by positional type code; `type_code` maps each variant to
/// the ODBC-style C type the binder needs.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Str(String),
    Int(i64),
    Float(f64),
}

impl SqlParam {
    /// Driver parameter-type code: 1 = character, 2 = integer, 3 = double.
    pub fn type_code(&self) -> u8 {
        match self {
            SqlParam::Str(_) => 1,
            SqlParam::Int(_) => 2,
            SqlParam::Float(_) => 3,
        }
    }
}

impl From<&str> for SqlParam {
    fn from(v: &str) -> Self {
        SqlParam::Str(v.to_string())
    }
}

impl From<String> for SqlParam {
    fn from(v: String) -> Self {
        SqlParam::Str(v)
    }
}

impl From<i64> for SqlParam {
    fn from(v: i64) -> Self {
        SqlParam::Int(v)
    }
}

impl From<f64> for SqlParam {
    fn from(v: f64) -> Self {
        SqlParam::Float(v)
    }
}

/// A single fetched row as a name→text mapping.
pub type Record = HashMap<String, String>;

/// Stored-procedure access contract.
///
/// `db` names the logical database whose connection string is resolved from
/// the environment (e.g. `DB1`, `CPP_AUDITDB`). Implementations must be
/// callable concurrently from arbitrary worker threads.
pub trait Database: Send + Sync {
    /// Execute a statement that returns no resultset.
    fn exec_sql(&self, db: &str, sql: &str) -> Result<(), DatabaseError>;

    /// Execute a parameterized statement (`?` placeholders bound in order).
    fn exec_sql_params(&self, db: &str, sql: &str, params: &[SqlParam])
        -> Result<(), DatabaseError>;

    /// Run a procedure whose single column/single row is a ready-made JSON
    /// document and return it verbatim.
    fn get_json_response(&self, db: &str, sql: &str) -> Result<String, DatabaseError>;

    /// Fetch the first row of a resultset; empty map when no rows.
    fn get_record(&self, db: &str, sql: &str) -> Result<Record, DatabaseError>;

    /// Whether the statement produces at least one row.
    fn has_rows(&self, db: &str, sql: &str) -> Result<bool, DatabaseError>;
}

/// Outcome of a credential check performed by an [`Authenticator`].
#[derive(Debug, Clone, Default)]
pub struct LoginOutcome {
    pub ok: bool,
    pub display_name: String,
    pub email: String,
    /// Comma-separated role labels carried into the token.
    pub roles: String,
    pub error_code: String,
    pub error_description: String,
}

impl LoginOutcome {
    pub fn granted(display_name: &str, email: &str, roles: &str) -> Self {
        Self {
            ok: true,
            display_name: display_name.to_string(),
            email: email.to_string(),
            roles: roles.to_string(),
            ..Default::default()
        }
    }

    pub fn rejected(code: &str, description: &str) -> Self {
        Self {
            ok: false,
            error_code: code.to_string(),
            error_description: description.to_string(),
            ..Default::default()
        }
    }
}

/// Credential verification seam used by the built-in `/api/login` endpoint.
pub trait Authenticator: Send + Sync {
    fn bind(
        &self,
        login: &str,
        password: &str,
        session_id: &str,
        remote_ip: &str,
    ) -> Result<LoginOutcome, DatabaseError>;
}

/// Placeholder wiring for deployments that have not attached a driver yet:
/// every call fails with a configuration error, which the lifecycle maps to
/// the generic service-error reply.
pub struct UnconfiguredDatabase;

impl Database for UnconfiguredDatabase {
    fn exec_sql(&self, db: &str, _sql: &str) -> Result<(), DatabaseError> {
        Err(DatabaseError::new(format!("no driver configured for {db}")))
    }

    fn exec_sql_params(
        &self,
        db: &str,
        _sql: &str,
        _params: &[SqlParam],
    ) -> Result<(), DatabaseError> {
        Err(DatabaseError::new(format!("no driver configured for {db}")))
    }

    fn get_json_response(&self, db: &str, _sql: &str) -> Result<String, DatabaseError> {
        Err(DatabaseError::new(format!("no driver configured for {db}")))
    }

    fn get_record(&self, db: &str, _sql: &str) -> Result<Record, DatabaseError> {
        Err(DatabaseError::new(format!("no driver configured for {db}")))
    }

    fn has_rows(&self, db: &str, _sql: &str) -> Result<bool, DatabaseError> {
        Err(DatabaseError::new(format!("no driver configured for {db}")))
    }
}

impl Authenticator for UnconfiguredDatabase {
    fn bind(
        &self,
        _login: &str,
        _password: &str,
        _session_id: &str,
        _remote_ip: &str,
    ) -> Result<LoginOutcome, DatabaseError> {
        Ok(LoginOutcome::rejected("login.unavailable", "err.nodatabase"))
    }
}

pub type SharedDatabase = Arc<dyn Database>;
pub type SharedAuthenticator = Arc<dyn Authenticator>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_type_codes() {
        assert_eq!(SqlParam::from("x").type_code(), 1);
        assert_eq!(SqlParam::from(42i64).type_code(), 2);
        assert_eq!(SqlParam::from(1.5f64).type_code(), 3);
    }

    #[test]
    fn test_unconfigured_database_fails_closed() {
        let db = UnconfiguredDatabase;
        assert!(db.exec_sql("DB1", "sp_noop").is_err());
        assert!(db.get_json_response("DB1", "sp_noop").is_err());
        let outcome = db.bind("u", "p", "sid", "127.0.0.1").unwrap();
        assert!(!outcome.ok);
        assert_eq!(outcome.error_code, "login.unavailable");
    }
}
