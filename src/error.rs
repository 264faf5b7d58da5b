use crate::db::DatabaseError;
use thiserror::Error;

/// Typed failure raised during request processing.
///
/// Handlers and the enforcement helpers return this; the lifecycle wrapper
/// in `server` matches it and writes the corresponding HTTP response. No
/// variant escapes the wrapper.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// A declared input rule was violated. Maps to a `200` body with
    /// `{"status":"INVALID","validation":{...}}`.
    #[error("invalid input parameter: {field}")]
    InvalidInput { field: String, description: String },

    /// Token was valid but the user holds none of the endpoint's roles.
    #[error("access denied for user: {user} from IP: {remote_ip} reason: {reason}")]
    AccessDenied {
        user: String,
        remote_ip: String,
        reason: String,
    },

    /// Missing, malformed or expired bearer token. Maps to `401`.
    #[error("authentication required from IP: {remote_ip} reason: {reason}")]
    LoginRequired { remote_ip: String, reason: String },

    /// Unknown path or referenced entity. Maps to `404`.
    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    /// Method does not match the endpoint's registered verb. Maps to `405`.
    #[error("HTTP method not allowed: {0}")]
    MethodNotAllowed(String),

    /// Database failure inside a handler or enforcement helper.
    #[error(transparent)]
    Database(#[from] DatabaseError),

    /// Malformed JSON in a request body or downstream reply.
    #[error("json parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// Anything else. Details go to the log only; the client sees the
    /// generic service-error body.
    #[error("{0}")]
    Internal(String),
}

impl HandlerError {
    pub fn invalid_input(field: impl Into<String>, description: impl Into<String>) -> Self {
        Self::InvalidInput {
            field: field.into(),
            description: description.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(e: std::io::Error) -> Self {
        Self::Internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_context() {
        let e = HandlerError::invalid_input("descrip", "required");
        assert_eq!(e.to_string(), "invalid input parameter: descrip");

        let e = HandlerError::LoginRequired {
            remote_ip: "10.0.0.9".into(),
            reason: "token expired".into(),
        };
        assert!(e.to_string().contains("10.0.0.9"));
        assert!(e.to_string().contains("token expired"));
    }
}
