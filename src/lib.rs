//! Declarative WebAPI application server.
//!
//! A single-process HTTP/1.1 engine hosting a catalog of JSON endpoints
//! backed by parameterized stored procedures: an edge-triggered reactor on
//! one thread, a fixed worker pool running the handlers, signed-token
//! security with role checks, and an asynchronous audit trail.

pub mod api;
pub mod audit;
pub mod config;
pub mod db;
pub mod error;
pub mod http;
pub mod logging;
pub mod metrics;
pub mod security;
pub mod server;
pub mod util;

pub use crate::api::{FieldType, InputRule, WebApi};
pub use crate::config::Config;
pub use crate::db::{Authenticator, Database, DatabaseError, LoginOutcome, SqlParam};
pub use crate::error::HandlerError;
pub use crate::http::Request;
pub use crate::security::{TokenService, UserInfo};
pub use crate::server::{Server, ServerHandle, SERVER_VERSION};
