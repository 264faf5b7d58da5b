//! # Server Module
//!
//! The [`Server`] value owns everything that used to be process-global:
//! the configuration snapshot, the endpoint catalog, the atomic request
//! counters, the token service and the database/authenticator seams. It is
//! wrapped in an `Arc` at start and shared by reference with the reactor
//! and the worker pool.
//!
//! ## Request flow
//!
//! ```text
//! accept → reactor (parse) → work channel → worker (lifecycle) → ready channel → reactor (write)
//! ```
//!
//! The lifecycle on the worker is: CORS preflight short-circuit, verb
//! enforcement, body decoding, input-rule validation, token/role security,
//! optional audit push, handler invocation. Every typed failure is
//! mapped to its wire response in one place.

pub(crate) mod reactor;
pub(crate) mod workers;

use crate::api::{Catalog, FieldType, InputRule, WebApi};
use crate::audit::AuditRecord;
use crate::config::Config;
use crate::db::{SharedAuthenticator, SharedDatabase};
use crate::error::HandlerError;
use crate::http::Request;
use crate::metrics::{self, Metrics, SystemProbe};
use crate::security::{totp, TokenService};
use chrono::Local;
use crossbeam_channel::Sender;
use http::Method;
use mio::Waker;
use reactor::Reactor;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

pub const SERVER_VERSION: &str = concat!("apiserver v", env!("CARGO_PKG_VERSION"));

/// The application server. Build with [`Server::new`], add endpoints with
/// [`Server::register_webapi`], then call [`Server::start`] (blocking) or
/// [`Server::spawn`] (background, returns a [`ServerHandle`]).
pub struct Server {
    config: Config,
    catalog: Catalog,
    metrics: Arc<Metrics>,
    probe: Arc<SystemProbe>,
    tokens: Arc<TokenService>,
    db: SharedDatabase,
    auth: SharedAuthenticator,
    pod_name: String,
    start_date: String,
}

impl Server {
    /// Create a server and register the built-in endpoint set. Built-ins
    /// come first so a clashing user registration fails loudly.
    pub fn new(config: Config, db: SharedDatabase, auth: SharedAuthenticator) -> Self {
        let tokens = Arc::new(TokenService::new(
            config.jwt_secret.clone(),
            config.jwt_expiration,
        ));
        let mut server = Self {
            config,
            catalog: Catalog::new(),
            metrics: Arc::new(Metrics::new()),
            probe: Arc::new(SystemProbe::new()),
            tokens,
            db,
            auth,
            pod_name: metrics::pod_name(),
            start_date: Local::now().format("%Y-%m-%dT%H:%M:%S").to_string(),
        };
        server.register_builtin_services();
        server
    }

    /// Register one WebAPI endpoint.
    ///
    /// # Panics
    ///
    /// Panics on an invalid path or a duplicate registration. Both are
    /// wiring mistakes that must abort startup, never surface at runtime.
    pub fn register_webapi<F>(
        &mut self,
        path: &str,
        description: &str,
        verb: Method,
        rules: Vec<InputRule>,
        roles: Vec<String>,
        secure: bool,
        handler: F,
    ) where
        F: Fn(&mut Request) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let api = WebApi {
            description: description.to_string(),
            verb,
            rules,
            roles,
            handler: Box::new(handler),
            is_secure: secure,
        };
        if let Err(e) = self.catalog.insert(path, api) {
            panic!("webapi registration failed: {e}");
        }
    }

    fn register_builtin_services(&mut self) {
        info!(target: "server", "registering built-in diagnostic and security services");

        self.register_webapi(
            "/api/ping",
            "Basic healthcheck",
            Method::GET,
            vec![],
            vec![],
            false,
            |req| {
                req.response.set_body(r#"{"status": "OK"}"#, "application/json");
                Ok(())
            },
        );

        let pod = self.pod_name.clone();
        self.register_webapi(
            "/api/version",
            "Get server version and build",
            Method::GET,
            vec![],
            vec![],
            false,
            move |req| {
                let body = format!(
                    r#"{{"status":"OK","data":[{{"pod":"{}","server":"{}"}}]}}"#,
                    pod, SERVER_VERSION
                );
                req.response.set_body(&body, "application/json");
                Ok(())
            },
        );

        let pod = self.pod_name.clone();
        self.register_webapi(
            "/api/sysdate",
            "Return server timestamp in local timezone",
            Method::GET,
            vec![],
            vec![],
            false,
            move |req| {
                let now = Local::now().format("%Y-%m-%dT%H:%M:%S");
                let body = format!(
                    r#"{{"status": "OK", "data":[{{"pod":"{}","time":"{}"}}]}}"#,
                    pod, now
                );
                req.response.set_body(&body, "application/json");
                Ok(())
            },
        );

        let counters = self.metrics.clone();
        let probe = self.probe.clone();
        let pod = self.pod_name.clone();
        let start_date = self.start_date.clone();
        let pool_size = self.config.pool_size;
        self.register_webapi(
            "/api/sysinfo",
            "Return runtime and system figures",
            Method::GET,
            vec![],
            vec![],
            false,
            move |req| {
                let body =
                    metrics::render_sysinfo(&counters, &probe, &pod, &start_date, pool_size);
                req.response.set_body(&body, "application/json");
                Ok(())
            },
        );

        let counters = self.metrics.clone();
        let pod = self.pod_name.clone();
        let pool_size = self.config.pool_size;
        self.register_webapi(
            "/api/metrics",
            "Return metrics in Prometheus format",
            Method::GET,
            vec![],
            vec![],
            false,
            move |req| {
                let body = metrics::render_prometheus(&counters, &pod, pool_size);
                req.response.set_body(&body, "text/plain; version=0.0.4");
                Ok(())
            },
        );

        let auth = self.auth.clone();
        let tokens = self.tokens.clone();
        let login_log = self.config.login_log;
        self.register_webapi(
            "/api/login",
            "Default login service using a database",
            Method::POST,
            vec![
                InputRule::new("username", FieldType::String, true),
                InputRule::new("password", FieldType::String, true),
            ],
            vec![],
            false,
            move |req| {
                let login = req.get_param("username").to_string();
                let password = req.get_param("password").to_string();
                let sid = uuid::Uuid::new_v4().to_string();
                let outcome = auth.bind(&login, &password, &sid, &req.remote_ip)?;
                if outcome.ok {
                    let token = tokens.issue(&sid, &login, &outcome.email, &outcome.roles);
                    let body = serde_json::json!({
                        "status": "OK",
                        "data": [{
                            "displayname": outcome.display_name,
                            "token_type": "bearer",
                            "id_token": token,
                        }]
                    });
                    req.response.set_body(&body.to_string(), "application/json");
                    if login_log {
                        info!(
                            target: "security",
                            sid = %sid,
                            user = %login,
                            remote_ip = %req.remote_ip,
                            roles = %outcome.roles,
                            x_request_id = %req.get_header("x-request-id"),
                            "login OK"
                        );
                    }
                } else {
                    warn!(
                        target: "security",
                        user = %login,
                        remote_ip = %req.remote_ip,
                        x_request_id = %req.get_header("x-request-id"),
                        "login failed"
                    );
                    let body = serde_json::json!({
                        "status": "INVALID",
                        "validation": {
                            "id": "login",
                            "code": outcome.error_code,
                            "description": outcome.error_description,
                        }
                    });
                    req.response.set_body(&body.to_string(), "application/json");
                }
                Ok(())
            },
        );

        self.register_webapi(
            "/api/totp",
            "Validate TOTP token given a base32 encoded secret",
            Method::POST,
            vec![
                InputRule::new("duration", FieldType::Integer, true),
                InputRule::new("token", FieldType::String, true),
                InputRule::new("secret", FieldType::String, true),
            ],
            vec![],
            false,
            |req| {
                let step: u64 = req.get_param("duration").parse().unwrap_or(0);
                let body = match totp::verify(step, req.get_param("token"), req.get_param("secret"))
                {
                    Ok(()) => serde_json::json!({"status": "OK"}),
                    Err(e) => serde_json::json!({
                        "status": "INVALID",
                        "validation": {"id": "token", "description": e.to_string()}
                    }),
                };
                req.response.set_body(&body.to_string(), "application/json");
                Ok(())
            },
        );
    }

    // accessors shared with the reactor and workers

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub(crate) fn database(&self) -> SharedDatabase {
        self.db.clone()
    }

    pub(crate) fn sysinfo_json(&self) -> String {
        metrics::render_sysinfo(
            &self.metrics,
            &self.probe,
            &self.pod_name,
            &self.start_date,
            self.config.pool_size,
        )
    }

    /// Worker entry point: timed lifecycle plus the global counters and
    /// the optional access log.
    pub(crate) fn handle_work(
        &self,
        req: &mut Request,
        api: &Arc<WebApi>,
        audit_tx: &Sender<AuditRecord>,
    ) {
        self.metrics.enter_handler();
        let start = Instant::now();
        self.process_request(req, api, audit_tx);
        let elapsed = start.elapsed();
        if self.config.http_log {
            let user = req
                .user_info
                .as_ref()
                .map(|u| u.login.as_str())
                .unwrap_or("");
            info!(
                target: "access_log",
                remote_ip = %req.remote_ip,
                method = %req.method,
                path = %req.path,
                elapsed_seconds = elapsed.as_secs_f64(),
                user = %user,
                x_request_id = %req.get_header("x-request-id"),
                "request complete"
            );
        }
        self.metrics.record_request(elapsed);
        self.metrics.leave_handler();
    }

    /// The error ladder: run the service and turn any typed failure into
    /// its wire response. Nothing escapes this function.
    pub(crate) fn process_request(
        &self,
        req: &mut Request,
        api: &Arc<WebApi>,
        audit_tx: &Sender<AuditRecord>,
    ) {
        let result = if req.method == Method::OPTIONS {
            let origin = req.origin.clone();
            let mirror = req
                .get_header("access-control-request-headers")
                .to_string();
            req.response.send_options(&origin, &mirror);
            Ok(())
        } else {
            self.execute_service(req, api, audit_tx)
        };

        let Err(err) = result else {
            return;
        };
        req.delete_blobs();
        match &err {
            HandlerError::InvalidInput { field, description } => {
                let body = serde_json::json!({
                    "status": "INVALID",
                    "validation": {"id": field, "description": description}
                });
                req.response.set_body(&body.to_string(), "application/json");
            }
            HandlerError::AccessDenied { .. } => {
                let body = serde_json::json!({
                    "status": "INVALID",
                    "validation": {"id": "_dialog_", "description": "err.accessdenied"}
                });
                req.response.set_body(&body.to_string(), "application/json");
            }
            HandlerError::LoginRequired { .. } => req.response.send_error(401, "Unauthorized"),
            HandlerError::ResourceNotFound(_) => {
                req.response.send_error(404, "Resource not found")
            }
            HandlerError::MethodNotAllowed(_) => {
                req.response.send_error(405, "Method not allowed")
            }
            HandlerError::Database(_) | HandlerError::Json(_) | HandlerError::Internal(_) => {
                req.response
                    .set_body(r#"{"status":"ERROR","description":"Service error"}"#, "application/json");
            }
        }
        error!(
            target: "service",
            path = %req.path,
            error = %err,
            x_request_id = %req.get_header("x-request-id"),
            "service error"
        );
    }

    fn execute_service(
        &self,
        req: &mut Request,
        api: &Arc<WebApi>,
        audit_tx: &Sender<AuditRecord>,
    ) -> Result<(), HandlerError> {
        req.enforce_verb(&api.verb)?;
        req.parse_body(&self.config.blob_path)?;
        if !api.rules.is_empty() {
            req.enforce_rules(&api.rules)?;
        }
        if api.is_secure {
            req.check_security(&self.tokens, &api.roles)?;
            if self.config.enable_audit {
                if let Some(user) = &req.user_info {
                    let payload = if req.is_multipart {
                        "multipart-form-data".to_string()
                    } else {
                        req.body_string()
                    };
                    let record = AuditRecord {
                        username: user.login.clone(),
                        remote_ip: req.remote_ip.clone(),
                        path: req.path.clone(),
                        payload,
                        session_id: user.sid.clone(),
                        user_agent: req.get_header("user-agent").to_string(),
                        node_name: self.pod_name.clone(),
                        request_id: req.get_header("x-request-id").to_string(),
                    };
                    if audit_tx.send(record).is_err() {
                        warn!(target: "audit", "audit channel closed, record dropped");
                    }
                }
            }
        }
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| (api.handler)(req))) {
            Ok(result) => result,
            Err(panic) => Err(HandlerError::internal(format!(
                "handler panicked: {panic:?}"
            ))),
        }
    }

    fn print_server_info(&self) {
        info!(target: "env", port = self.config.port, "config");
        info!(target: "env", pool_size = self.config.pool_size, "config");
        info!(target: "env", http_log = self.config.http_log, "config");
        info!(target: "env", login_log = self.config.login_log, "config");
        info!(target: "env", jwt_expiration = self.config.jwt_expiration, "config");
        info!(target: "env", enable_audit = self.config.enable_audit, "config");
        info!(
            target: "server",
            pod = %self.pod_name,
            pid = std::process::id(),
            version = SERVER_VERSION,
            endpoints = self.catalog.len(),
            "starting"
        );
    }

    /// Run the server on the current thread until a stop signal arrives.
    pub fn start(self) -> io::Result<()> {
        self.print_server_info();
        let pod = self.pod_name.clone();
        let mut reactor = Reactor::new(Arc::new(self))?;
        let result = reactor.run();
        info!(target: "server", pod = %pod, "shut down cleanly");
        result
    }

    /// Run the server on a background thread and return a control handle.
    pub fn spawn(self) -> io::Result<ServerHandle> {
        self.print_server_info();
        let mut reactor = Reactor::new(Arc::new(self))?;
        let addr = reactor.local_addr();
        let shutdown = reactor.shutdown_flag();
        let waker = reactor.waker();
        let handle = thread::Builder::new()
            .name("reactor".to_string())
            .spawn(move || reactor.run())
            .expect("failed to spawn reactor thread");
        Ok(ServerHandle {
            addr,
            shutdown,
            waker,
            handle,
        })
    }
}

/// Handle to a running server: wait for readiness, stop it, join it.
pub struct ServerHandle {
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    waker: Arc<Waker>,
    handle: JoinHandle<io::Result<()>>,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Block until the listen socket accepts connections.
    pub fn wait_ready(&self) -> io::Result<()> {
        for _ in 0..50 {
            if TcpStream::connect(self.addr).is_ok() {
                return Ok(());
            }
            thread::sleep(Duration::from_millis(5));
        }
        Err(io::Error::new(io::ErrorKind::TimedOut, "server not ready"))
    }

    /// Request shutdown and wait for the full drain: in-flight handlers
    /// complete, their responses are written, workers and the audit drain
    /// are joined.
    pub fn stop(self) -> io::Result<()> {
        self.shutdown.store(true, Ordering::Relaxed);
        let _ = self.waker.wake();
        self.handle
            .join()
            .map_err(|_| io::Error::other("reactor thread panicked"))?
    }
}
