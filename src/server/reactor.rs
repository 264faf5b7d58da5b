//! The single-threaded readiness-event loop.
//!
//! Owns the listening socket, the signal event source and every connection
//! handle. Reads and parses requests, answers trivial diagnostics inline,
//! and hands complete requests to the worker pool. A connection is always
//! deregistered from the poll before the handoff so no I/O event can fire
//! for a request a worker currently owns. Completed requests re-enter
//! through the ready channel and are re-armed for writing.
//!
//! The wait uses a short timeout plus a waker: workers nudge the loop the
//! moment a response is ready, and the timeout bounds the drain latency
//! even if a wakeup is lost.

use crate::audit;
use crate::http::Request;
use crate::server::workers::{spawn_workers, WorkItem};
use crate::server::Server;
use crossbeam_channel::{unbounded, Receiver, Sender};
use http::Method;
use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use signal_hook::consts::{SIGINT, SIGQUIT, SIGTERM};
use signal_hook_mio::v1_0::Signals;
use slab::Slab;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const LISTENER: Token = Token(0);
const SIGNALS_TOKEN: Token = Token(1);
const WAKER_TOKEN: Token = Token(2);
const TOKEN_BASE: usize = 3;

/// Short wait so ready-queue draining never lags far behind the workers.
const POLL_TIMEOUT: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnState {
    /// Accumulating request bytes.
    Reading,
    /// Response prepared, pushing bytes out.
    Writing,
    /// Response fully written; waiting for the client to close.
    Draining,
}

/// One live connection: the socket and the request it carries. Moves to a
/// worker inside a [`WorkItem`] and comes back through the ready channel.
pub(crate) struct Conn {
    pub stream: TcpStream,
    pub req: Request,
    pub state: ConnState,
}

enum DispatchOutcome {
    /// Response prepared inline; arm the connection for writing.
    Armed,
    /// Hand the request to the worker pool.
    Handoff(Arc<crate::api::WebApi>),
}

pub(crate) struct Reactor {
    server: Arc<Server>,
    poll: Poll,
    listener: TcpListener,
    signals: Signals,
    conns: Slab<Conn>,
    waker: Arc<Waker>,
    shutdown: Arc<AtomicBool>,
    shutting_down: bool,
    listener_active: bool,
    /// Requests currently owned by the pool or sitting in the ready queue.
    in_flight: usize,
    local_addr: SocketAddr,
}

impl Reactor {
    /// Bind, register the listener/signal/waker sources and prepare the
    /// loop. A bind failure is fatal and propagates to the caller.
    pub fn new(server: Arc<Server>) -> io::Result<Self> {
        let addr: SocketAddr = format!("0.0.0.0:{}", server.config().port)
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("{e}")))?;
        let mut listener = TcpListener::bind(addr).map_err(|e| {
            error!(target: "epoll", port = server.config().port, error = %e, "bind failed");
            e
        })?;
        let local_addr = listener.local_addr()?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let mut signals = Signals::new([SIGINT, SIGTERM, SIGQUIT])?;
        poll.registry()
            .register(&mut signals, SIGNALS_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        info!(target: "signal", "signal interceptor registered");
        info!(target: "epoll", port = local_addr.port(), "listen non-blocking socket ready");
        Ok(Self {
            server,
            poll,
            listener,
            signals,
            conns: Slab::new(),
            waker,
            shutdown: Arc::new(AtomicBool::new(false)),
            shutting_down: false,
            listener_active: true,
            in_flight: 0,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }

    /// Cooperative stop flag for programmatic shutdown (tests, embedders);
    /// signals flip the same switch from inside the loop.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Run the event loop to completion. Spawns the worker pool and the
    /// audit drain, and joins them (workers first) before returning.
    pub fn run(&mut self) -> io::Result<()> {
        let (work_tx, work_rx) = unbounded::<WorkItem>();
        let (ready_tx, ready_rx) = unbounded::<Conn>();
        let (audit_tx, audit_rx) = unbounded();

        let workers = spawn_workers(
            self.server.clone(),
            self.server.config().pool_size,
            work_rx,
            ready_tx,
            self.waker.clone(),
            audit_tx,
        );
        let audit_handle = audit::spawn_drain(self.server.database(), audit_rx);

        let mut events = Events::with_capacity(1024);
        loop {
            if self.shutdown.load(Ordering::Relaxed) && !self.shutting_down {
                self.begin_shutdown();
            }
            if let Err(e) = self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(target: "epoll", error = %e, "poll failed, leaving event loop");
                break;
            }
            self.drain_ready(&ready_rx);
            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept_loop(),
                    SIGNALS_TOKEN => self.on_signal(),
                    WAKER_TOKEN => {}
                    token => self.on_conn_event(token, event, &work_tx),
                }
            }
            if self.shutting_down && self.in_flight == 0 && self.no_pending_writes() {
                break;
            }
        }

        // Workers first: closing the work channel lets each finish its
        // current item and exit; the audit channel closes once the last
        // worker (producer) is gone, and the drain flushes what remains.
        drop(work_tx);
        for handle in workers {
            let _ = handle.join();
        }
        let _ = audit_handle.join();

        while let Ok(conn) = ready_rx.try_recv() {
            drop(conn);
            self.server.metrics().connection_closed();
        }
        let keys: Vec<usize> = self.conns.iter().map(|(k, _)| k).collect();
        for key in keys {
            self.close_conn(key);
        }
        info!(target: "epoll", "closing listen socket");
        Ok(())
    }

    fn begin_shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        info!(target: "server", "shutting down, draining in-flight requests");
        if self.listener_active {
            let _ = self.poll.registry().deregister(&mut self.listener);
            self.listener_active = false;
        }
        // abandon connections still reading; responses in progress finish
        let keys: Vec<usize> = self
            .conns
            .iter()
            .filter(|(_, c)| c.state != ConnState::Writing)
            .map(|(k, _)| k)
            .collect();
        for key in keys {
            self.close_conn(key);
        }
    }

    fn no_pending_writes(&self) -> bool {
        self.conns.iter().all(|(_, c)| c.state != ConnState::Writing)
    }

    fn on_signal(&mut self) {
        for signal in self.signals.pending() {
            let name = match signal {
                SIGINT => "SIGINT",
                SIGTERM => "SIGTERM",
                SIGQUIT => "SIGQUIT",
                _ => "unknown",
            };
            info!(target: "signal", signal = name, "stop signal received");
        }
        self.begin_shutdown();
    }

    /// Re-arm completed requests for writing. Runs before event handling
    /// on every wake so worker output is never starved by a busy socket.
    fn drain_ready(&mut self, ready_rx: &Receiver<Conn>) {
        while let Ok(mut conn) = ready_rx.try_recv() {
            self.in_flight -= 1;
            conn.state = ConnState::Writing;
            let entry = self.conns.vacant_entry();
            let token = Token(TOKEN_BASE + entry.key());
            match self
                .poll
                .registry()
                .register(&mut conn.stream, token, Interest::WRITABLE)
            {
                Ok(()) => {
                    entry.insert(conn);
                }
                Err(e) => {
                    error!(target: "epoll", error = %e, "failed to re-register completed request");
                    self.server.metrics().connection_closed();
                }
            }
        }
    }

    fn accept_loop(&mut self) {
        if !self.listener_active {
            return;
        }
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    let token_key;
                    {
                        let entry = self.conns.vacant_entry();
                        token_key = entry.key();
                        let token = Token(TOKEN_BASE + token_key);
                        if let Err(e) =
                            self.poll
                                .registry()
                                .register(&mut stream, token, Interest::READABLE)
                        {
                            error!(target: "epoll", error = %e, "failed to register accepted connection");
                            continue;
                        }
                        let req = Request::new(
                            peer.ip().to_string(),
                            self.server.config().max_payload,
                        );
                        entry.insert(Conn {
                            stream,
                            req,
                            state: ConnState::Reading,
                        });
                    }
                    self.server.metrics().connection_opened();
                    debug!(target: "epoll", key = token_key, peer = %peer, "connection accepted");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!(target: "epoll", error = %e, "connection accept failed");
                    break;
                }
            }
        }
    }

    fn on_conn_event(&mut self, token: Token, event: &Event, work_tx: &Sender<WorkItem>) {
        let Some(key) = token.0.checked_sub(TOKEN_BASE) else {
            return;
        };
        if !self.conns.contains(key) {
            return;
        }
        if event.is_error() {
            let detail = self.conns[key]
                .stream
                .take_error()
                .ok()
                .flatten()
                .map(|e| e.to_string())
                .unwrap_or_default();
            error!(target: "epoll", key, error = %detail, "error on connection, closing it");
            self.close_conn(key);
            return;
        }
        if event.is_read_closed() {
            // peer hangup; a partially written response is discarded
            self.close_conn(key);
            return;
        }
        if event.is_writable() {
            self.on_writable(key);
            if !self.conns.contains(key) {
                return;
            }
        }
        if event.is_readable() {
            self.on_readable(key, work_tx);
        }
    }

    fn on_readable(&mut self, key: usize, work_tx: &Sender<WorkItem>) {
        enum Action {
            Close,
            Dispatch,
            Wait,
        }
        loop {
            let action = {
                let Some(conn) = self.conns.get_mut(key) else {
                    return;
                };
                match conn.state {
                    ConnState::Writing => Action::Wait,
                    ConnState::Draining => {
                        let mut scratch = [0u8; 512];
                        match conn.stream.read(&mut scratch) {
                            Ok(0) => Action::Close,
                            Ok(_) => Action::Wait,
                            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Action::Wait,
                            Err(_) => Action::Close,
                        }
                    }
                    ConnState::Reading => match conn.stream.read(conn.req.payload.space()) {
                        Ok(0) => Action::Close,
                        Ok(n) => {
                            conn.req.payload.advance(n);
                            if conn.req.on_data() {
                                Action::Dispatch
                            } else {
                                continue;
                            }
                        }
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Action::Wait,
                        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            error!(target: "epoll", key, error = %e, "read failed");
                            Action::Close
                        }
                    },
                }
            };
            match action {
                Action::Close => {
                    self.close_conn(key);
                    return;
                }
                Action::Dispatch => {
                    self.dispatch(key, work_tx);
                    return;
                }
                Action::Wait => return,
            }
        }
    }

    /// Route one complete request: parse errors and CORS rejections are
    /// answered here, `/api/ping` and `/api/sysinfo` are filled inline
    /// (cheap, never touching the pool), unknown paths get a 404, and
    /// everything else moves to a worker after deregistration.
    fn dispatch(&mut self, key: usize, work_tx: &Sender<WorkItem>) {
        let outcome = {
            let Some(conn) = self.conns.get_mut(key) else {
                return;
            };
            let req = &mut conn.req;
            let request_id = req.get_header("x-request-id").to_string();
            req.response.set_request_id(&request_id);

            if let Some(parse_error) = req.internals.error.clone() {
                error!(
                    target: "epoll",
                    status = parse_error.status,
                    remote_ip = %req.remote_ip,
                    path = %req.path,
                    description = %parse_error.message,
                    x_request_id = %request_id,
                    "rejecting malformed request"
                );
                req.delete_blobs();
                let message = if parse_error.status == 413 {
                    "Payload too large"
                } else {
                    "Bad request"
                };
                req.response.send_error(parse_error.status, message);
                DispatchOutcome::Armed
            } else if !req.origin.is_empty() && !self.server.config().origin_allowed(&req.origin) {
                warn!(
                    target: "security",
                    origin = %req.origin,
                    remote_ip = %req.remote_ip,
                    path = %req.path,
                    x_request_id = %request_id,
                    "origin not in allow-list"
                );
                req.response.send_error(403, "Forbidden");
                DispatchOutcome::Armed
            } else {
                if !req.origin.is_empty() {
                    let origin = req.origin.clone();
                    req.response.set_origin(&origin);
                }
                let inline_diagnostic = req.method != Method::OPTIONS;
                if inline_diagnostic && req.path.ends_with("/api/ping") {
                    req.response.set_body(r#"{"status": "OK"}"#, "application/json");
                    DispatchOutcome::Armed
                } else if inline_diagnostic && req.path.ends_with("/api/sysinfo") {
                    let body = self.server.sysinfo_json();
                    req.response.set_body(&body, "application/json");
                    DispatchOutcome::Armed
                } else {
                    match self.server.catalog().get(&req.path) {
                        Some(api) => DispatchOutcome::Handoff(api),
                        None => {
                            error!(
                                target: "epoll",
                                path = %req.path,
                                remote_ip = %req.remote_ip,
                                x_request_id = %request_id,
                                "API not found"
                            );
                            req.response.send_error(404, "Resource not found");
                            DispatchOutcome::Armed
                        }
                    }
                }
            }
        };

        match outcome {
            DispatchOutcome::Armed => self.arm_write(key),
            DispatchOutcome::Handoff(api) => {
                // the poll must not observe this handle while a worker
                // owns the request
                let mut conn = self.conns.remove(key);
                let _ = self.poll.registry().deregister(&mut conn.stream);
                self.in_flight += 1;
                if work_tx.send(WorkItem { conn, api }).is_err() {
                    error!(target: "epoll", "work channel disconnected, dropping request");
                    self.in_flight -= 1;
                    self.server.metrics().connection_closed();
                }
            }
        }
    }

    fn arm_write(&mut self, key: usize) {
        if let Some(conn) = self.conns.get_mut(key) {
            conn.state = ConnState::Writing;
            let token = Token(TOKEN_BASE + key);
            if let Err(e) = self
                .poll
                .registry()
                .reregister(&mut conn.stream, token, Interest::WRITABLE)
            {
                error!(target: "epoll", key, error = %e, "failed to arm connection for writing");
            }
        }
    }

    fn on_writable(&mut self, key: usize) {
        enum Write {
            Done,
            Pending,
            Failed,
        }
        let result = {
            let Some(conn) = self.conns.get_mut(key) else {
                return;
            };
            if conn.state != ConnState::Writing {
                return;
            }
            let Conn { stream, req, .. } = conn;
            match req.response.write(stream) {
                Ok(true) => Write::Done,
                Ok(false) => Write::Pending,
                Err(e) => {
                    error!(target: "epoll", key, error = %e, "response write failed");
                    Write::Failed
                }
            }
        };
        match result {
            Write::Done => {
                if self.shutting_down {
                    self.close_conn(key);
                } else {
                    // response out; hold the handle until the client closes
                    let rearmed = match self.conns.get_mut(key) {
                        Some(conn) => {
                            conn.state = ConnState::Draining;
                            let token = Token(TOKEN_BASE + key);
                            self.poll
                                .registry()
                                .reregister(&mut conn.stream, token, Interest::READABLE)
                                .is_ok()
                        }
                        None => true,
                    };
                    if !rearmed {
                        self.close_conn(key);
                    }
                }
            }
            Write::Pending => {}
            Write::Failed => self.close_conn(key),
        }
    }

    fn close_conn(&mut self, key: usize) {
        if self.conns.contains(key) {
            let mut conn = self.conns.remove(key);
            let _ = self.poll.registry().deregister(&mut conn.stream);
            self.server.metrics().connection_closed();
        }
    }
}
