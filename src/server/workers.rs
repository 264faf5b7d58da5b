//! Fixed pool of worker threads executing endpoint handlers.
//!
//! Workers share one crossbeam channel receiver, so they load-balance
//! automatically. Each finished request goes back to the reactor through
//! the ready channel, followed by a waker nudge so the response is armed
//! for writing without waiting out the poll timeout.

use crate::api::WebApi;
use crate::audit::AuditRecord;
use crate::server::reactor::Conn;
use crate::server::Server;
use crossbeam_channel::{Receiver, Sender};
use mio::Waker;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::debug;

/// One unit of work: the connection (ownership moves with it) and the
/// matched endpoint descriptor.
pub(crate) struct WorkItem {
    pub conn: Conn,
    pub api: Arc<WebApi>,
}

/// Spawn `count` workers. They exit when the work channel disconnects,
/// finishing whatever item they hold first.
pub(crate) fn spawn_workers(
    server: Arc<Server>,
    count: usize,
    work_rx: Receiver<WorkItem>,
    ready_tx: Sender<Conn>,
    waker: Arc<Waker>,
    audit_tx: Sender<AuditRecord>,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|worker_id| {
            let server = server.clone();
            let work_rx = work_rx.clone();
            let ready_tx = ready_tx.clone();
            let waker = waker.clone();
            let audit_tx = audit_tx.clone();
            std::thread::Builder::new()
                .name(format!("worker-{worker_id}"))
                .spawn(move || {
                    debug!(target: "pool", worker_id, "worker thread started");
                    for mut item in work_rx.iter() {
                        server.handle_work(&mut item.conn.req, &item.api, &audit_tx);
                        if ready_tx.send(item.conn).is_err() {
                            break;
                        }
                        let _ = waker.wake();
                    }
                    debug!(target: "pool", worker_id, "worker thread exiting");
                })
                .expect("failed to spawn worker thread")
        })
        .collect()
}
