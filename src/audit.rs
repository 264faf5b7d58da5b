//! Asynchronous audit trail.
//!
//! Secure requests enqueue an [`AuditRecord`] on a dedicated channel; a
//! single drain thread writes them to the audit database. A failed insert
//! is logged and skipped: never retried, never blocking the producers.

use crate::db::{SharedDatabase, SqlParam};
use crossbeam_channel::Receiver;
use std::thread::JoinHandle;
use tracing::{error, info};

/// After-the-fact record of one handled secure request.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub username: String,
    pub remote_ip: String,
    pub path: String,
    /// Raw request body, or the literal `multipart-form-data` marker.
    pub payload: String,
    pub session_id: String,
    pub user_agent: String,
    pub node_name: String,
    pub request_id: String,
}

/// Logical database the drain writes to; its connection string comes from
/// the environment under this name.
pub const AUDIT_DB: &str = "CPP_AUDITDB";

pub const AUDIT_INSERT_SQL: &str = "INSERT INTO audit_trail \
    (path, username, remote_ip, payload, session_id, user_agent, node_name, request_id) \
    VALUES (?, ?, ?, ?, ?, ?, ?, ?)";

fn write_record(db: &SharedDatabase, record: &AuditRecord) {
    let params = [
        SqlParam::Str(record.path.clone()),
        SqlParam::Str(record.username.clone()),
        SqlParam::Str(record.remote_ip.clone()),
        SqlParam::Str(record.payload.clone()),
        SqlParam::Str(record.session_id.clone()),
        SqlParam::Str(record.user_agent.clone()),
        SqlParam::Str(record.node_name.clone()),
        SqlParam::Str(record.request_id.clone()),
    ];
    if let Err(e) = db.exec_sql_params(AUDIT_DB, AUDIT_INSERT_SQL, &params) {
        error!(target: "audit", error = %e, path = %record.path, "could not save audit record in database");
    }
}

/// Spawn the drain thread. It exits once every producer handle has been
/// dropped and the channel is empty, so pending records written before
/// shutdown still land.
pub fn spawn_drain(db: SharedDatabase, rx: Receiver<AuditRecord>) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("audit".to_string())
        .spawn(move || {
            info!(target: "pool", "starting audit thread");
            for record in rx.iter() {
                write_record(&db, &record);
            }
            info!(target: "pool", "stopping audit thread");
        })
        .expect("failed to spawn audit thread")
}
