//! Authentication, authorization, input validation and the audit trail,
//! exercised over a real socket.

mod common;

use apiserver::audit::{AUDIT_DB, AUDIT_INSERT_SQL};
use apiserver::{FieldType, InputRule, Server, TokenService};
use common::{boot, get, post, test_config, MockDb};
use http::Method;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn secure_server(db: Arc<MockDb>, blob_path: &str, enable_audit: bool) -> Server {
    let mut config = test_config(blob_path);
    config.enable_audit = enable_audit;
    let mut server = Server::new(config, db.clone(), db);
    server.register_webapi(
        "/api/categ/add",
        "Add category record",
        Method::POST,
        vec![InputRule::new("descrip", FieldType::String, true)],
        vec![],
        true,
        |req| {
            req.response.set_body(r#"{"status":"OK"}"#, "application/json");
            Ok(())
        },
    );
    server.register_webapi(
        "/api/admin/only",
        "Needs the sysadmin role",
        Method::GET,
        vec![],
        vec!["sysadmin".to_string()],
        true,
        |req| {
            req.response.set_body(r#"{"status":"OK"}"#, "application/json");
            Ok(())
        },
    );
    server
}

fn bearer(token: &str) -> String {
    format!("Bearer {token}")
}

#[test]
fn test_login_issues_usable_token() {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(MockDb::with_user("admin", "admin", "Admin", "sysadmin"));
    let (handle, addr) = boot(secure_server(db, dir.path().to_str().unwrap(), false));

    let res = post(addr, "/api/login", "username=admin&password=admin", &[]);
    assert_eq!(res.status, 200);
    let json = res.json();
    assert_eq!(json["status"], "OK");
    assert_eq!(json["data"][0]["token_type"], "bearer");
    assert_eq!(json["data"][0]["displayname"], "Admin");
    let token = json["data"][0]["id_token"].as_str().unwrap().to_string();
    assert_eq!(token.split('.').count(), 3);

    // the issued token opens the role-guarded endpoint
    let auth = bearer(&token);
    let res = get(addr, "/api/admin/only", &[("Authorization", &auth)]);
    assert_eq!(res.status, 200);
    assert_eq!(res.body, r#"{"status":"OK"}"#);
    handle.stop().unwrap();
}

#[test]
fn test_login_rejection_shape() {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(MockDb::with_user("admin", "admin", "Admin", "sysadmin"));
    let (handle, addr) = boot(secure_server(db, dir.path().to_str().unwrap(), false));
    let res = post(addr, "/api/login", "username=admin&password=wrong", &[]);
    assert_eq!(res.status, 200);
    let json = res.json();
    assert_eq!(json["status"], "INVALID");
    assert_eq!(json["validation"]["id"], "login");
    assert_eq!(json["validation"]["code"], "login.failed");
    handle.stop().unwrap();
}

#[test]
fn test_secure_endpoint_without_token_is_401() {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(MockDb::default());
    let (handle, addr) = boot(secure_server(db, dir.path().to_str().unwrap(), false));
    let res = post(addr, "/api/categ/add", "descrip=food", &[]);
    assert_eq!(res.status, 401);
    assert_eq!(res.body, "Unauthorized");
    handle.stop().unwrap();
}

#[test]
fn test_expired_or_forged_token_is_401() {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(MockDb::default());
    let (handle, addr) = boot(secure_server(db, dir.path().to_str().unwrap(), false));

    // signed with a different secret
    let forged = TokenService::new("other-secret", 600).issue("sid", "admin", "a@x", "sysadmin");
    let auth = bearer(&forged);
    let res = get(addr, "/api/admin/only", &[("Authorization", &auth)]);
    assert_eq!(res.status, 401);
    handle.stop().unwrap();
}

#[test]
fn test_wrong_role_is_access_denied() {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(MockDb::default());
    let (handle, addr) = boot(secure_server(db, dir.path().to_str().unwrap(), false));

    let token = TokenService::new("test", 600).issue("sid", "bob", "b@x", "viewer");
    let auth = bearer(&token);
    let res = get(addr, "/api/admin/only", &[("Authorization", &auth)]);
    assert_eq!(res.status, 200);
    let json = res.json();
    assert_eq!(json["status"], "INVALID");
    assert_eq!(json["validation"]["id"], "_dialog_");
    assert_eq!(json["validation"]["description"], "err.accessdenied");
    handle.stop().unwrap();
}

#[test]
fn test_missing_required_parameter() {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(MockDb::default());
    let (handle, addr) = boot(secure_server(db, dir.path().to_str().unwrap(), false));

    let token = TokenService::new("test", 600).issue("sid", "alice", "a@x", "sysadmin");
    let auth = bearer(&token);
    let res = post(addr, "/api/categ/add", "", &[("Authorization", &auth)]);
    assert_eq!(res.status, 200);
    let json = res.json();
    assert_eq!(json["status"], "INVALID");
    assert_eq!(json["validation"]["id"], "descrip");
    assert_eq!(json["validation"]["description"], "required");
    handle.stop().unwrap();
}

#[test]
fn test_typed_parameter_rejection() {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(MockDb::default());
    let mut server = secure_server(db, dir.path().to_str().unwrap(), false);
    server.register_webapi(
        "/api/typed",
        "integer id",
        Method::GET,
        vec![InputRule::new("id", FieldType::Integer, true)],
        vec![],
        false,
        |req| {
            req.response.set_body(r#"{"status":"OK"}"#, "application/json");
            Ok(())
        },
    );
    let (handle, addr) = boot(server);
    let res = get(addr, "/api/typed?id=abc", &[]);
    let json = res.json();
    assert_eq!(json["status"], "INVALID");
    assert_eq!(json["validation"]["id"], "id");
    handle.stop().unwrap();
}

#[test]
fn test_totp_rejects_wrong_code() {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(MockDb::default());
    let (handle, addr) = boot(secure_server(db, dir.path().to_str().unwrap(), false));
    let res = post(
        addr,
        "/api/totp",
        "duration=30&token=000001&secret=GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ",
        &[],
    );
    assert_eq!(res.status, 200);
    let json = res.json();
    assert_eq!(json["status"], "INVALID");
    assert_eq!(json["validation"]["id"], "token");
    handle.stop().unwrap();
}

#[test]
fn test_audit_record_reaches_the_drain() {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(MockDb::default());
    let (handle, addr) = boot(secure_server(db.clone(), dir.path().to_str().unwrap(), true));

    let token = TokenService::new("test", 600).issue("sid-9", "alice", "a@x", "sysadmin");
    let auth = bearer(&token);
    let res = post(
        addr,
        "/api/categ/add",
        "descrip=food",
        &[("Authorization", &auth), ("User-Agent", "curl"), ("X-Request-ID", "r9")],
    );
    assert_eq!(res.status, 200);

    // the drain runs on its own thread; poll for the insert
    let deadline = Instant::now() + Duration::from_secs(2);
    let call = loop {
        if let Some(call) = db.param_calls.lock().unwrap().first().cloned() {
            break call;
        }
        assert!(Instant::now() < deadline, "audit record never arrived");
        std::thread::sleep(Duration::from_millis(10));
    };
    let (db_name, sql, params) = call;
    assert_eq!(db_name, AUDIT_DB);
    assert_eq!(sql, AUDIT_INSERT_SQL);
    assert_eq!(params.len(), 8);
    assert_eq!(params[0], apiserver::SqlParam::Str("/api/categ/add".into()));
    assert_eq!(params[1], apiserver::SqlParam::Str("alice".into()));
    assert_eq!(params[3], apiserver::SqlParam::Str("descrip=food".into()));
    assert_eq!(params[4], apiserver::SqlParam::Str("sid-9".into()));
    assert_eq!(params[5], apiserver::SqlParam::Str("curl".into()));
    assert_eq!(params[7], apiserver::SqlParam::Str("r9".into()));
    handle.stop().unwrap();
}

#[test]
fn test_insecure_endpoint_skips_audit() {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(MockDb::default());
    let (handle, addr) = boot(secure_server(db.clone(), dir.path().to_str().unwrap(), true));
    get(addr, "/api/version", &[]);
    std::thread::sleep(Duration::from_millis(50));
    assert!(db.param_calls.lock().unwrap().is_empty());
    handle.stop().unwrap();
}
