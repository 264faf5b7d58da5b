//! Shutdown drain semantics: a stop request lets in-flight handlers run to
//! completion and their responses reach the clients before the reactor,
//! workers and audit drain wind down.

mod common;

use apiserver::Server;
use common::{boot, get, test_config, MockDb};
use http::Method;
use std::sync::Arc;
use std::time::Duration;

#[test]
fn test_idle_stop_returns_quickly() {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(MockDb::default());
    let (handle, _addr) = boot(Server::new(
        test_config(dir.path().to_str().unwrap()),
        db.clone(),
        db,
    ));
    handle.stop().expect("clean shutdown");
}

#[test]
fn test_in_flight_requests_complete_before_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(MockDb::default());
    let mut server = Server::new(test_config(dir.path().to_str().unwrap()), db.clone(), db);
    server.register_webapi(
        "/api/slow",
        "sleeps to stay in flight during the stop",
        Method::GET,
        vec![],
        vec![],
        false,
        |req| {
            std::thread::sleep(Duration::from_millis(200));
            req.response.set_body(r#"{"status":"OK"}"#, "application/json");
            Ok(())
        },
    );
    let (handle, addr) = boot(server);

    let clients: Vec<_> = (0..3)
        .map(|_| {
            std::thread::spawn(move || {
                let res = get(addr, "/api/slow", &[]);
                (res.status, res.body)
            })
        })
        .collect();

    // let the three requests reach the worker pool, then pull the plug
    std::thread::sleep(Duration::from_millis(80));
    handle.stop().expect("drained shutdown");

    for client in clients {
        let (status, body) = client.join().expect("client thread");
        assert_eq!(status, 200);
        assert_eq!(body, r#"{"status":"OK"}"#);
    }
}

#[test]
fn test_server_rejects_new_connections_after_stop() {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(MockDb::default());
    let (handle, addr) = boot(Server::new(
        test_config(dir.path().to_str().unwrap()),
        db.clone(),
        db,
    ));
    handle.stop().unwrap();
    assert!(std::net::TcpStream::connect_timeout(&addr, Duration::from_millis(200)).is_err());
}
