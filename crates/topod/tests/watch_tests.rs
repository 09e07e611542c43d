//! Watch mode against an in-memory store.

mod common;

use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::bounded;

use common::{DeclarationBuilder, TestHarness};
use topod::processor::Processor;
use topod::Watcher;

fn eventually(path: &Path, expected: &str) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if std::fs::read_to_string(path).ok().as_deref() == Some(expected) {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    false
}

#[test]
fn each_resource_follows_its_own_prefix() {
    let harness = TestHarness::new();
    harness.store.set("/web/port", "80");
    harness.store.set("/db/host", "db1");
    harness.write_template("web.tmpl", r#"port={{getv "/port"}}"#);
    harness.write_template("db.tmpl", r#"host={{getv "/host"}}"#);
    let web = harness.dest("web.conf");
    let db = harness.dest("db.conf");
    harness.declare(
        "web",
        &DeclarationBuilder::new("web.tmpl", &web)
            .prefix("/web")
            .key("port"),
    );
    harness.declare(
        "db",
        &DeclarationBuilder::new("db.tmpl", &db)
            .prefix("/db")
            .key("host"),
    );

    let (stop_tx, stop_rx) = bounded::<()>(0);
    let (done_tx, done_rx) = bounded::<()>(0);
    let (err_tx, err_rx) = bounded(16);
    let watcher = Watcher::new(&harness.config, stop_rx, done_tx, err_tx).unwrap();
    let handle = thread::spawn(move || Box::new(watcher).process());

    assert!(eventually(&web, "port=80"));
    assert!(eventually(&db, "host=db1"));

    harness.store.set("/web/port", "8080");
    assert!(eventually(&web, "port=8080"));
    harness.store.set("/db/host", "db2");
    assert!(eventually(&db, "host=db2"));

    let started = Instant::now();
    drop(stop_tx);
    assert!(done_rx.recv_timeout(Duration::from_secs(10)).is_err());
    assert!(started.elapsed() < Duration::from_secs(10));
    handle.join().unwrap();
    assert!(err_rx.try_recv().is_err());
}

#[test]
fn no_cycle_runs_after_shutdown() {
    let harness = TestHarness::new();
    harness.store.set("/app/v", "1");
    harness.write_template("app.tmpl", r#"v={{getv "/v"}}"#);
    let dest = harness.dest("app.conf");
    harness.declare(
        "app",
        &DeclarationBuilder::new("app.tmpl", &dest)
            .prefix("/app")
            .key("v"),
    );

    let (stop_tx, stop_rx) = bounded::<()>(0);
    let (done_tx, done_rx) = bounded::<()>(0);
    let (err_tx, _err_rx) = bounded(16);
    let watcher = Watcher::new(&harness.config, stop_rx, done_tx, err_tx).unwrap();
    let handle = thread::spawn(move || Box::new(watcher).process());

    assert!(eventually(&dest, "v=1"));
    drop(stop_tx);
    assert!(done_rx.recv_timeout(Duration::from_secs(10)).is_err());
    handle.join().unwrap();

    harness.store.set("/app/v", "2");
    thread::sleep(Duration::from_millis(100));
    assert_eq!(harness.read(&dest), "v=1");
}
