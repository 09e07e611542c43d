//! End-to-end runs of template resources against an in-memory store.

mod common;

use common::{DeclarationBuilder, TestHarness};

use topod::resource::discover;
use topod::{process_once, ProcessError, SyncOutcome, TemplateResource, TopodError};

fn load(harness: &TestHarness, name: &str) -> TemplateResource {
    TemplateResource::new(
        &harness.config.conf_dir.join(format!("{}.toml", name)),
        &harness.config,
    )
    .expect("Failed to load resource")
}

#[test]
fn renders_missing_destination() {
    let harness = TestHarness::new();
    harness.store.set("/app/host", "db1");
    harness.write_template("app.tmpl", r#"host={{getv "/host"}}"#);
    let dest = harness.dest("app.conf");
    harness.declare(
        "app",
        &DeclarationBuilder::new("app.tmpl", &dest)
            .prefix("/app")
            .key("host"),
    );

    let resource = load(&harness, "app");
    assert_eq!(resource.process().unwrap(), SyncOutcome::Updated);
    assert_eq!(harness.read(&dest), "host=db1");

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&dest).unwrap().permissions().mode();
        assert_eq!(mode & 0o7777, 0o644);
    }
    assert_eq!(harness.list(&harness.dest_dir), vec!["app.conf"]);
}

#[test]
#[cfg(unix)]
fn identical_destination_is_left_alone() {
    let harness = TestHarness::new();
    harness.store.set("/app/host", "db1");
    harness.write_template("app.tmpl", r#"host={{getv "/host"}}"#);
    let dest = harness.dest("app.conf");
    std::fs::write(&dest, "host=db1").unwrap();
    let before = std::fs::metadata(&dest).unwrap().modified().unwrap();

    let backups = harness.mkdir("backups");
    let marker = harness.temp_path().join("reloaded");
    harness.declare(
        "app",
        &DeclarationBuilder::new("app.tmpl", &dest)
            .prefix("/app")
            .key("host")
            .backup_to(&backups)
            .check_cmd(&format!("touch {}", marker.display()))
            .reload_cmd(&format!("touch {}", marker.display())),
    );

    let resource = load(&harness, "app");
    assert_eq!(resource.process().unwrap(), SyncOutcome::InSync);
    assert_eq!(harness.read(&dest), "host=db1");
    assert_eq!(std::fs::metadata(&dest).unwrap().modified().unwrap(), before);
    assert!(harness.list(&backups).is_empty());
    assert!(!marker.exists());
    assert_eq!(harness.list(&harness.dest_dir), vec!["app.conf"]);
}

#[test]
fn failed_check_leaves_destination_untouched() {
    let harness = TestHarness::new();
    harness.store.set("/app/host", "db2");
    harness.write_template("app.tmpl", r#"host={{getv "/host"}}"#);
    let dest = harness.dest("app.conf");
    std::fs::write(&dest, "host=db1").unwrap();
    let backups = harness.mkdir("backups");
    harness.declare(
        "app",
        &DeclarationBuilder::new("app.tmpl", &dest)
            .prefix("/app")
            .key("host")
            .backup_to(&backups)
            .check_cmd("/bin/false"),
    );

    let resource = load(&harness, "app");
    let err = resource.process().unwrap_err();
    assert!(matches!(err, ProcessError::ValidationFailed { .. }));
    assert!(!err.is_retryable());
    assert_eq!(harness.read(&dest), "host=db1");
    assert!(harness.list(&backups).is_empty());
    assert_eq!(harness.list(&harness.dest_dir), vec!["app.conf"]);
}

#[test]
#[cfg(unix)]
fn busy_destination_is_written_in_place() {
    use std::os::unix::fs::MetadataExt;
    use topod::sync::{files_equivalent, replace_destination};

    let harness = TestHarness::new();
    let (uid, gid) = harness.own_ids();
    harness.store.set("/app/host", "db1");
    harness.write_template("app.tmpl", r#"host={{getv "/host"}}"#);
    let dest = harness.dest("app.conf");
    std::fs::write(&dest, "host=old").unwrap();
    harness.declare(
        "app",
        &DeclarationBuilder::new("app.tmpl", &dest)
            .prefix("/app")
            .key("host")
            .mode("0600")
            .owner(uid, gid),
    );

    let resource = load(&harness, "app");
    let policy = resource.policy();
    let (mode, staged) = resource.stage().unwrap();
    assert_eq!(mode, 0o600);

    replace_destination(staged.path(), &dest, mode, policy.uid, policy.gid, |_, _| {
        Err(std::io::Error::from(std::io::ErrorKind::ResourceBusy))
    })
    .unwrap();

    let meta = std::fs::metadata(&dest).unwrap();
    assert_eq!(harness.read(&dest), "host=db1");
    assert_eq!(meta.mode() & 0o7777, 0o600);
    assert_eq!((meta.uid(), meta.gid()), (uid, gid));
    assert!(files_equivalent(staged.path(), &dest).unwrap());
}

#[test]
fn noop_never_writes() {
    let mut harness = TestHarness::new();
    harness.config.noop = true;
    harness.store.set("/app/host", "db2");
    harness.write_template("app.tmpl", r#"host={{getv "/host"}}"#);
    let dest = harness.dest("app.conf");
    std::fs::write(&dest, "host=db1").unwrap();
    harness.declare(
        "app",
        &DeclarationBuilder::new("app.tmpl", &dest)
            .prefix("/app")
            .key("host"),
    );

    let resource = load(&harness, "app");
    assert_eq!(resource.process().unwrap(), SyncOutcome::Pending);
    assert_eq!(harness.read(&dest), "host=db1");
}

#[test]
fn backups_hold_previous_content() {
    let harness = TestHarness::new();
    harness.write_template("app.tmpl", r#"host={{getv "/host"}}"#);
    let dest = harness.dest("app.conf");
    std::fs::write(&dest, "host=v0").unwrap();
    let backups = harness.mkdir("backups");
    harness.declare(
        "app",
        &DeclarationBuilder::new("app.tmpl", &dest)
            .prefix("/app")
            .key("host")
            .backup_to(&backups),
    );
    let resource = load(&harness, "app");

    for version in ["v1", "v2", "v3"] {
        harness.store.set("/app/host", version);
        assert_eq!(resource.process().unwrap(), SyncOutcome::Updated);
    }

    let names = harness.list(&backups);
    assert_eq!(names.len(), 3);
    assert!(names.iter().all(|n| n.starts_with("app.conf")));
    let mut contents: Vec<String> = names
        .iter()
        .map(|n| harness.read(&backups.join(n)))
        .collect();
    contents.sort();
    assert_eq!(contents, vec!["host=v0", "host=v1", "host=v2"]);
    assert_eq!(harness.read(&dest), "host=v3");
}

#[test]
fn deleted_keys_drop_out_of_render() {
    let harness = TestHarness::new();
    harness.store.set("/svc/a", "1");
    harness.store.set("/svc/b", "2");
    harness.write_template(
        "svc.tmpl",
        r#"{{#each (getvs "/*")}}{{this}}{{/each}}"#,
    );
    let dest = harness.dest("svc.conf");
    harness.declare(
        "svc",
        &DeclarationBuilder::new("svc.tmpl", &dest)
            .prefix("/svc")
            .key("/"),
    );

    let resource = load(&harness, "svc");
    resource.process().unwrap();
    assert_eq!(harness.read(&dest), "12");

    harness.store.delete("/svc/a");
    resource.process().unwrap();
    assert_eq!(harness.read(&dest), "2");
}

#[test]
fn one_shot_covers_every_resource() {
    let harness = TestHarness::new();
    harness.store.set("/web/port", "8080");
    harness.write_template("web.tmpl", r#"listen {{getv "/port"}};"#);
    harness.write_template("broken.tmpl", "{{#if}}");
    let web = harness.dest("web.conf");
    harness.declare(
        "a-broken",
        &DeclarationBuilder::new("broken.tmpl", &harness.dest("broken.conf")),
    );
    harness.declare(
        "b-web",
        &DeclarationBuilder::new("web.tmpl", &web)
            .prefix("/web")
            .key("port"),
    );

    assert_eq!(discover(&harness.config).unwrap().len(), 2);
    let err = process_once(&harness.config).unwrap_err();
    assert!(matches!(
        err,
        TopodError::Process(ProcessError::Render { .. })
    ));
    assert_eq!(harness.read(&web), "listen 8080;");
    assert!(!harness.dest("broken.conf").exists());
}
