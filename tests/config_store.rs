//! Loading, watching and saving configuration documents.

use hotswap_conn::prelude::*;
use proptest::prelude::*;
use serde::Deserialize;
use std::fs;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::timeout;

#[derive(Debug, Deserialize, PartialEq)]
struct Database {
    host: String,
    port: u16,
    pool: Pool,
}

#[derive(Debug, Deserialize, PartialEq)]
struct Pool {
    max: u32,
}

fn config_dir(files: &[(&str, &str)]) -> TempDir {
    let temp_dir = TempDir::new().unwrap();
    for (file, content) in files {
        fs::write(temp_dir.path().join(file), content).unwrap();
    }
    temp_dir
}

#[test]
fn test_every_format_resolves_dotted_paths() {
    let dir = config_dir(&[
        ("db.yaml", "host: localhost\nport: 3306\npool:\n  max: 20\n"),
        ("cache.toml", "[redis]\nhost = \"cache\"\nport = 6379\n"),
        ("rabbit.json", r#"{"host": "mq", "tls": {"enabled": false}}"#),
    ]);
    let store = ConfigStore::open(dir.path(), ChangeNotifier::new()).unwrap();

    assert_eq!(store.get_as::<u32>("db.pool.max").unwrap(), Some(20));
    assert_eq!(
        store.get_as::<String>("cache.redis.host").unwrap(),
        Some("cache".to_string())
    );
    assert_eq!(store.get_as::<bool>("rabbit.tls.enabled").unwrap(), Some(false));

    let document = store.document("db").unwrap();
    assert_eq!(
        document.deserialize::<Database>().unwrap(),
        Database {
            host: "localhost".into(),
            port: 3306,
            pool: Pool { max: 20 },
        }
    );
}

#[test]
fn test_absent_paths_are_none() {
    let dir = config_dir(&[("db.yaml", "host: localhost\npool:\n  max: 20\n")]);
    let store = ConfigStore::open(dir.path(), ChangeNotifier::new()).unwrap();

    assert!(store.get("db.missing").is_none());
    assert!(store.get("db.host.deeper").is_none());
    assert!(store.get("db.pool.max.deeper").is_none());
    assert!(store.get("nope.host").is_none());
    assert!(store.get("").is_none());
    assert_eq!(store.get_as::<u16>("db.port").unwrap(), None);
}

#[test]
fn test_wrong_shape_is_an_error() {
    let dir = config_dir(&[("db.yaml", "host: localhost\n")]);
    let store = ConfigStore::open(dir.path(), ChangeNotifier::new()).unwrap();

    let err = store.get_as::<u16>("db.host").unwrap_err();
    assert!(matches!(err, ConfigError::Deserialize { .. }));
}

#[test]
fn test_malformed_initial_load_fails() {
    let dir = config_dir(&[("db.yaml", "host: [unterminated\n")]);
    let err = ConfigStore::open(dir.path(), ChangeNotifier::new()).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }));
}

#[test]
fn test_malformed_reload_keeps_previous_tree() {
    let dir = config_dir(&[("db.yaml", "host: localhost\n")]);
    let store = ConfigStore::open(dir.path(), ChangeNotifier::new()).unwrap();

    fs::write(dir.path().join("db.yaml"), "host: [unterminated\n").unwrap();
    let err = store.reload("db").unwrap_err();

    assert!(matches!(err, ConfigError::Parse { .. }));
    assert_eq!(
        store.get_as::<String>("db.host").unwrap(),
        Some("localhost".to_string())
    );
}

#[test]
fn test_malformed_load_keeps_previous_tree() {
    let dir = config_dir(&[("db.yaml", "host: localhost\n")]);
    let store = ConfigStore::open(dir.path(), ChangeNotifier::new()).unwrap();
    let path = dir.path().join("db.yaml");

    fs::write(&path, "host: [unterminated\n").unwrap();
    let err = store.load("db", &path).unwrap_err();

    assert!(matches!(err, ConfigError::Parse { .. }));
    assert_eq!(
        store.get_as::<String>("db.host").unwrap(),
        Some("localhost".to_string())
    );
}

#[tokio::test]
async fn test_load_over_loaded_name_updates_in_place() {
    let dir = config_dir(&[("db.yaml", "host: a.db\n")]);
    let notifier = ChangeNotifier::new();
    let store = ConfigStore::open(dir.path(), notifier.clone()).unwrap();
    let path = dir.path().join("db.yaml");

    let held = store.document("db").unwrap();
    let mut changes = notifier.register(held.path()).subscribe();

    fs::write(&path, "host: b.db\n").unwrap();
    let loaded = store.load("db", &path).unwrap();

    assert!(std::sync::Arc::ptr_eq(&held, &loaded));
    assert_eq!(held.get_as::<String>("host").unwrap(), Some("b.db".to_string()));
    let changed = timeout(Duration::from_secs(1), changes.recv()).await.unwrap();
    assert_eq!(changed.as_deref(), Some(held.path()));
}

#[tokio::test]
async fn test_load_under_new_path_notifies_old_path() {
    let dir = config_dir(&[("db.yaml", "host: a.db\n"), ("db-next.toml", "host = \"b.db\"\n")]);
    let notifier = ChangeNotifier::new();
    let store = ConfigStore::open(dir.path(), notifier.clone()).unwrap();

    let old = store.document("db").unwrap();
    let mut changes = notifier.register(old.path()).subscribe();

    let moved = store.load("db", dir.path().join("db-next.toml")).unwrap();

    assert_ne!(old.path(), moved.path());
    assert_eq!(store.get_as::<String>("db.host").unwrap(), Some("b.db".to_string()));
    let changed = timeout(Duration::from_secs(1), changes.recv()).await.unwrap();
    assert_eq!(changed.as_deref(), Some(old.path()));
}

#[tokio::test]
async fn test_watched_edit_is_reloaded_and_published() {
    let dir = config_dir(&[("db.yaml", "host: localhost\n")]);
    let notifier = ChangeNotifier::new();
    let store = ConfigStore::open(dir.path(), notifier.clone()).unwrap();
    store.watch_all().await.unwrap();
    assert!(store.is_watching().await);

    let path = store.document("db").unwrap().path().to_path_buf();
    let mut changes = notifier.register(&path).subscribe();

    fs::write(dir.path().join("db.yaml"), "host: db.internal\n").unwrap();

    let changed = timeout(Duration::from_secs(5), changes.recv()).await.unwrap();
    assert_eq!(changed, Some(path));
    assert_eq!(
        store.get_as::<String>("db.host").unwrap(),
        Some("db.internal".to_string())
    );
}

#[tokio::test]
async fn test_watched_malformed_edit_is_skipped() {
    let dir = config_dir(&[("db.yaml", "host: localhost\n")]);
    let notifier = ChangeNotifier::new();
    let store = ConfigStore::open(dir.path(), notifier.clone()).unwrap();
    store.watch("db").await.unwrap();

    let path = store.document("db").unwrap().path().to_path_buf();
    let mut changes = notifier.register(&path).subscribe();

    fs::write(dir.path().join("db.yaml"), "host: [unterminated\n").unwrap();
    assert!(timeout(Duration::from_millis(500), changes.recv()).await.is_err());
    assert_eq!(
        store.get_as::<String>("db.host").unwrap(),
        Some("localhost".to_string())
    );

    // The watch loop survived the bad edit.
    fs::write(dir.path().join("db.yaml"), "host: recovered\n").unwrap();
    let changed = timeout(Duration::from_secs(5), changes.recv()).await.unwrap();
    assert!(changed.is_some());
    assert_eq!(
        store.get_as::<String>("db.host").unwrap(),
        Some("recovered".to_string())
    );
}

#[tokio::test]
async fn test_save_round_trips_through_the_file() {
    let dir = config_dir(&[
        ("db.yaml", "host: localhost\n"),
        ("rabbit.toml", "host = \"mq\"\n"),
    ]);
    let store = ConfigStore::open(dir.path(), ChangeNotifier::new()).unwrap();

    store.save("db", "pool.max", 50i64).unwrap();
    store.save("rabbit", "port", 5673i64).unwrap();

    let reopened = ConfigStore::open(dir.path(), ChangeNotifier::new()).unwrap();
    assert_eq!(reopened.get_as::<u32>("db.pool.max").unwrap(), Some(50));
    assert_eq!(
        reopened.get_as::<String>("db.host").unwrap(),
        Some("localhost".to_string())
    );
    assert_eq!(reopened.get_as::<u16>("rabbit.port").unwrap(), Some(5673));
}

#[test]
fn test_unknown_document_operations() {
    let store = ConfigStore::new(ChangeNotifier::new());
    assert!(matches!(
        store.reload("db"),
        Err(ConfigError::UnknownDocument(_))
    ));
    assert!(matches!(
        store.save("db", "host", "x"),
        Err(ConfigError::UnknownDocument(_))
    ));
}

proptest! {
    #[test]
    fn prop_get_never_panics(path in "[a-z.]{0,24}") {
        let dir = config_dir(&[("db.yaml", "host: localhost\npool:\n  max: 20\nreplicas:\n  - a\n  - b\n")]);
        let store = ConfigStore::open(dir.path(), ChangeNotifier::new()).unwrap();
        let _ = store.get(&path);
    }

    #[test]
    fn prop_unknown_keys_are_absent(key in "[a-z]{1,12}") {
        prop_assume!(key != "host" && key != "pool" && key != "replicas");
        let dir = config_dir(&[("db.yaml", "host: localhost\npool:\n  max: 20\nreplicas:\n  - a\n  - b\n")]);
        let store = ConfigStore::open(dir.path(), ChangeNotifier::new()).unwrap();
        let dotted = format!("db.{}", key);
        prop_assert!(store.get(&dotted).is_none());
    }
}
