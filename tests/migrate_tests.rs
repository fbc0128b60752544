use std::path::{Path, PathBuf};

use hush::storage::Storage;

fn migrations_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations")
}

fn temp_db_path() -> PathBuf {
    let pid = std::process::id();
    let ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    std::env::temp_dir().join(format!("hush-migrate-test-{pid}-{ts}.db"))
}

fn applied_versions(db_path: &Path) -> Vec<i64> {
    let conn = rusqlite::Connection::open(db_path).unwrap();
    let mut stmt = conn
        .prepare("SELECT version FROM schema_migrations ORDER BY version")
        .unwrap();
    let versions = stmt
        .query_map([], |row| row.get(0))
        .unwrap()
        .map(|r| r.unwrap())
        .collect();
    versions
}

/// Two consecutive startups against the same database apply the shipped
/// migrations exactly once and leave a working schema behind.
#[test]
fn shipped_migrations_are_idempotent_across_restarts() {
    let db_path = temp_db_path();

    // First startup: everything applies.
    {
        let mut storage = Storage::open(&db_path).unwrap();
        let applied = storage.migrate(&migrations_dir()).unwrap();
        assert_eq!(applied, 3);
    }
    assert_eq!(applied_versions(&db_path), vec![1, 2, 3]);

    // Second startup: nothing re-runs, nothing re-executes DDL.
    {
        let mut storage = Storage::open(&db_path).unwrap();
        assert_eq!(storage.migrate(&migrations_dir()).unwrap(), 0);
    }
    assert_eq!(applied_versions(&db_path), vec![1, 2, 3]);

    let _ = std::fs::remove_file(&db_path);
}

/// The migrated schema supports the full room/message lifecycle.
#[test]
fn migrated_schema_is_functional() {
    let db_path = temp_db_path();

    let mut storage = Storage::open(&db_path).unwrap();
    storage.migrate(&migrations_dir()).unwrap();

    let (token, _) = storage.create_room(3600).unwrap();
    let now = hush::storage::now_secs();
    assert_eq!(storage.insert_message(&token, b"n", b"c", now, "MSG").unwrap(), 1);
    assert_eq!(
        storage.insert_message(&token, b"n", b"c", now, "IMG_END").unwrap(),
        2
    );

    let rows = storage.messages_since(&token, 0).unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1].message_type, "IMG_END");

    storage.delete_room(&token).unwrap();
    assert!(!storage.room_exists(&token).unwrap());

    let _ = std::fs::remove_file(&db_path);
}
