//! Versioned schema-migration runner.
//!
//! Discovers `NNN_name.sql` files in a directory and applies every file whose
//! version exceeds the highest version recorded in `schema_migrations`, in
//! ascending order.  Each file is applied and recorded inside one
//! transaction, so a failed migration leaves neither its DDL nor its tracking
//! row behind and the next run retries from the same version.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection};

use crate::storage::now_secs;

#[derive(Debug)]
pub enum MigrateError {
    Io { path: PathBuf, source: std::io::Error },
    /// Filename has no `NNN_` prefix.
    BadFilename(String),
    /// Prefix present but not a parseable version number.
    BadVersion(String),
    DuplicateVersion(i64),
    Sqlite { migration: String, source: rusqlite::Error },
}

impl std::fmt::Display for MigrateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrateError::Io { path, source } => {
                write!(f, "cannot read {}: {source}", path.display())
            }
            MigrateError::BadFilename(name) => {
                write!(f, "invalid migration filename {name} (expected NNN_name.sql)")
            }
            MigrateError::BadVersion(name) => {
                write!(f, "invalid version prefix in migration filename {name}")
            }
            MigrateError::DuplicateVersion(version) => {
                write!(f, "duplicate migration version {version}")
            }
            MigrateError::Sqlite { migration, source } => {
                write!(f, "migration {migration} failed: {source}")
            }
        }
    }
}

impl std::error::Error for MigrateError {}

/// A single migration file, parsed from its filename.
#[derive(Debug)]
struct Migration {
    version: i64,
    name: String,
    path: PathBuf,
}

impl Migration {
    /// Label used in logs and errors, e.g. `002_message_type`.
    fn label(&self) -> String {
        format!("{:03}_{}", self.version, self.name)
    }
}

/// Applies pending migrations from a directory to a database connection.
pub struct Runner<'a> {
    conn: &'a mut Connection,
    dir: PathBuf,
}

impl<'a> Runner<'a> {
    pub fn new(conn: &'a mut Connection, dir: &Path) -> Self {
        Self {
            conn,
            dir: dir.to_path_buf(),
        }
    }

    /// Apply every pending migration, in version order.  Returns the number
    /// of files applied.  Safe to call on every startup: a file is applied
    /// exactly once across all invocations.
    pub fn run(&mut self) -> Result<usize, MigrateError> {
        self.ensure_tracking_table()?;
        let applied_head = self.applied_head()?;
        let migrations = self.discover()?;

        let mut applied = 0;
        for migration in migrations.iter().filter(|m| m.version > applied_head) {
            self.apply(migration)?;
            crate::tlog!("migrate: applied {}", migration.label());
            applied += 1;
        }

        Ok(applied)
    }

    fn ensure_tracking_table(&self) -> Result<(), MigrateError> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                     version    INTEGER PRIMARY KEY,
                     name       TEXT NOT NULL,
                     applied_at INTEGER NOT NULL
                 )",
            )
            .map_err(|source| MigrateError::Sqlite {
                migration: "schema_migrations".to_string(),
                source,
            })
    }

    /// Highest applied version, 0 on a fresh database.
    fn applied_head(&self) -> Result<i64, MigrateError> {
        self.conn
            .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
                row.get(0)
            })
            .map_err(|source| MigrateError::Sqlite {
                migration: "schema_migrations".to_string(),
                source,
            })
    }

    /// All `*.sql` files in the directory, sorted by version.  Versions must
    /// be unique; gaps are fine.
    fn discover(&self) -> Result<Vec<Migration>, MigrateError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|source| MigrateError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let mut migrations = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| MigrateError::Io {
                path: self.dir.clone(),
                source,
            })?;
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }

            let file_name = entry.file_name().to_string_lossy().into_owned();
            let Some(stem) = file_name.strip_suffix(".sql") else {
                continue;
            };

            let (prefix, name) = stem
                .split_once('_')
                .ok_or_else(|| MigrateError::BadFilename(file_name.clone()))?;
            let version: i64 = prefix
                .parse()
                .map_err(|_| MigrateError::BadVersion(file_name.clone()))?;

            migrations.push(Migration {
                version,
                name: name.to_string(),
                path: entry.path(),
            });
        }

        migrations.sort_by_key(|m| m.version);
        for pair in migrations.windows(2) {
            if pair[0].version == pair[1].version {
                return Err(MigrateError::DuplicateVersion(pair[0].version));
            }
        }

        Ok(migrations)
    }

    /// Run one migration file and its tracking insert in a single
    /// transaction.
    fn apply(&mut self, migration: &Migration) -> Result<(), MigrateError> {
        let sql = std::fs::read_to_string(&migration.path).map_err(|source| MigrateError::Io {
            path: migration.path.clone(),
            source,
        })?;

        let sqlite = |source| MigrateError::Sqlite {
            migration: migration.label(),
            source,
        };

        let tx = self.conn.transaction().map_err(sqlite)?;
        tx.execute_batch(&sql).map_err(sqlite)?;
        tx.execute(
            "INSERT INTO schema_migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
            params![migration.version, migration.name, now_secs()],
        )
        .map_err(sqlite)?;
        tx.commit().map_err(sqlite)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Unique temp directory per invocation so parallel tests don't collide.
    fn temp_migrations_dir() -> PathBuf {
        let pid = std::process::id();
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("hush-migrate-test-{pid}-{ts}"));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn applied_versions(conn: &Connection) -> Vec<i64> {
        let mut stmt = conn
            .prepare("SELECT version FROM schema_migrations ORDER BY version")
            .unwrap();
        stmt.query_map([], |row| row.get(0))
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
    }

    #[test]
    fn applies_pending_files_in_version_order() {
        let dir = temp_migrations_dir();
        std::fs::write(dir.join("001_rooms.sql"), "CREATE TABLE a (x INTEGER);").unwrap();
        std::fs::write(dir.join("005_later.sql"), "CREATE TABLE c (x INTEGER);").unwrap();
        std::fs::write(
            dir.join("002_depends.sql"),
            "ALTER TABLE a ADD COLUMN y INTEGER;",
        )
        .unwrap();
        // Non-SQL files are ignored.
        std::fs::write(dir.join("README.md"), "notes").unwrap();

        let mut conn = Connection::open_in_memory().unwrap();
        let applied = Runner::new(&mut conn, &dir).run().unwrap();

        assert_eq!(applied, 3);
        assert_eq!(applied_versions(&conn), vec![1, 2, 5]);
        // 002 ran after 001, so the altered column exists.
        conn.execute("INSERT INTO a (x, y) VALUES (1, 2)", []).unwrap();
    }

    #[test]
    fn second_run_applies_nothing() {
        let dir = temp_migrations_dir();
        std::fs::write(dir.join("001_rooms.sql"), "CREATE TABLE a (x INTEGER);").unwrap();

        let mut conn = Connection::open_in_memory().unwrap();
        assert_eq!(Runner::new(&mut conn, &dir).run().unwrap(), 1);
        assert_eq!(Runner::new(&mut conn, &dir).run().unwrap(), 0);
        assert_eq!(applied_versions(&conn), vec![1]);
    }

    #[test]
    fn failed_migration_rolls_back_ddl_and_tracking_row() {
        let dir = temp_migrations_dir();
        std::fs::write(dir.join("001_rooms.sql"), "CREATE TABLE a (x INTEGER);").unwrap();
        std::fs::write(
            dir.join("002_broken.sql"),
            "CREATE TABLE b (x INTEGER); THIS IS NOT SQL;",
        )
        .unwrap();

        let mut conn = Connection::open_in_memory().unwrap();
        let err = Runner::new(&mut conn, &dir).run().unwrap_err();
        assert!(err.to_string().contains("002_broken"), "{err}");

        // 001 landed, 002 left nothing behind.
        assert_eq!(applied_versions(&conn), vec![1]);
        assert!(conn.execute("INSERT INTO b (x) VALUES (1)", []).is_err());

        // Fixing the file lets the next run pick up from the same version.
        std::fs::write(dir.join("002_broken.sql"), "CREATE TABLE b (x INTEGER);").unwrap();
        assert_eq!(Runner::new(&mut conn, &dir).run().unwrap(), 1);
        assert_eq!(applied_versions(&conn), vec![1, 2]);
    }

    #[test]
    fn rejects_malformed_filenames() {
        let dir = temp_migrations_dir();
        std::fs::write(dir.join("noprefix.sql"), "SELECT 1;").unwrap();

        let mut conn = Connection::open_in_memory().unwrap();
        assert!(matches!(
            Runner::new(&mut conn, &dir).run(),
            Err(MigrateError::BadFilename(_))
        ));

        std::fs::remove_file(dir.join("noprefix.sql")).unwrap();
        std::fs::write(dir.join("abc_bad.sql"), "SELECT 1;").unwrap();
        assert!(matches!(
            Runner::new(&mut conn, &dir).run(),
            Err(MigrateError::BadVersion(_))
        ));
    }

    #[test]
    fn rejects_duplicate_versions() {
        let dir = temp_migrations_dir();
        std::fs::write(dir.join("001_one.sql"), "SELECT 1;").unwrap();
        std::fs::write(dir.join("001_other.sql"), "SELECT 1;").unwrap();

        let mut conn = Connection::open_in_memory().unwrap();
        assert!(matches!(
            Runner::new(&mut conn, &dir).run(),
            Err(MigrateError::DuplicateVersion(1))
        ));
    }

    #[test]
    fn unreadable_directory_is_an_error() {
        let mut conn = Connection::open_in_memory().unwrap();
        let missing = std::env::temp_dir().join("hush-migrate-test-does-not-exist");
        assert!(matches!(
            Runner::new(&mut conn, &missing).run(),
            Err(MigrateError::Io { .. })
        ));
    }
}
