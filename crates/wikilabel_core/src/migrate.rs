use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{Connection, Transaction, TransactionBehavior, params};

use crate::runtime::ResolvedPaths;

struct Migration {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "baseline",
        sql: include_str!("migrations/v001_baseline.sql"),
    },
    Migration {
        version: 2,
        name: "lookup_indexes",
        sql: include_str!("migrations/v002_lookup_indexes.sql"),
    },
    Migration {
        version: 3,
        name: "suggestion_reason",
        sql: include_str!("migrations/v003_suggestion_reason.sql"),
    },
];

/// Report returned after running migrations.
#[derive(Debug, Clone)]
pub struct MigrateReport {
    pub applied: Vec<AppliedMigration>,
    pub current_version: u32,
}

#[derive(Debug, Clone)]
pub struct AppliedMigration {
    pub version: u32,
    pub name: String,
}

/// Run all pending migrations against the database at `paths.db_path`.
/// Creates the database and parent directories if they do not exist.
pub fn run_migrations(paths: &ResolvedPaths) -> Result<MigrateReport> {
    ensure_db_parent(&paths.db_path)?;
    let connection = open_connection(&paths.db_path)?;
    migrate_connection(&connection)
}

/// Bring an open connection up to the latest schema version.
pub fn migrate_connection(connection: &Connection) -> Result<MigrateReport> {
    ensure_schema_migrations_table(connection)?;

    let current = current_version(connection)?;
    let mut applied = Vec::new();

    for migration in MIGRATIONS {
        if migration.version <= current {
            continue;
        }
        let fresh = apply_migration(connection, migration).with_context(|| {
            format!(
                "failed to apply migration v{:03}_{}",
                migration.version, migration.name
            )
        })?;
        if !fresh {
            continue;
        }
        tracing::debug!(
            version = migration.version,
            name = migration.name,
            "applied schema migration"
        );
        applied.push(AppliedMigration {
            version: migration.version,
            name: migration.name.to_string(),
        });
    }

    let final_version = current_version(connection)?;
    Ok(MigrateReport {
        applied,
        current_version: final_version,
    })
}

/// Returns the number of migrations that have not yet been applied.
pub fn pending_migration_count(paths: &ResolvedPaths) -> Result<usize> {
    if !paths.db_path.exists() {
        return Ok(MIGRATIONS.len());
    }
    let connection = open_connection(&paths.db_path)?;
    ensure_schema_migrations_table(&connection)?;
    let current = current_version(&connection)?;
    Ok(MIGRATIONS
        .iter()
        .filter(|m| m.version > current)
        .count())
}

/// Returns the highest applied migration version, or 0 if none applied.
pub fn current_version(connection: &Connection) -> Result<u32> {
    let version: i64 = connection
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .context("failed to read current migration version")?;
    u32::try_from(version).context("migration version does not fit into u32")
}

pub(crate) fn open_connection(db_path: &Path) -> Result<Connection> {
    let connection = Connection::open(db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    connection
        .busy_timeout(Duration::from_secs(5))
        .context("failed to set sqlite busy timeout")?;
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to enable WAL journal mode")?;
    Ok(connection)
}

pub(crate) fn ensure_db_parent(db_path: &Path) -> Result<()> {
    let parent = db_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("db path has no parent: {}", db_path.display()))?;
    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create database parent directory {}",
            parent.display()
        )
    })
}

fn ensure_schema_migrations_table(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at_unix INTEGER NOT NULL
            );",
        )
        .context("failed to create schema_migrations table")
}

/// Apply one migration inside an immediate transaction. Returns false when
/// another connection recorded the version first.
fn apply_migration(connection: &Connection, migration: &Migration) -> Result<bool> {
    let transaction = Transaction::new_unchecked(connection, TransactionBehavior::Immediate)
        .context("failed to start migration transaction")?;
    if current_version(&transaction)? >= migration.version {
        return Ok(false);
    }
    transaction
        .execute_batch(migration.sql)
        .with_context(|| format!("SQL execution failed for v{:03}", migration.version))?;
    transaction
        .execute(
            "INSERT INTO schema_migrations (version, name, applied_at_unix) VALUES (?1, ?2, ?3)",
            params![
                i64::from(migration.version),
                migration.name,
                chrono::Utc::now().timestamp()
            ],
        )
        .context("failed to record migration")?;
    transaction
        .commit()
        .context("failed to commit migration")?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn test_paths() -> (tempfile::TempDir, ResolvedPaths) {
        let temp = tempdir().expect("tempdir");
        let paths = ResolvedPaths::under(&temp.path().join("project"));
        (temp, paths)
    }

    #[test]
    fn migrations_apply_on_fresh_db() {
        let (_temp, paths) = test_paths();
        let report = run_migrations(&paths).expect("run_migrations");
        assert_eq!(report.applied.len(), MIGRATIONS.len());
        assert_eq!(report.current_version, 3);
        assert!(paths.db_path.exists());
    }

    #[test]
    fn migrations_are_idempotent() {
        let (_temp, paths) = test_paths();
        let first = run_migrations(&paths).expect("first run");
        assert_eq!(first.applied.len(), MIGRATIONS.len());

        let second = run_migrations(&paths).expect("second run");
        assert!(second.applied.is_empty());
        assert_eq!(second.current_version, 3);
    }

    #[test]
    fn recorded_versions_are_not_reapplied() {
        let (_temp, paths) = test_paths();
        run_migrations(&paths).expect("run_migrations");
        let connection = open_connection(&paths.db_path).expect("open");
        let reason_column = MIGRATIONS.last().expect("at least one migration");
        assert!(!apply_migration(&connection, reason_column).expect("apply"));
        assert_eq!(current_version(&connection).expect("version"), 3);
    }

    #[test]
    fn pending_count_tracks_applied_versions() {
        let (_temp, paths) = test_paths();
        assert_eq!(
            pending_migration_count(&paths).expect("pending count"),
            MIGRATIONS.len()
        );
        run_migrations(&paths).expect("run_migrations");
        assert_eq!(pending_migration_count(&paths).expect("pending count"), 0);
    }

    #[test]
    fn suggestions_table_keeps_compatible_columns() {
        let (_temp, paths) = test_paths();
        run_migrations(&paths).expect("run_migrations");
        let connection = open_connection(&paths.db_path).expect("open");
        let mut statement = connection
            .prepare("SELECT name FROM pragma_table_info('suggestions') ORDER BY cid")
            .expect("prepare");
        let columns = statement
            .query_map([], |row| row.get::<_, String>(0))
            .expect("query")
            .collect::<std::result::Result<Vec<_>, _>>()
            .expect("collect");
        assert_eq!(
            columns,
            vec![
                "id",
                "cluster_id",
                "page_id",
                "type",
                "suggestion_text",
                "confidence_score",
                "status",
                "created_date",
                "applied_date",
                "reason",
            ]
        );
    }
}
