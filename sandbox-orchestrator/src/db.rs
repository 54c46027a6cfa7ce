use crate::error::Result;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode},
    SqlitePool,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::instrument;

/// Initialize database connection pool
#[instrument(fields(db_path = %db_path.display()))]
pub async fn create_pool(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true);

    let pool = SqlitePool::connect_with(options).await?;

    Ok(pool)
}

/// Run database migrations
#[instrument(skip(pool))]
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;

    Ok(())
}

/// Embedded migrations not yet applied to this database.
pub async fn pending_migrations(pool: &SqlitePool) -> Result<usize> {
    let tracked: Option<(String,)> = sqlx::query_as(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name = '_sqlx_migrations'",
    )
    .fetch_optional(pool)
    .await?;

    let applied: HashSet<i64> = if tracked.is_some() {
        sqlx::query_as::<_, (i64,)>("SELECT version FROM _sqlx_migrations WHERE success = 1")
            .fetch_all(pool)
            .await?
            .into_iter()
            .map(|(version,)| version)
            .collect()
    } else {
        HashSet::new()
    };

    Ok(sqlx::migrate!("./migrations")
        .iter()
        .filter(|m| !m.migration_type.is_down_migration() && !applied.contains(&m.version))
        .count())
}

/// Copy the database aside before migrating. Returns the backup path; nothing
/// is copied when the database does not exist yet.
pub fn backup_database(db_path: &Path) -> Result<PathBuf> {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();

    let backup_path = db_path.with_extension(format!("db.backup.{}", timestamp));

    if db_path.exists() {
        std::fs::copy(db_path, &backup_path)?;
    }

    Ok(backup_path)
}

fn backup_prefix(db_path: &Path) -> Option<String> {
    db_path
        .with_extension("db.backup.")
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
}

/// Deletes all but the `keep` newest backups of `db_path`. Returns the
/// removed paths.
pub fn prune_backups(db_path: &Path, keep: usize) -> Result<Vec<PathBuf>> {
    let Some(prefix) = backup_prefix(db_path) else {
        return Ok(Vec::new());
    };
    let dir = db_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let mut backups: Vec<(u64, PathBuf)> = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let stamp = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.strip_prefix(&prefix))
            .and_then(|ts| ts.parse::<u64>().ok());
        if let Some(stamp) = stamp {
            backups.push((stamp, path));
        }
    }

    backups.sort_by(|a, b| b.0.cmp(&a.0));
    let mut removed = Vec::new();
    for (_, path) in backups.into_iter().skip(keep) {
        std::fs::remove_file(&path)?;
        removed.push(path);
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn creates_file_and_applies_migrations() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("nested").join("sandbox.db");

        let pool = create_pool(&db_path).await.unwrap();
        run_migrations(&pool).await.unwrap();
        // Second run is a no-op.
        run_migrations(&pool).await.unwrap();

        assert!(db_path.exists());
        let tables: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
                .fetch_all(&pool)
                .await
                .unwrap();
        let names: Vec<&str> = tables.iter().map(|t| t.0.as_str()).collect();
        assert!(names.contains(&"workshops"));
        assert!(names.contains(&"members"));
        assert!(names.contains(&"attempts"));
    }

    #[test]
    fn backup_copies_existing_database() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("sandbox.db");
        std::fs::write(&db_path, b"sqlite").unwrap();

        let backup = backup_database(&db_path).unwrap();

        assert!(backup.exists());
        assert_eq!(std::fs::read(backup).unwrap(), b"sqlite");
    }

    #[test]
    fn backup_of_missing_database_copies_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let backup = backup_database(&dir.path().join("absent.db")).unwrap();
        assert!(!backup.exists());
    }

    #[tokio::test]
    async fn pending_migrations_drop_to_zero_once_applied() {
        let dir = tempfile::tempdir().unwrap();
        let pool = create_pool(&dir.path().join("sandbox.db")).await.unwrap();

        assert!(pending_migrations(&pool).await.unwrap() > 0);
        run_migrations(&pool).await.unwrap();
        assert_eq!(pending_migrations(&pool).await.unwrap(), 0);
    }

    #[test]
    fn prune_keeps_newest_backups() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("sandbox.db");
        std::fs::write(&db_path, b"sqlite").unwrap();
        for ts in [100, 400, 200, 500, 300] {
            std::fs::write(dir.path().join(format!("sandbox.db.backup.{ts}")), b"old").unwrap();
        }
        std::fs::write(dir.path().join("sandbox.db.backup.notes"), b"kept").unwrap();

        let removed = prune_backups(&db_path, 2).unwrap();

        assert_eq!(removed.len(), 3);
        for ts in [100, 200, 300] {
            assert!(!dir.path().join(format!("sandbox.db.backup.{ts}")).exists());
        }
        for ts in [400, 500] {
            assert!(dir.path().join(format!("sandbox.db.backup.{ts}")).exists());
        }
        assert!(db_path.exists());
        assert!(dir.path().join("sandbox.db.backup.notes").exists());
    }
}
