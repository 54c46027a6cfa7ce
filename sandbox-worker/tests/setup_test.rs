use sandbox_worker::{open_database, BACKUPS_KEPT};
use std::path::Path;

fn backups(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("sandbox.db.backup."))
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn reopening_a_current_database_takes_no_backup() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("sandbox.db");

    open_database(&db_path).await.unwrap().close().await;
    open_database(&db_path).await.unwrap().close().await;
    open_database(&db_path).await.unwrap().close().await;

    assert!(db_path.exists());
    assert!(backups(dir.path()).is_empty());
}

#[tokio::test]
async fn unmigrated_database_is_backed_up_and_old_backups_pruned() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("sandbox.db");
    for ts in 1..=BACKUPS_KEPT + 3 {
        std::fs::write(dir.path().join(format!("sandbox.db.backup.{ts}")), b"old").unwrap();
    }

    // An empty sqlite file has every migration pending.
    let pool = sandbox_orchestrator::db::create_pool(&db_path).await.unwrap();
    pool.close().await;

    let pool = open_database(&db_path).await.unwrap();
    assert_eq!(
        sandbox_orchestrator::db::pending_migrations(&pool).await.unwrap(),
        0
    );
    pool.close().await;

    let remaining = backups(dir.path());
    assert_eq!(remaining.len(), BACKUPS_KEPT);
    assert!(!remaining.contains(&"sandbox.db.backup.1".to_string()));
    assert!(!remaining.contains(&"sandbox.db.backup.3".to_string()));
}
