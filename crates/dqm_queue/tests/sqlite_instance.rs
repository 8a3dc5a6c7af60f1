//! End-to-end against a real SQLite file.

use dqm_db::{engine_for, DbValue, Engine, EngineConnection, EngineKind, Operation};
use dqm_queue::{ConnectionConfig, DqmSettings, MigrationAction, Registry, TierKind};
use std::fs;
use std::path::Path;

fn write_migrations(dir: &Path) {
    fs::create_dir_all(dir).unwrap();
    fs::write(
        dir.join("0001_items.sql"),
        "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT NOT NULL);",
    )
    .unwrap();
    fs::write(
        dir.join("0002_seed.sql"),
        "INSERT INTO items (name) VALUES ('alpha');\nINSERT INTO items (name) VALUES ('beta');",
    )
    .unwrap();
    fs::write(dir.join("README.md"), "not a migration").unwrap();
}

fn connection(db: &Path, migrations: &Path) -> ConnectionConfig {
    let mut config = ConnectionConfig::new("Helium", format!("sqlite:{}", db.display())).with_tier(TierKind::Fast, 4);
    config.automigrate = true;
    config.migrations = Some(migrations.to_path_buf());
    config.bootstrap_query = Some("SELECT COUNT(*) AS n FROM items".into());
    config
}

async fn count(registry: &Registry, sql: &str) -> i64 {
    registry
        .submit("Helium", TierKind::Fast, Operation::query(sql, vec![]))
        .await
        .unwrap()
        .await
        .unwrap()
        .first_row()
        .unwrap()
        .get_by_name::<i64>("n")
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn migrations_apply_once_across_restarts() {
    let tmp = tempfile::tempdir().unwrap();
    let db = tmp.path().join("helium.db");
    let migrations = tmp.path().join("migrations");
    write_migrations(&migrations);

    let registry = Registry::from_configs(vec![connection(&db, &migrations)], DqmSettings::default()).unwrap();
    let outcomes = registry.start_all().await;
    assert!(outcomes[0].ready, "{:?}", outcomes[0].error);

    let status = registry.status().remove(0).migration.unwrap();
    assert_eq!(status.action, MigrationAction::Apply);
    assert_eq!(status.applied, vec![1, 2]);
    assert_eq!(count(&registry, "SELECT COUNT(*) AS n FROM items").await, 2);
    assert!(registry.shutdown_all().await[0].clean);

    let registry = Registry::from_configs(vec![connection(&db, &migrations)], DqmSettings::default()).unwrap();
    assert!(registry.start_all().await[0].ready);

    let status = registry.status().remove(0).migration.unwrap();
    assert_eq!(status.action, MigrationAction::None);
    assert_eq!(status.installed, 2);
    assert!(status.applied.is_empty());
    assert_eq!(count(&registry, "SELECT COUNT(*) AS n FROM items").await, 2);
    assert_eq!(count(&registry, "SELECT COUNT(*) AS n FROM dqm_migrations").await, 2);
    registry.shutdown_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writers_share_one_file() {
    let tmp = tempfile::tempdir().unwrap();
    let db = tmp.path().join("helium.db");
    let migrations = tmp.path().join("migrations");
    write_migrations(&migrations);

    let registry = Registry::from_configs(vec![connection(&db, &migrations)], DqmSettings::default()).unwrap();
    assert!(registry.start_all().await[0].ready);

    let mut handles = Vec::new();
    for i in 0..20 {
        let handle = registry
            .submit(
                "Helium",
                TierKind::Fast,
                Operation::execute(
                    "INSERT INTO items (name) VALUES (?)",
                    vec![DbValue::from(format!("item-{i}"))],
                ),
            )
            .await
            .unwrap();
        handles.push(handle);
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().rows_affected(), 1);
    }

    assert_eq!(count(&registry, "SELECT COUNT(*) AS n FROM items").await, 22);
    let fast = registry.status().remove(0).tiers.remove(1);
    assert_eq!(fast.metrics.failed, 0);
    assert_eq!(fast.labels.len(), 4);
    registry.shutdown_all().await;
}

async fn scalar(db: &Path, sql: &str) -> i64 {
    let mut conn = engine_for(EngineKind::Sqlite)
        .open(&format!("sqlite:{}", db.display()))
        .await
        .unwrap();
    let value = conn
        .execute(&Operation::query(sql, vec![]))
        .await
        .unwrap()
        .first_row()
        .unwrap()
        .get_by_name::<i64>("n")
        .unwrap();
    conn.close().await.unwrap();
    value
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_migration_rolls_back_and_reapplies_after_fix() {
    let tmp = tempfile::tempdir().unwrap();
    let db = tmp.path().join("helium.db");
    let migrations = tmp.path().join("migrations");
    write_migrations(&migrations);
    fs::write(
        migrations.join("0003_extra.sql"),
        "CREATE TABLE extra (id INTEGER);\nINSERT INTO missing_table VALUES (1);",
    )
    .unwrap();

    let registry = Registry::from_configs(vec![connection(&db, &migrations)], DqmSettings::default()).unwrap();
    let outcomes = registry.start_all().await;
    assert!(!outcomes[0].ready);
    registry.shutdown_all().await;

    // Versions 1 and 2 committed; nothing of version 3 survived.
    assert_eq!(scalar(&db, "SELECT MAX(version) AS n FROM dqm_migrations").await, 2);
    assert_eq!(
        scalar(&db, "SELECT COUNT(*) AS n FROM sqlite_master WHERE name = 'extra'").await,
        0
    );

    fs::write(migrations.join("0003_extra.sql"), "CREATE TABLE extra (id INTEGER);").unwrap();
    let registry = Registry::from_configs(vec![connection(&db, &migrations)], DqmSettings::default()).unwrap();
    assert!(registry.start_all().await[0].ready);
    let status = registry.status().remove(0).migration.unwrap();
    assert_eq!(status.installed, 2);
    assert_eq!(status.applied, vec![3]);
    registry.shutdown_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_migration_reverts_down_to_the_first_irreversible_version() {
    let tmp = tempfile::tempdir().unwrap();
    let db = tmp.path().join("helium.db");
    let migrations = tmp.path().join("migrations");
    write_migrations(&migrations);
    fs::write(
        migrations.join("0002_seed.down.sql"),
        "DELETE FROM items WHERE name IN ('alpha', 'beta');",
    )
    .unwrap();
    fs::write(migrations.join("0003_tags.sql"), "CREATE TABLE tags (id INTEGER);").unwrap();
    fs::write(migrations.join("0003_tags.down.sql"), "DROP TABLE tags;").unwrap();

    let mut config = connection(&db, &migrations);
    config.test_migration = true;
    let registry = Registry::from_configs(vec![config], DqmSettings::default()).unwrap();
    assert!(registry.start_all().await[0].ready);

    let status = registry.status().remove(0).migration.unwrap();
    assert_eq!(status.applied, vec![1, 2, 3]);
    assert_eq!(status.reverted, vec![3, 2]);
    assert_eq!(count(&registry, "SELECT COUNT(*) AS n FROM items").await, 0);
    assert_eq!(count(&registry, "SELECT COUNT(*) AS n FROM dqm_migrations").await, 1);
    assert_eq!(
        count(&registry, "SELECT COUNT(*) AS n FROM sqlite_master WHERE name = 'tags'").await,
        0
    );
    registry.shutdown_all().await;
}
