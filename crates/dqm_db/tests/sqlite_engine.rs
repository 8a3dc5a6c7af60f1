#![cfg(feature = "sqlite")]

use dqm_db::{engine_for, DbValue, EngineKind, Operation, OperationResult};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn file_database_is_shared_between_connections() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("shared.db");
    let dsn = path.to_string_lossy().to_string();
    assert_eq!(EngineKind::detect(&dsn), EngineKind::Sqlite);

    let engine = engine_for(EngineKind::Sqlite);
    let mut writer = engine.open(&dsn).await.unwrap();
    let mut reader = engine.open(&format!("sqlite:{}", dsn)).await.unwrap();

    writer
        .execute(&Operation::batch(
            "CREATE TABLE accounts (id INTEGER PRIMARY KEY, username TEXT UNIQUE NOT NULL);\n\
             INSERT INTO accounts (username) VALUES ('seed');",
        ))
        .await
        .unwrap();

    let result = writer
        .execute(&Operation::execute(
            "INSERT INTO accounts (username) VALUES (?)",
            vec![DbValue::from("alice")],
        ))
        .await
        .unwrap();
    assert_eq!(result.rows_affected(), 1);

    let rows = reader
        .execute(&Operation::query(
            "SELECT username FROM accounts ORDER BY id",
            vec![],
        ))
        .await
        .unwrap()
        .into_rows();
    let names: Vec<String> = rows
        .iter()
        .map(|row| row.get_by_name::<String>("username").unwrap())
        .collect();
    assert_eq!(names, vec!["seed".to_string(), "alice".to_string()]);

    writer.close().await.unwrap();
    reader.close().await.unwrap();
}

#[tokio::test]
async fn unique_violation_is_fatal() {
    let tmp = tempfile::tempdir().unwrap();
    let dsn = tmp.path().join("unique.db").to_string_lossy().to_string();
    let mut conn = engine_for(EngineKind::Sqlite).open(&dsn).await.unwrap();

    conn.execute(&Operation::batch(
        "CREATE TABLE t (name TEXT UNIQUE NOT NULL);",
    ))
    .await
    .unwrap();
    let insert = Operation::execute("INSERT INTO t (name) VALUES (?)", vec![DbValue::from("x")]);
    conn.execute(&insert).await.unwrap();

    let err = conn.execute(&insert).await.unwrap_err();
    assert!(err.is_fatal());
    assert!(err.message().to_lowercase().contains("unique"));
}

#[tokio::test]
async fn update_without_match_reports_zero_rows() {
    let tmp = tempfile::tempdir().unwrap();
    let dsn = tmp.path().join("update.db").to_string_lossy().to_string();
    let mut conn = engine_for(EngineKind::Sqlite).open(&dsn).await.unwrap();

    conn.execute(&Operation::batch("CREATE TABLE t (id INTEGER PRIMARY KEY, n INTEGER);"))
        .await
        .unwrap();
    let result = conn
        .execute(&Operation::execute(
            "UPDATE t SET n = ? WHERE id = ?",
            vec![DbValue::from(1_i64), DbValue::from(42_i64)],
        ))
        .await
        .unwrap();
    assert_eq!(
        result,
        OperationResult::Affected {
            rows: 0,
            last_insert_id: None
        }
    );
}
