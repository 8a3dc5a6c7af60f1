//! The `demo` schema: licences, accounts, tokens and failed-login records.
//!
//! Timestamps are unix seconds in BIGINT columns and flags are INTEGER 0/1,
//! so the same queries run unchanged on every engine.

use dqm_db::EngineKind;
use dqm_queue::Migration;

/// Name the launcher registers this schema under.
pub const DEMO_SCHEMA: &str = "demo";

fn id_column(kind: EngineKind) -> &'static str {
    match kind {
        EngineKind::Sqlite => "INTEGER PRIMARY KEY AUTOINCREMENT",
        EngineKind::Postgres => "BIGSERIAL PRIMARY KEY",
        EngineKind::Mysql => "BIGINT AUTO_INCREMENT PRIMARY KEY",
        EngineKind::Db2 => "BIGINT NOT NULL GENERATED ALWAYS AS IDENTITY PRIMARY KEY",
    }
}

/// Ordered migrations of the demo schema for one engine.
pub fn demo_migrations(kind: EngineKind) -> Vec<Migration> {
    let id = id_column(kind);
    vec![
        Migration::new(
            1,
            "licenses",
            format!(
                "CREATE TABLE licenses (\n\
                 \x20   license_id {id},\n\
                 \x20   api_key VARCHAR(128) NOT NULL UNIQUE,\n\
                 \x20   name VARCHAR(255) NOT NULL,\n\
                 \x20   expires_at BIGINT,\n\
                 \x20   enabled INTEGER NOT NULL DEFAULT 1\n\
                 );"
            ),
        ),
        Migration::new(
            2,
            "accounts",
            format!(
                "CREATE TABLE accounts (\n\
                 \x20   account_id {id},\n\
                 \x20   username VARCHAR(255) NOT NULL UNIQUE,\n\
                 \x20   email VARCHAR(255) NOT NULL,\n\
                 \x20   full_name VARCHAR(255),\n\
                 \x20   password_hash VARCHAR(64) NOT NULL,\n\
                 \x20   enabled INTEGER NOT NULL DEFAULT 1,\n\
                 \x20   authorized INTEGER NOT NULL DEFAULT 1,\n\
                 \x20   roles VARCHAR(255) NOT NULL DEFAULT 'user',\n\
                 \x20   created_at BIGINT NOT NULL\n\
                 );"
            ),
        ),
        Migration::new(
            3,
            "tokens",
            "CREATE TABLE tokens (\n\
             \x20   token_hash VARCHAR(64) NOT NULL PRIMARY KEY,\n\
             \x20   account_id BIGINT NOT NULL,\n\
             \x20   expires_at BIGINT NOT NULL,\n\
             \x20   created_at BIGINT NOT NULL\n\
             );\n\
             CREATE INDEX idx_tokens_account ON tokens (account_id);",
        ),
        Migration::new(
            4,
            "login_failures",
            format!(
                "CREATE TABLE login_failures (\n\
                 \x20   failure_id {id},\n\
                 \x20   login_id VARCHAR(255) NOT NULL,\n\
                 \x20   failed_at BIGINT NOT NULL\n\
                 );\n\
                 CREATE INDEX idx_login_failures_login ON login_failures (login_id, failed_at);"
            ),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_ordered_for_every_engine() {
        for kind in EngineKind::ALL {
            let migrations = demo_migrations(kind);
            let versions: Vec<i64> = migrations.iter().map(|m| m.version).collect();
            assert_eq!(versions, vec![1, 2, 3, 4]);
            assert!(migrations[1].sql.contains("username VARCHAR(255) NOT NULL UNIQUE"));
        }
    }

    #[test]
    fn identity_columns_follow_engine() {
        assert!(demo_migrations(EngineKind::Postgres)[0].sql.contains("BIGSERIAL"));
        assert!(demo_migrations(EngineKind::Mysql)[0].sql.contains("AUTO_INCREMENT"));
        assert!(demo_migrations(EngineKind::Db2)[0].sql.contains("GENERATED ALWAYS AS IDENTITY"));
        assert!(demo_migrations(EngineKind::Sqlite)[0].sql.contains("AUTOINCREMENT"));
    }
}
