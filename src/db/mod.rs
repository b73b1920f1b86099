pub mod attendees;
pub mod deletions;
pub mod events;
pub mod groups;
pub mod models;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::str::FromStr;

/// Initialize the database connection pool and run migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    run_migrations(&pool).await?;

    Ok(pool)
}

/// Run SQL migrations from the migrations directory.
async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let sql = include_str!("../../migrations/001_initial.sql");

    // sqlx::query().execute() only runs the first statement, so split on semicolons.
    for statement in sql.split(';') {
        let trimmed = statement.trim();
        if trimmed.is_empty() {
            continue;
        }
        // A segment can be nothing but comments (e.g. the file trailer).
        let has_sql = trimmed.lines().any(|line| {
            let l = line.trim();
            !l.is_empty() && !l.starts_with("--")
        });
        if !has_sql {
            continue;
        }
        sqlx::query(trimmed).execute(pool).await?;
    }

    Ok(())
}

/// Build an `IN (?, ?, ...)` placeholder list for `n` binds.
pub(crate) fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Create an in-memory pool for testing.
#[cfg(test)]
pub async fn test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create test pool");

    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&pool)
        .await
        .expect("Failed to enable foreign keys");

    run_migrations(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_init_pool_with_memory_url_succeeds() {
        let pool = init_pool("sqlite::memory:")
            .await
            .expect("init_pool should succeed");

        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM calendar_events")
            .fetch_one(&pool)
            .await
            .expect("calendar_events table should exist");
        assert_eq!(row.0, 0);
    }

    #[tokio::test]
    async fn test_test_pool_has_all_tables() {
        let pool = test_pool().await;

        for table in &[
            "group_members",
            "event_categories",
            "calendar_events",
            "event_attendees",
            "pending_local_deletions",
        ] {
            let query = format!("SELECT COUNT(*) FROM {table}");
            let row: (i64,) = sqlx::query_as(&query)
                .fetch_one(&pool)
                .await
                .unwrap_or_else(|_| panic!("Table {table} should exist"));
            assert_eq!(row.0, 0, "Table {table} should be empty initially");
        }
    }

    #[tokio::test]
    async fn test_run_migrations_idempotent() {
        let pool = test_pool().await;
        let result = run_migrations(&pool).await;
        assert!(result.is_ok(), "Re-running migrations should succeed");
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(placeholders(1), "?");
        assert_eq!(placeholders(3), "?, ?, ?");
    }
}
