//! Shared database helpers for tests

use sqlx::sqlite::SqlitePoolOptions;

use super::Database;

/// Fresh in-memory database with migrations applied
///
/// The pool is limited to one connection: every `:memory:` connection would
/// otherwise open its own empty database.
pub async fn create_test_db() -> Database {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(":memory:")
        .await
        .expect("Failed to create test database");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    Database::new(pool)
}
