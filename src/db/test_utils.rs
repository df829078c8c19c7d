//! Pools and fixtures for module tests; always the production schema

use sqlx::SqlitePool;

use super::Database;

pub async fn test_pool() -> SqlitePool {
    let db = Database::new(None)
        .await
        .expect("in-memory database");
    db.pool().clone()
}

/// Insert a bare account row and return its ID
pub async fn insert_account(pool: &SqlitePool, username: &str, plan: &str) -> String {
    let id = uuid::Uuid::new_v4().to_string();
    sqlx::query("INSERT INTO accounts (id, username, plan) VALUES (?, ?, ?)")
        .bind(&id)
        .bind(username)
        .bind(plan)
        .execute(pool)
        .await
        .expect("insert account fixture");
    id
}
