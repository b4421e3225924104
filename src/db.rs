// src/db.rs
use crate::models::{User, UserId};
use log::info;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Error as SqlxError;

pub async fn init(database_url: &str) -> Result<SqlitePool, SqlxError> {
    // An in-memory database lives and dies with its single connection.
    let options = if database_url.contains(":memory:") {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(5)
    };
    let pool = options.connect(database_url).await?;

    create_tables(&pool).await?;

    info!("Successfully connected to {}.", database_url);
    Ok(pool)
}

async fn create_tables(pool: &SqlitePool) -> Result<(), SqlxError> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            username TEXT NOT NULL UNIQUE,
            hash TEXT NOT NULL,
            cash INTEGER NOT NULL,
            starting_cash INTEGER NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL REFERENCES users(id),
            kind TEXT NOT NULL CHECK (kind IN ('BUY', 'SELL', 'DEPOSIT')),
            symbol TEXT NOT NULL,
            shares INTEGER NOT NULL,
            price INTEGER NOT NULL,
            timestamp TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_transactions_user_symbol
         ON transactions (user_id, symbol)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Inserts a new user, returning `None` when the username is already taken.
pub async fn create_user(
    pool: &SqlitePool,
    username: &str,
    hash: &str,
    starting_cash: i64,
) -> Result<Option<UserId>, SqlxError> {
    let result = sqlx::query(
        "INSERT INTO users (username, hash, cash, starting_cash) VALUES (?, ?, ?, ?)",
    )
    .bind(username)
    .bind(hash)
    .bind(starting_cash)
    .bind(starting_cash)
    .execute(pool)
    .await;

    match result {
        Ok(done) => Ok(Some(done.last_insert_rowid())),
        Err(SqlxError::Database(e)) if e.is_unique_violation() => Ok(None),
        Err(e) => Err(e),
    }
}

pub async fn find_user_by_name(
    pool: &SqlitePool,
    username: &str,
) -> Result<Option<User>, SqlxError> {
    sqlx::query_as::<_, User>(
        "SELECT id, username, hash, cash, starting_cash FROM users WHERE username = ?",
    )
    .bind(username)
    .fetch_optional(pool)
    .await
}

pub async fn find_user(pool: &SqlitePool, user_id: UserId) -> Result<Option<User>, SqlxError> {
    sqlx::query_as::<_, User>(
        "SELECT id, username, hash, cash, starting_cash FROM users WHERE id = ?",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await
}

pub async fn update_password_hash(
    pool: &SqlitePool,
    user_id: UserId,
    hash: &str,
) -> Result<(), SqlxError> {
    sqlx::query("UPDATE users SET hash = ? WHERE id = ?")
        .bind(hash)
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn count_users(pool: &SqlitePool) -> Result<i64, SqlxError> {
    sqlx::query_scalar("SELECT COUNT(*) FROM users")
        .fetch_one(pool)
        .await
}

#[cfg(test)]
pub async fn test_pool() -> SqlitePool {
    init("sqlite::memory:").await.unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_username_creates_no_row() {
        let pool = test_pool().await;

        let first = create_user(&pool, "alice", "hash", 1_000_000).await.unwrap();
        assert!(first.is_some());

        let second = create_user(&pool, "alice", "other", 1_000_000).await.unwrap();
        assert_eq!(second, None);
        assert_eq!(count_users(&pool).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn new_users_start_with_their_starting_cash() {
        let pool = test_pool().await;
        let id = create_user(&pool, "bob", "hash", 1_000_000)
            .await
            .unwrap()
            .unwrap();

        let user = find_user(&pool, id).await.unwrap().unwrap();
        assert_eq!(user.username, "bob");
        assert_eq!(user.cash, 1_000_000);
        assert_eq!(user.starting_cash, 1_000_000);
        assert!(find_user_by_name(&pool, "nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn password_hash_is_replaced() {
        let pool = test_pool().await;
        let id = create_user(&pool, "carol", "old", 0).await.unwrap().unwrap();

        update_password_hash(&pool, id, "new").await.unwrap();

        let user = find_user_by_name(&pool, "carol").await.unwrap().unwrap();
        assert_eq!(user.hash, "new");
    }
}
