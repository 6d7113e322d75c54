//! User repository for SQLite.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::models::User;

#[derive(Debug, thiserror::Error)]
pub enum UserRepoError {
    #[error("user already exists")]
    UserExists,
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Repository for user operations.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserRepo: Send + Sync {
    /// Whether a user with this email exists.
    async fn exists(&self, email: &str) -> Result<bool, UserRepoError>;

    /// Insert a new user. `UserExists` on a duplicate email.
    async fn add_user(&self, user: User) -> Result<(), UserRepoError>;
}

/// SQLite implementation of UserRepo.
#[derive(Clone)]
pub struct SqliteUserRepo {
    pool: SqlitePool,
}

impl SqliteUserRepo {
    /// Wraps the pool and ensures the schema exists. The empty-string
    /// checks back up the application-level validation at the storage
    /// layer.
    pub async fn new(pool: SqlitePool) -> Result<Self, sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                email TEXT PRIMARY KEY NOT NULL CHECK(email <> ''),
                username TEXT NOT NULL CHECK(username <> ''),
                public_key TEXT NOT NULL CHECK(public_key <> '')
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl UserRepo for SqliteUserRepo {
    async fn exists(&self, email: &str) -> Result<bool, UserRepoError> {
        let found: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE email = ?)")
                .bind(email)
                .fetch_one(&self.pool)
                .await?;
        Ok(found)
    }

    async fn add_user(&self, user: User) -> Result<(), UserRepoError> {
        let result = sqlx::query("INSERT INTO users (email, username, public_key) VALUES (?, ?, ?)")
            .bind(&user.email)
            .bind(&user.username)
            .bind(&user.public_key)
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) => {
                if err
                    .as_database_error()
                    .is_some_and(|db_err| db_err.is_unique_violation())
                {
                    return Err(UserRepoError::UserExists);
                }
                Err(err.into())
            }
        }
    }
}
