use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::auth::repo_types::{NewUser, User};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("email already exists")]
    DuplicateEmail,
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("user store is unavailable")]
    Poisoned,
}

/// Access to the `users` table. Handlers receive it through `AppState`.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;
    async fn find_by_id(&self, id: i64) -> Result<Option<User>, StoreError>;
    /// Fails with `StoreError::DuplicateEmail` when the email is taken.
    async fn create(&self, new_user: NewUser<'_>) -> Result<User, StoreError>;
}

#[derive(Clone)]
pub struct PgUserStore {
    db: PgPool,
}

impl PgUserStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    /// Find a user by email.
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, email, password_hash, full_name, created_at
            FROM users
            WHERE email = $1
            "#,
        )
        .bind(email)
        .fetch_optional(&self.db)
        .await?;
        Ok(user)
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, email, password_hash, full_name, created_at
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        Ok(user)
    }

    async fn create(&self, new_user: NewUser<'_>) -> Result<User, StoreError> {
        let user = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (email, password_hash, full_name)
            VALUES ($1, $2, $3)
            RETURNING id, email, password_hash, full_name, created_at
            "#,
        )
        .bind(new_user.email)
        .bind(new_user.password_hash)
        .bind(new_user.full_name)
        .fetch_one(&self.db)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                StoreError::DuplicateEmail
            }
            other => StoreError::Database(other),
        })?;
        Ok(user)
    }
}

/// Process-local store used by tests and local runs without Postgres.
#[derive(Default)]
pub struct MemoryUserStore {
    inner: Mutex<MemoryTable>,
}

#[derive(Default)]
struct MemoryTable {
    next_id: i64,
    rows: HashMap<i64, User>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops a row. The service itself never deletes users; this exists so
    /// callers can simulate out-of-band removal.
    pub fn remove(&self, id: i64) -> Result<Option<User>, StoreError> {
        let mut table = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(table.rows.remove(&id))
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let table = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(table.rows.values().find(|u| u.email == email).cloned())
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<User>, StoreError> {
        let table = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(table.rows.get(&id).cloned())
    }

    async fn create(&self, new_user: NewUser<'_>) -> Result<User, StoreError> {
        let mut table = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        if table.rows.values().any(|u| u.email == new_user.email) {
            return Err(StoreError::DuplicateEmail);
        }
        table.next_id += 1;
        let user = User {
            id: table.next_id,
            email: new_user.email.to_string(),
            password_hash: new_user.password_hash.map(str::to_string),
            full_name: new_user.full_name.map(str::to_string),
            created_at: OffsetDateTime::now_utc(),
        };
        table.rows.insert(user.id, user.clone());
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_user<'a>(email: &'a str, hash: Option<&'a str>) -> NewUser<'a> {
        NewUser {
            email,
            password_hash: hash,
            full_name: None,
        }
    }

    #[tokio::test]
    async fn memory_store_assigns_increasing_ids() {
        let store = MemoryUserStore::new();
        let a = store.create(new_user("a@b.com", Some("h"))).await.unwrap();
        let b = store.create(new_user("c@d.com", None)).await.unwrap();
        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);
        assert!(b.password_hash.is_none());
    }

    #[tokio::test]
    async fn memory_store_rejects_duplicate_email() {
        let store = MemoryUserStore::new();
        store.create(new_user("a@b.com", Some("h"))).await.unwrap();
        let err = store.create(new_user("a@b.com", None)).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateEmail));
    }

    #[tokio::test]
    async fn memory_store_lookups() {
        let store = MemoryUserStore::new();
        let user = store.create(new_user("a@b.com", None)).await.unwrap();
        let by_email = store.find_by_email("a@b.com").await.unwrap().unwrap();
        assert_eq!(by_email.id, user.id);
        assert!(store.find_by_email("x@y.com").await.unwrap().is_none());

        store.remove(user.id).unwrap();
        assert!(store.find_by_id(user.id).await.unwrap().is_none());
    }
}
