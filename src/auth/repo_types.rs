use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;

/// User record in the database.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: i64,                          // server-assigned ID
    pub email: String,                    // unique identity key
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,    // Argon2 hash; absent for OAuth-only accounts
    pub full_name: Option<String>,        // display name
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,       // creation timestamp
}

/// Fields supplied when inserting a user.
#[derive(Debug, Clone, Copy)]
pub struct NewUser<'a> {
    pub email: &'a str,
    pub password_hash: Option<&'a str>,
    pub full_name: Option<&'a str>,
}
