use std::sync::Arc;

use anyhow::Context;
use sqlx::{postgres::PgPoolOptions, PgPool};

use crate::auth::oauth::{GoogleProvider, IdentityProvider};
use crate::auth::repo::{PgUserStore, UserStore};
use crate::config::AppConfig;

#[derive(Clone)]
pub struct AppState {
    pub users: Arc<dyn UserStore>,
    pub config: Arc<AppConfig>,
    /// `None` when Google OAuth is not configured.
    pub identity: Option<Arc<dyn IdentityProvider>>,
}

impl AppState {
    /// Connects to Postgres and wires the Google provider when configured.
    /// Returns the pool too so the caller can run migrations.
    pub async fn init(config: AppConfig) -> anyhow::Result<(Self, PgPool)> {
        let db = PgPoolOptions::new()
            .max_connections(config.db_max_connections)
            .connect(&config.database_url)
            .await
            .context("connect to database")?;

        let identity = config
            .google
            .clone()
            .map(|g| Arc::new(GoogleProvider::new(g)) as Arc<dyn IdentityProvider>);
        if identity.is_none() {
            tracing::warn!("GOOGLE_CLIENT_ID/SECRET/REDIRECT_URI not set; Google login disabled");
        }

        let state = Self {
            users: Arc::new(PgUserStore::new(db.clone())),
            config: Arc::new(config),
            identity,
        };
        Ok((state, db))
    }

    pub fn from_parts(
        users: Arc<dyn UserStore>,
        config: Arc<AppConfig>,
        identity: Option<Arc<dyn IdentityProvider>>,
    ) -> Self {
        Self {
            users,
            config,
            identity,
        }
    }
}
