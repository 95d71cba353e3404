//! Session client for the single-page app: talks to the auth API, keeps the
//! issued token in persistent storage and publishes who is signed in.
//!
//! Restore trusts whatever is in storage by default. An expired or tampered
//! token therefore looks signed in until the first API call fails with 401.
//! `RestoreMode::VerifyWithServer` checks the token with `GET /api/user` first.

pub mod storage;

use std::sync::Arc;

use reqwest::{RequestBuilder, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::auth::dto::{LoginRequest, Profile, ProfileResponse, RegisterRequest};
pub use storage::{FileStorage, MemoryStorage, SessionStorage};

pub const TOKEN_KEY: &str = "auth_token";
pub const EMAIL_KEY: &str = "auth_email";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentUser {
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub user: Option<CurrentUser>,
    pub loading: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestoreMode {
    /// Adopt stored token and email without asking the server.
    #[default]
    TrustStored,
    /// Confirm the stored token with the server; clear it on 401/404.
    VerifyWithServer,
}

/// What the app should render for the current session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum View {
    Loading,
    Landing,
    Dashboard,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Error string reported by the server, passed through verbatim.
    #[error("{message}")]
    Server { status: StatusCode, message: String },
    /// The request never produced a usable reply.
    #[error("{0}")]
    Network(&'static str),
    #[error("Not signed in")]
    NotSignedIn,
    #[error("Redirect is missing token or email")]
    IncompleteRedirect,
}

#[derive(Debug, Default, Deserialize)]
struct Reply {
    message: Option<String>,
    token: Option<String>,
    error: Option<String>,
}

pub struct SessionClient {
    base_url: String,
    http: reqwest::Client,
    storage: Arc<dyn SessionStorage>,
    state: watch::Sender<SessionState>,
}

/// Clears the loading flag when dropped, whichever way the call exits.
struct Loading<'a>(&'a watch::Sender<SessionState>);

impl Drop for Loading<'_> {
    fn drop(&mut self) {
        self.0.send_modify(|s| s.loading = false);
    }
}

impl SessionClient {
    pub fn new(base_url: impl Into<String>, storage: Arc<dyn SessionStorage>) -> Self {
        Self::with_http(base_url, storage, reqwest::Client::new())
    }

    pub fn with_http(
        base_url: impl Into<String>,
        storage: Arc<dyn SessionStorage>,
        http: reqwest::Client,
    ) -> Self {
        let (state, _) = watch::channel(SessionState {
            user: None,
            loading: true,
        });
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            storage,
            state,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn current_user(&self) -> Option<CurrentUser> {
        self.state.borrow().user.clone()
    }

    pub fn view(&self) -> View {
        let state = self.state.borrow();
        match (&state.user, state.loading) {
            (_, true) => View::Loading,
            (Some(_), false) => View::Dashboard,
            (None, false) => View::Landing,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn begin_loading(&self) -> Loading<'_> {
        self.state.send_modify(|s| s.loading = true);
        Loading(&self.state)
    }

    fn set_user(&self, user: Option<CurrentUser>) {
        self.state.send_modify(|s| s.user = user);
    }

    fn persist(&self, token: &str, email: &str) {
        self.storage.set(TOKEN_KEY, token);
        self.storage.set(EMAIL_KEY, email);
    }

    fn clear_storage(&self) {
        self.storage.remove(TOKEN_KEY);
        self.storage.remove(EMAIL_KEY);
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        network_error: &'static str,
    ) -> Result<T, ClientError> {
        let resp = request.send().await.map_err(|e| {
            warn!(error = %e, "request failed");
            ClientError::Network(network_error)
        })?;
        let status = resp.status();
        let bytes = resp.bytes().await.map_err(|e| {
            warn!(error = %e, "read response failed");
            ClientError::Network(network_error)
        })?;

        if !status.is_success() {
            let reply: Reply = serde_json::from_slice(&bytes).unwrap_or_default();
            let message = reply.error.ok_or(ClientError::Network(network_error))?;
            return Err(ClientError::Server { status, message });
        }
        serde_json::from_slice(&bytes).map_err(|e| {
            warn!(error = %e, "unexpected response body");
            ClientError::Network(network_error)
        })
    }

    /// Reads the persisted session and publishes it. Always clears `loading`.
    pub async fn restore(&self, mode: RestoreMode) -> Option<CurrentUser> {
        let _loading = self.begin_loading();
        let stored = match (self.storage.get(TOKEN_KEY), self.storage.get(EMAIL_KEY)) {
            (Some(token), Some(email)) => Some((token, email)),
            _ => None,
        };

        let user = match (stored, mode) {
            (None, _) => None,
            (Some((_, email)), RestoreMode::TrustStored) => Some(CurrentUser { email }),
            (Some((token, email)), RestoreMode::VerifyWithServer) => {
                match self.profile_with(&token).await {
                    Ok(_) => Some(CurrentUser { email }),
                    Err(ClientError::Server { status, .. })
                        if status == StatusCode::UNAUTHORIZED
                            || status == StatusCode::NOT_FOUND =>
                    {
                        debug!(%status, "stored session rejected by server");
                        self.clear_storage();
                        None
                    }
                    Err(e) => {
                        warn!(error = %e, "could not verify stored session; trusting it");
                        Some(CurrentUser { email })
                    }
                }
            }
        };

        self.set_user(user.clone());
        user
    }

    /// Creates an account. Does not sign in.
    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        full_name: Option<&str>,
    ) -> Result<String, ClientError> {
        let _loading = self.begin_loading();
        let body = RegisterRequest {
            email: Some(email.to_string()),
            password: Some(password.to_string()),
            full_name: full_name.map(str::to_string),
        };
        let reply: Reply = self
            .send(
                self.http.post(self.url("/api/register")).json(&body),
                "Registration failed",
            )
            .await?;
        reply.message.ok_or(ClientError::Network("Registration failed"))
    }

    /// Signs in with a password, persisting the token on success.
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<String, ClientError> {
        let _loading = self.begin_loading();
        let body = LoginRequest {
            email: Some(email.to_string()),
            password: Some(password.to_string()),
        };
        let reply: Reply = self
            .send(self.http.post(self.url("/api/login")).json(&body), "Login failed")
            .await?;
        let token = reply.token.ok_or(ClientError::Network("Login failed"))?;

        self.persist(&token, email);
        self.set_user(Some(CurrentUser {
            email: email.to_string(),
        }));
        Ok(token)
    }

    /// Adopts a token handed over by the OAuth redirect.
    pub fn login_with_token(&self, token: &str, email: &str) {
        self.persist(token, email);
        self.set_user(Some(CurrentUser {
            email: email.to_string(),
        }));
    }

    /// Pulls `token` and `email` out of the `/google-success` landing URL.
    pub fn adopt_redirect(&self, landing_url: &str) -> Result<CurrentUser, ClientError> {
        let url = reqwest::Url::parse(landing_url).map_err(|_| ClientError::IncompleteRedirect)?;
        let mut token = None;
        let mut email = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "token" => token = Some(value.into_owned()),
                "email" => email = Some(value.into_owned()),
                _ => {}
            }
        }
        match (token, email) {
            (Some(t), Some(e)) if !t.is_empty() && !e.is_empty() => {
                self.login_with_token(&t, &e);
                Ok(CurrentUser { email: e })
            }
            _ => Err(ClientError::IncompleteRedirect),
        }
    }

    /// Drops the local session and tells the server, ignoring its answer.
    pub async fn sign_out(&self) {
        let _loading = self.begin_loading();
        self.clear_storage();
        if let Err(e) = self.http.post(self.url("/api/logout")).send().await {
            debug!(error = %e, "logout notification failed");
        }
        self.set_user(None);
    }

    pub async fn fetch_profile(&self) -> Result<Profile, ClientError> {
        let token = self.storage.get(TOKEN_KEY).ok_or(ClientError::NotSignedIn)?;
        self.profile_with(&token).await
    }

    async fn profile_with(&self, token: &str) -> Result<Profile, ClientError> {
        let reply: ProfileResponse = self
            .send(
                self.http.get(self.url("/api/user")).bearer_auth(token),
                "Failed to load profile",
            )
            .await?;
        Ok(reply.user)
    }
}
