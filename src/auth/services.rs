use axum::extract::FromRef;
use tracing::{info, warn};

use crate::{
    auth::{
        claims::Claims,
        dto::{LoginRequest, Profile, RegisterRequest},
        jwt::JwtKeys,
        oauth::ProviderProfile,
        password::{hash_password, verify_password},
        repo::{StoreError, UserStore},
        repo_types::{NewUser, User},
    },
    error::{ApiError, ApiResult},
    state::AppState,
};

pub(crate) const MISSING_FIELDS: &str = "Email and password required";

fn normalize_email(email: Option<String>) -> Option<String> {
    email
        .map(|e| e.trim().to_lowercase())
        .filter(|e| !e.is_empty())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

/// Creates a password account. Does not log the user in.
pub async fn register(state: &AppState, payload: RegisterRequest) -> ApiResult<String> {
    let (Some(email), Some(password)) = (
        normalize_email(payload.email),
        non_empty(payload.password),
    ) else {
        warn!("register missing email or password");
        return Err(ApiError::Validation(MISSING_FIELDS));
    };
    let full_name = payload.full_name.filter(|n| !n.trim().is_empty());

    let hash = hash_password(&password).map_err(|e| ApiError::internal("Registration failed", e))?;

    let user = state
        .users
        .create(NewUser {
            email: &email,
            password_hash: Some(&hash),
            full_name: full_name.as_deref(),
        })
        .await
        .map_err(|e| match e {
            StoreError::DuplicateEmail => {
                warn!(email = %email, "email already registered");
                ApiError::DuplicateEmail
            }
            other => ApiError::internal("Registration failed", other),
        })?;

    info!(user_id = user.id, email = %user.email, "user registered");
    Ok("User registered successfully".into())
}

/// Checks the password and issues a session token.
pub async fn login(state: &AppState, payload: LoginRequest) -> ApiResult<String> {
    let (Some(email), Some(password)) = (
        normalize_email(payload.email),
        non_empty(payload.password),
    ) else {
        return Err(ApiError::Validation(MISSING_FIELDS));
    };

    let user = state
        .users
        .find_by_email(&email)
        .await
        .map_err(|e| ApiError::internal("Login failed", e))?
        .ok_or_else(|| {
            warn!(email = %email, "login unknown email");
            ApiError::InvalidCredentials
        })?;

    let Some(stored_hash) = user.password_hash.as_deref() else {
        warn!(user_id = user.id, "password login on account without password");
        return Err(ApiError::InvalidCredentials);
    };

    let ok = verify_password(&password, stored_hash)
        .map_err(|e| ApiError::internal("Login failed", e))?;
    if !ok {
        warn!(user_id = user.id, "login invalid password");
        return Err(ApiError::InvalidCredentials);
    }

    // Users have no role column, so the claim is always empty.
    let role: Option<&str> = None;
    let token = JwtKeys::from_ref(state)
        .sign(user.id, &user.email, role)
        .map_err(|e| ApiError::internal("Login failed", e))?;

    info!(user_id = user.id, email = %user.email, "user logged in");
    Ok(token)
}

/// Resolves a provider profile to a local user, creating one without a
/// password on first sight, and issues a session token for it.
pub async fn oauth_login(state: &AppState, profile: &ProviderProfile) -> ApiResult<(User, String)> {
    let email = profile.email.trim().to_lowercase();
    let user = find_or_create_oauth_user(state, &email, profile.display_name.as_deref())
        .await
        .map_err(|e| ApiError::internal("Authentication failed", e))?;

    let token = JwtKeys::from_ref(state)
        .sign(user.id, &user.email, None)
        .map_err(|e| ApiError::internal("Authentication failed", e))?;

    info!(user_id = user.id, email = %user.email, "oauth login");
    Ok((user, token))
}

async fn find_or_create_oauth_user(
    state: &AppState,
    email: &str,
    display_name: Option<&str>,
) -> Result<User, StoreError> {
    if let Some(user) = state.users.find_by_email(email).await? {
        return Ok(user);
    }

    info!(email = %email, "creating user from oauth profile");
    let created = state
        .users
        .create(NewUser {
            email,
            password_hash: None,
            full_name: display_name,
        })
        .await;

    match created {
        Ok(user) => Ok(user),
        // Lost a race with a concurrent first login for the same email.
        Err(StoreError::DuplicateEmail) => state
            .users
            .find_by_email(email)
            .await?
            .ok_or(StoreError::DuplicateEmail),
        Err(e) => Err(e),
    }
}

pub fn verify_token(state: &AppState, token: &str) -> ApiResult<Claims> {
    JwtKeys::from_ref(state).verify(token).map_err(|e| {
        warn!(error = %e, "invalid or expired token");
        ApiError::InvalidToken
    })
}

/// Re-reads the row by id; claims are not trusted for profile fields.
pub async fn load_profile(state: &AppState, user_id: i64) -> ApiResult<Profile> {
    let user = state
        .users
        .find_by_id(user_id)
        .await
        .map_err(|e| ApiError::internal("Failed to load profile", e))?
        .ok_or_else(|| {
            warn!(user_id, "user not found");
            ApiError::UserNotFound
        })?;
    Ok(user.into())
}

pub async fn get_profile(state: &AppState, token: &str) -> ApiResult<Profile> {
    let claims = verify_token(state, token)?;
    load_profile(state, claims.id).await
}

#[cfg(test)]
mod tests {
    use time::{Duration, OffsetDateTime};

    use super::*;
    use crate::state::testing::fake_state;

    fn register_req(email: Option<&str>, password: Option<&str>) -> RegisterRequest {
        RegisterRequest {
            email: email.map(str::to_string),
            password: password.map(str::to_string),
            full_name: Some("Test User".into()),
        }
    }

    fn login_req(email: &str, password: &str) -> LoginRequest {
        LoginRequest {
            email: Some(email.into()),
            password: Some(password.into()),
        }
    }

    fn profile(email: &str) -> ProviderProfile {
        ProviderProfile {
            email: email.into(),
            display_name: Some("Oauth Person".into()),
        }
    }

    #[tokio::test]
    async fn register_twice_is_duplicate() {
        let (state, _) = fake_state();
        register(&state, register_req(Some("a@b.com"), Some("secret1")))
            .await
            .expect("first registration");
        let err = register(&state, register_req(Some("a@b.com"), Some("other")))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::DuplicateEmail));
    }

    #[tokio::test]
    async fn register_requires_email_and_password() {
        let (state, _) = fake_state();
        for req in [
            register_req(None, Some("secret1")),
            register_req(Some("a@b.com"), None),
            register_req(Some(""), Some("secret1")),
            register_req(Some("a@b.com"), Some("")),
        ] {
            let err = register(&state, req).await.unwrap_err();
            assert!(matches!(err, ApiError::Validation(_)));
        }
    }

    #[tokio::test]
    async fn register_stores_hash_not_plaintext() {
        let (state, store) = fake_state();
        register(&state, register_req(Some("a@b.com"), Some("secret1")))
            .await
            .unwrap();
        let user = store.find_by_email("a@b.com").await.unwrap().unwrap();
        let hash = user.password_hash.unwrap();
        assert_ne!(hash, "secret1");
        assert!(hash.starts_with("$argon2"));
        assert_eq!(user.full_name.as_deref(), Some("Test User"));
    }

    #[tokio::test]
    async fn login_failures_are_indistinguishable() {
        let (state, _) = fake_state();
        register(&state, register_req(Some("a@b.com"), Some("secret1")))
            .await
            .unwrap();

        let wrong_password = login(&state, login_req("a@b.com", "nope")).await.unwrap_err();
        let unknown_user = login(&state, login_req("nouser@x.com", "x")).await.unwrap_err();
        assert!(matches!(wrong_password, ApiError::InvalidCredentials));
        assert!(matches!(unknown_user, ApiError::InvalidCredentials));
        assert_eq!(wrong_password.status(), unknown_user.status());
        assert_eq!(wrong_password.to_string(), unknown_user.to_string());
    }

    #[tokio::test]
    async fn login_requires_fields() {
        let (state, _) = fake_state();
        let err = login(&state, LoginRequest::default()).await.unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
    }

    #[tokio::test]
    async fn login_token_verifies_to_same_user() {
        let (state, store) = fake_state();
        register(&state, register_req(Some("a@b.com"), Some("secret1")))
            .await
            .unwrap();
        let token = login(&state, login_req("a@b.com", "secret1")).await.unwrap();

        let stored = store.find_by_email("a@b.com").await.unwrap().unwrap();
        let claims = verify_token(&state, &token).unwrap();
        assert_eq!(claims.id, stored.id);
        assert_eq!(claims.email, "a@b.com");
        assert_eq!(claims.role, None);

        let profile = get_profile(&state, &token).await.unwrap();
        assert_eq!(profile.id, stored.id);
        assert_eq!(profile.email, "a@b.com");
    }

    #[tokio::test]
    async fn expired_token_is_invalid() {
        let (state, _) = fake_state();
        let keys = JwtKeys::from_ref(&state);
        let token = keys
            .sign_at(1, "a@b.com", None, OffsetDateTime::now_utc() - Duration::minutes(90))
            .unwrap();
        assert!(matches!(verify_token(&state, &token), Err(ApiError::InvalidToken)));
        assert!(matches!(
            get_profile(&state, &token).await,
            Err(ApiError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn profile_of_removed_user_is_not_found() {
        let (state, store) = fake_state();
        let (user, token) = oauth_login(&state, &profile("gone@x.com")).await.unwrap();
        store.remove(user.id).unwrap();
        assert!(matches!(
            get_profile(&state, &token).await,
            Err(ApiError::UserNotFound)
        ));
    }

    #[tokio::test]
    async fn oauth_login_reuses_existing_user() {
        let (state, _) = fake_state();
        let (first, _) = oauth_login(&state, &profile("g@x.com")).await.unwrap();
        let (second, _) = oauth_login(&state, &profile("g@x.com")).await.unwrap();
        assert_eq!(first.id, second.id);
        assert!(first.password_hash.is_none());
        assert_eq!(first.full_name.as_deref(), Some("Oauth Person"));
    }

    #[tokio::test]
    async fn oauth_login_adopts_password_account() {
        let (state, _) = fake_state();
        register(&state, register_req(Some("a@b.com"), Some("secret1")))
            .await
            .unwrap();
        let (user, token) = oauth_login(&state, &profile("a@b.com")).await.unwrap();
        let claims = verify_token(&state, &token).unwrap();
        assert_eq!(claims.id, user.id);
        assert!(user.password_hash.is_some());
    }

    #[tokio::test]
    async fn oauth_only_account_cannot_password_login() {
        let (state, _) = fake_state();
        oauth_login(&state, &profile("g@x.com")).await.unwrap();
        let err = login(&state, login_req("g@x.com", "anything")).await.unwrap_err();
        assert!(matches!(err, ApiError::InvalidCredentials));
    }
}
