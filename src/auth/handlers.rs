use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use tracing::{error, info, instrument, warn};

use crate::{
    auth::{
        dto::{
            LoginRequest, MessageResponse, OAuthCallbackQuery, ProfileResponse,
            ProtectedResponse, RegisterRequest, TokenResponse,
        },
        extractors::{AuthUser, Credentials},
        services,
    },
    error::{ApiResult, ErrorBody},
    state::AppState,
};

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/logout", post(logout))
        .route("/auth/google", get(google_redirect))
        .route("/auth/google/callback", get(google_callback))
}

pub fn user_routes() -> Router<AppState> {
    Router::new()
        .route("/protected", get(protected))
        .route("/user", get(get_user))
}

#[instrument(skip(state, payload))]
pub async fn register(
    State(state): State<AppState>,
    Credentials(payload): Credentials<RegisterRequest>,
) -> ApiResult<Json<MessageResponse>> {
    let message = services::register(&state, payload).await?;
    Ok(Json(MessageResponse { message }))
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    Credentials(payload): Credentials<LoginRequest>,
) -> ApiResult<Json<TokenResponse>> {
    let token = services::login(&state, payload).await?;
    Ok(Json(TokenResponse { token }))
}

/// Tokens are stateless; the client discards its copy.
pub async fn logout() -> Json<MessageResponse> {
    Json(MessageResponse {
        message: "Logged out successfully".into(),
    })
}

fn oauth_unavailable() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ErrorBody {
            error: "Google login is not configured".into(),
        }),
    )
        .into_response()
}

pub async fn google_redirect(State(state): State<AppState>) -> Response {
    let Some(provider) = &state.identity else {
        return oauth_unavailable();
    };
    match provider.authorize_url() {
        Ok(url) => Redirect::temporary(&url).into_response(),
        Err(e) => {
            error!(error = %e, "build authorize url failed");
            oauth_unavailable()
        }
    }
}

#[instrument(skip(state, params))]
pub async fn google_callback(
    State(state): State<AppState>,
    Query(params): Query<OAuthCallbackQuery>,
) -> Response {
    let Some(provider) = state.identity.clone() else {
        return oauth_unavailable();
    };
    let failure = Redirect::temporary(&state.config.oauth_failure_url());

    if let Some(reason) = params.error.as_deref() {
        warn!(reason, "provider reported failure");
        return failure.into_response();
    }
    let Some(code) = params.code.as_deref() else {
        warn!("callback without code");
        return failure.into_response();
    };

    let profile = match provider.exchange_code(code).await {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "oauth code exchange failed");
            return failure.into_response();
        }
    };

    let (user, token) = match services::oauth_login(&state, &profile).await {
        Ok(resolved) => resolved,
        Err(e) => return e.into_response(),
    };

    let target = reqwest::Url::parse_with_params(
        &format!("{}/google-success", state.config.frontend_url),
        &[("token", token.as_str()), ("email", user.email.as_str())],
    );
    match target {
        Ok(url) => {
            info!(user_id = user.id, "oauth callback success");
            Redirect::temporary(url.as_str()).into_response()
        }
        Err(e) => {
            error!(error = %e, frontend = %state.config.frontend_url, "invalid frontend url");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody {
                    error: "Authentication failed".into(),
                }),
            )
                .into_response()
        }
    }
}

#[instrument(skip(claims), fields(user_id = claims.id))]
pub async fn protected(AuthUser(claims): AuthUser) -> Json<ProtectedResponse> {
    Json(ProtectedResponse {
        message: "Protected data".into(),
        user: claims,
    })
}

#[instrument(skip(state, claims), fields(user_id = claims.id))]
pub async fn get_user(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
) -> ApiResult<Json<ProfileResponse>> {
    let user = services::load_profile(&state, claims.id).await?;
    Ok(Json(ProfileResponse { user }))
}
