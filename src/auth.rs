/// Session-cookie login for the panel.
///
/// A successful login issues a random token kept in memory; every gated route
/// checks the `botpanel_session` cookie against it. Sessions do not survive a
/// restart of the panel.
use crate::config::AuthConfig;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Redirect, Response};
use axum::Json;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

pub const SESSION_COOKIE: &str = "botpanel_session";

const TOKEN_LEN: usize = 32;

/// Configured operator credentials.
#[derive(Debug, Clone)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    pub fn from_config(config: &AuthConfig) -> Self {
        Self {
            username: config.username.clone(),
            password: config.password.clone(),
        }
    }

    pub fn matches(&self, username: &str, password: &str) -> bool {
        self.username == username && self.password == password
    }
}

/// Live session tokens, mapped to the user that logged in.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<String, String>>,
}

impl SessionStore {
    fn sessions(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Issue a new token for `username`.
    pub fn create(&self, username: &str) -> String {
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(TOKEN_LEN)
            .map(char::from)
            .collect();
        self.sessions()
            .insert(token.clone(), username.to_string());
        token
    }

    pub fn username(&self, token: &str) -> Option<String> {
        self.sessions().get(token).cloned()
    }

    /// Drop `token`, returning the user it belonged to.
    pub fn revoke(&self, token: &str) -> Option<String> {
        self.sessions().remove(token)
    }

    /// User behind the session cookie in `headers`, if the session is live.
    pub fn user_for(&self, headers: &HeaderMap) -> Option<String> {
        session_token(headers).and_then(|token| self.username(&token))
    }
}

/// Value of the session cookie, if the request carries one.
pub fn session_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.to_string())
}

/// `Set-Cookie` value installing `token`.
pub fn session_cookie(token: &str) -> String {
    format!("{SESSION_COOKIE}={token}; Path=/; HttpOnly; SameSite=Lax")
}

/// `Set-Cookie` value removing the session cookie.
pub fn expired_session_cookie() -> String {
    format!("{SESSION_COOKIE}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0")
}

/// Login gate: API routes answer 401, pages redirect to the login form.
pub async fn require_login(
    State(sessions): State<Arc<SessionStore>>,
    request: Request,
    next: Next,
) -> Response {
    if sessions.user_for(request.headers()).is_some() {
        return next.run(request).await;
    }

    if request.uri().path().starts_with("/api/") {
        (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"error": "login required"})),
        )
            .into_response()
    } else {
        Redirect::to("/login").into_response()
    }
}
