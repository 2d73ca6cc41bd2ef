/// HTTP surface of the panel: login, dashboard, JSON API and the push channel.
use crate::auth::{self, Credentials, SessionStore};
use crate::config::PanelConfig;
use crate::db::{self, ClearScope};
use crate::notify::{log_action, BroadcastSink, Notification};
use crate::supervisor::{OpError, Supervisor};
use crate::worker::WorkerKind;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tokio_stream::{Stream, StreamExt};
use tower_http::cors::CorsLayer;

const LOGIN_PAGE: &str = include_str!("../assets/login.html");
const DASHBOARD_PAGE: &str = include_str!("../assets/dashboard.html");

const DEFAULT_LEADERBOARD_LIMIT: usize = 100;
const MAX_LEADERBOARD_LIMIT: usize = 1000;

#[derive(Clone)]
pub struct AppState {
    supervisor: Supervisor,
    sink: BroadcastSink,
    sessions: Arc<SessionStore>,
    credentials: Arc<Credentials>,
    db_path: PathBuf,
    shutdown: watch::Receiver<bool>,
}

impl AppState {
    pub fn new(
        config: &PanelConfig,
        supervisor: Supervisor,
        sink: BroadcastSink,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            supervisor,
            sink,
            sessions: Arc::new(SessionStore::default()),
            credentials: Arc::new(Credentials::from_config(&config.auth)),
            db_path: config.db_path(),
            shutdown,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let gated = Router::new()
        .route("/dashboard", get(dashboard))
        .route("/logout", get(logout))
        .route("/api/status", get(api_status))
        .route("/api/stats", get(api_stats))
        .route("/api/leaderboard", get(api_leaderboard))
        .route("/api/bot/{kind}/{action}", post(api_bot_control))
        .route("/api/points/add", post(api_add_points))
        .route("/api/points/clear", post(api_clear_points))
        .route("/api/events", get(api_events))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state.sessions),
            auth::require_login,
        ));

    Router::new()
        .route("/", get(index))
        .route("/login", get(login_page).post(login))
        .route("/api/health", get(health))
        .merge(gated)
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Serve until `shutdown` flips to `true`.
pub async fn run(
    config: &PanelConfig,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let app = router(state);

    let addr = format!("{}:{}", config.server.bind, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!("panel listening on http://{local_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;
    Ok(())
}

type ApiError = (StatusCode, Json<Value>);

fn api_error(status: StatusCode, message: impl std::fmt::Display) -> ApiError {
    (status, Json(json!({ "error": message.to_string() })))
}

fn db_error(e: rusqlite::Error) -> ApiError {
    tracing::error!(error = %e, "points database error");
    api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("database error: {e}"))
}

async fn health() -> Json<Value> {
    Json(json!({"ok": true}))
}

async fn index(State(state): State<AppState>, headers: HeaderMap) -> Redirect {
    if state.sessions.user_for(&headers).is_some() {
        Redirect::to("/dashboard")
    } else {
        Redirect::to("/login")
    }
}

#[derive(Deserialize)]
struct LoginQuery {
    error: Option<String>,
}

async fn login_page(Query(query): Query<LoginQuery>) -> Html<String> {
    let error = if query.error.is_some() {
        r#"<p class="error">Invalid username or password</p>"#
    } else {
        ""
    };
    Html(LOGIN_PAGE.replace("{{error}}", error))
}

#[derive(Deserialize)]
struct LoginForm {
    username: String,
    password: String,
}

async fn login(State(state): State<AppState>, Form(form): Form<LoginForm>) -> Response {
    if !state.credentials.matches(&form.username, &form.password) {
        log_action(&state.sink, &format!("Failed login attempt: {}", form.username));
        return Redirect::to("/login?error=1").into_response();
    }

    let token = state.sessions.create(&form.username);
    log_action(&state.sink, &format!("User {} logged in", form.username));
    (
        [(header::SET_COOKIE, auth::session_cookie(&token))],
        Redirect::to("/dashboard"),
    )
        .into_response()
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let username = auth::session_token(&headers)
        .and_then(|token| state.sessions.revoke(&token))
        .unwrap_or_else(|| "unknown".to_string());
    log_action(&state.sink, &format!("User {username} logged out"));
    (
        [(header::SET_COOKIE, auth::expired_session_cookie())],
        Redirect::to("/login"),
    )
        .into_response()
}

async fn dashboard() -> Html<&'static str> {
    Html(DASHBOARD_PAGE)
}

async fn api_status(State(state): State<AppState>) -> Json<Value> {
    let mut body = serde_json::Map::new();
    for (kind, running) in state.supervisor.current_status().await {
        body.insert(kind.slug().to_string(), Value::Bool(running));
    }
    body.insert(
        "timestamp".to_string(),
        Value::String(chrono::Local::now().to_rfc3339()),
    );
    Json(Value::Object(body))
}

async fn api_stats(State(state): State<AppState>) -> Result<Json<db::PointsStats>, ApiError> {
    let conn = db::open_or_create(&state.db_path).map_err(db_error)?;
    let stats = db::stats(&conn).map_err(db_error)?;
    Ok(Json(stats))
}

#[derive(Deserialize)]
struct LeaderboardQuery {
    limit: Option<usize>,
}

async fn api_leaderboard(
    State(state): State<AppState>,
    Query(query): Query<LeaderboardQuery>,
) -> Result<Json<Vec<db::LeaderboardEntry>>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LEADERBOARD_LIMIT)
        .clamp(1, MAX_LEADERBOARD_LIMIT);
    let conn = db::open_or_create(&state.db_path).map_err(db_error)?;
    let board = db::leaderboard(&conn, limit).map_err(db_error)?;
    Ok(Json(board))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BotAction {
    Start,
    Stop,
    Restart,
}

impl FromStr for BotAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(BotAction::Start),
            "stop" => Ok(BotAction::Stop),
            "restart" => Ok(BotAction::Restart),
            other => Err(format!("invalid action: {other}")),
        }
    }
}

fn op_error_status(e: &OpError) -> StatusCode {
    match e {
        OpError::AlreadyRunning { .. } | OpError::NotRunning { .. } => StatusCode::CONFLICT,
        OpError::ScriptNotFound { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        OpError::Launch { .. } | OpError::TerminateTimeout { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn api_bot_control(
    State(state): State<AppState>,
    Path((kind, action)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let kind: WorkerKind = kind
        .parse()
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e))?;
    let action: BotAction = action
        .parse()
        .map_err(|e: String| api_error(StatusCode::BAD_REQUEST, e))?;

    let supervisor = &state.supervisor;
    let display = supervisor.display_name(kind).to_string();
    let result = match action {
        BotAction::Start => supervisor.start(kind).await.map(|o| {
            json!({"success": true, "message": format!("{display} started"), "pid": o.pid})
        }),
        BotAction::Stop => supervisor.stop(kind).await.map(|o| {
            json!({"success": true, "message": format!("{display} stopped"), "forced": o.forced})
        }),
        BotAction::Restart => supervisor.restart(kind).await.map(|o| {
            json!({"success": true, "message": format!("{display} restarted"), "pid": o.pid})
        }),
    };

    result.map(Json).map_err(|e| {
        (
            op_error_status(&e),
            Json(json!({"success": false, "error": e.to_string(), "code": e.code()})),
        )
    })
}

#[derive(Deserialize)]
struct AddPointsRequest {
    username: Option<String>,
    points: Option<Value>,
}

/// Accept points as a JSON integer or a numeric string, as the form sends.
fn parse_points(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Number(n) => n.as_i64() == Some(0),
        _ => false,
    }
}

async fn api_add_points(
    State(state): State<AppState>,
    Json(req): Json<AddPointsRequest>,
) -> Result<Json<Value>, ApiError> {
    let (username, points) = match (req.username, req.points) {
        (Some(u), Some(p)) if !u.trim().is_empty() && !is_blank(&p) => (u, p),
        _ => return Err(api_error(StatusCode::BAD_REQUEST, "missing required fields")),
    };
    let points = match parse_points(&points) {
        Some(0) | None => {
            return Err(api_error(
                StatusCode::BAD_REQUEST,
                "points must be a non-zero integer",
            ))
        }
        Some(p) => p,
    };

    let conn = db::open_or_create(&state.db_path).map_err(db_error)?;
    let updated = db::add_points(&conn, &username, points).map_err(db_error)?;
    if updated == 0 {
        return Err(api_error(StatusCode::NOT_FOUND, "user does not exist"));
    }

    log_action(&state.sink, &format!("Added {points} points to {username}"));
    Ok(Json(
        json!({"success": true, "message": format!("Added {points} points")}),
    ))
}

#[derive(Deserialize)]
struct ClearPointsRequest {
    #[serde(rename = "type")]
    scope: Option<String>,
}

async fn api_clear_points(
    State(state): State<AppState>,
    Json(req): Json<ClearPointsRequest>,
) -> Result<Json<Value>, ApiError> {
    let scope: ClearScope = req
        .scope
        .as_deref()
        .unwrap_or("all")
        .parse()
        .map_err(|e: String| api_error(StatusCode::BAD_REQUEST, e))?;

    let conn = db::open_or_create(&state.db_path).map_err(db_error)?;
    let affected = db::clear_points(&conn, scope).map_err(db_error)?;

    let who = match scope {
        ClearScope::All => "all users",
        ClearScope::NonFollowers => "non-followers",
    };
    log_action(
        &state.sink,
        &format!("Cleared points of {who} ({affected})"),
    );
    Ok(Json(json!({"success": true, "affected": affected})))
}

enum Push {
    Event(Event),
    Shutdown,
}

fn to_sse(notification: Notification) -> Event {
    Event::default()
        .event(notification.event)
        .data(notification.payload.to_string())
}

/// Server-Sent Events stream of every notification, ending at shutdown.
async fn api_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let connected = Event::default()
        .event("connected")
        .data(json!({"message": "Connected to the control panel"}).to_string());

    let updates = BroadcastStream::new(state.sink.subscribe()).filter_map(|item| match item {
        Ok(notification) => Some(Push::Event(to_sse(notification))),
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            tracing::debug!(skipped, "push subscriber lagged, events dropped");
            None
        }
    });
    let shutdown = WatchStream::new(state.shutdown.clone())
        .filter(|stop| *stop)
        .map(|_| Push::Shutdown);

    let stream = tokio_stream::once(Push::Event(connected))
        .chain(updates.merge(shutdown))
        .map_while(|push| match push {
            Push::Event(event) => Some(Ok(event)),
            Push::Shutdown => None,
        });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
