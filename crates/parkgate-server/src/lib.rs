pub mod approval;
pub mod commands;
pub mod dispatch;
pub mod error;
pub mod heartbeat;
pub mod scanner;
pub mod store;
pub mod sync;
pub mod token;
pub mod wecom;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{Local, NaiveDateTime, Utc};
use parkgate_config::Config;
use parkgate_contracts::{ApiReply, CarParkSnapshot, ReviewUpdate};
use parkgate_kernel::MsgCrypt;
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::commands::RecordsCache;
use crate::dispatch::{CallbackQuery, ACK};
use crate::error::GatewayError;
use crate::heartbeat::Watchdog;
use crate::scanner::next_run;
use crate::store::SqliteStore;
use crate::sync::AgentQuery;
use crate::wecom::WeComClient;

pub(crate) fn local_now() -> NaiveDateTime {
    Local::now().naive_local()
}

pub async fn serve(cfg: Config) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let state = AppState::new(cfg)?;
    spawn_background(&state);
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    info!(%addr, "gateway listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| format!("serve failed: {e}"))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

/// Routes only; background loops are started by [`spawn_background`].
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/qy", get(qy_verify).post(qy_message))
        .route("/review", get(review_list).post(review_update))
        .route("/car_park", get(car_park_get).post(car_park_push))
        .route("/client_alive", get(client_alive).post(client_alive))
        .with_state(state)
}

#[derive(Clone)]
pub struct AppState {
    pub(crate) cfg: Arc<Config>,
    pub(crate) store: Arc<Mutex<SqliteStore>>,
    pub(crate) crypt: Arc<MsgCrypt>,
    pub(crate) wecom: Arc<WeComClient>,
    pub(crate) watchdog: Arc<Watchdog>,
    pub(crate) records: Arc<RecordsCache>,
}

impl AppState {
    pub fn new(cfg: Config) -> Result<Self, String> {
        let store = if cfg.store.kind == "sqlite" {
            let sqlite_path = cfg
                .store
                .sqlite_path
                .clone()
                .ok_or_else(|| "store.sqlite_path is required for sqlite store".to_string())?;
            SqliteStore::open(&sqlite_path)
        } else {
            SqliteStore::open_in_memory()
        }
        .map_err(|e| e.to_string())?;
        let crypt = MsgCrypt::new(&cfg.wecom.encoding_aes_key, &cfg.wecom.corp_id)
            .map_err(|e| e.to_string())?;
        let wecom = WeComClient::new(&cfg.wecom).map_err(|e| e.to_string())?;
        let watchdog = Watchdog::new(
            cfg.heartbeat.timeout_secs,
            cfg.heartbeat.state_path.as_ref().map(PathBuf::from),
            Utc::now(),
        );
        Ok(Self {
            records: Arc::new(RecordsCache::new(cfg.commands.records_ttl_secs)),
            watchdog: Arc::new(watchdog),
            wecom: Arc::new(wecom),
            crypt: Arc::new(crypt),
            store: Arc::new(Mutex::new(store)),
            cfg: Arc::new(cfg),
        })
    }
}

/// Starts the heartbeat watchdog and, when enabled, the daily expiry scanner.
pub fn spawn_background(state: &AppState) {
    tokio::spawn(heartbeat_loop(state.clone()));
    if state.cfg.scanner.enabled {
        tokio::spawn(scanner_loop(state.clone()));
    }
}

async fn heartbeat_loop(state: AppState) {
    let period = Duration::from_secs(state.cfg.heartbeat.check_interval_secs.max(1));
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        state.check_heartbeat(Utc::now()).await;
    }
}

async fn scanner_loop(state: AppState) {
    let Some((hour, minute)) = state.cfg.scanner.run_at_hm() else {
        warn!(run_at = %state.cfg.scanner.run_at, "expiry scanner disabled: bad run_at");
        return;
    };
    loop {
        let now = local_now();
        let wait = (next_run(now, hour, minute) - now)
            .to_std()
            .unwrap_or(Duration::from_secs(60));
        sleep(wait).await;
        if let Err(e) = state.run_expiry_scan(local_now()).await {
            warn!(error = %e, "expiry scan failed");
        }
    }
}

fn reply<T: Serialize>(result: Result<T, GatewayError>) -> Response {
    match result {
        Ok(data) => (StatusCode::OK, Json(ApiReply::ok(data))).into_response(),
        Err(e) => reject(e),
    }
}

fn reject(e: GatewayError) -> Response {
    if matches!(e, GatewayError::Storage(_)) {
        warn!(error = %e, "agent request failed");
    }
    (e.status(), Json(ApiReply::<()>::message(e.code(), e.to_string()))).into_response()
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, GatewayError> {
    body.map(|Json(v)| v)
        .map_err(|e| GatewayError::Invalid(e.body_text()))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn qy_verify(State(state): State<AppState>, Query(q): Query<CallbackQuery>) -> Response {
    match state.verify_url(&q) {
        Ok(echo) => (StatusCode::OK, echo).into_response(),
        Err(e) => {
            warn!(error = %e, "callback url verification failed");
            (StatusCode::FORBIDDEN, e.to_string()).into_response()
        }
    }
}

async fn qy_message(
    State(state): State<AppState>,
    Query(q): Query<CallbackQuery>,
    body: Bytes,
) -> Response {
    match state.handle_inbound(&q, &body).await {
        Some(xml) => ([(header::CONTENT_TYPE, "application/xml; charset=utf-8")], xml).into_response(),
        None => (StatusCode::OK, ACK).into_response(),
    }
}

async fn review_list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(q): Query<AgentQuery>,
) -> Response {
    if let Err(e) = state.authorize_agent(&headers, q.api_key.as_deref()) {
        return reject(e);
    }
    reply(state.review_list().await)
}

async fn review_update(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(q): Query<AgentQuery>,
    body: Result<Json<ReviewUpdate>, JsonRejection>,
) -> Response {
    if let Err(e) = state.authorize_agent(&headers, q.api_key.as_deref()) {
        return reject(e);
    }
    let update = match json_body(body) {
        Ok(v) => v,
        Err(e) => return reject(e),
    };
    reply(state.review_update(update).await)
}

async fn car_park_get(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(q): Query<AgentQuery>,
) -> Response {
    if let Err(e) = state.authorize_agent(&headers, q.api_key.as_deref()) {
        return reject(e);
    }
    if q.car_number.is_some() || q.owner_name.is_some() {
        reply(state.car_park_lookup(&q.car_park()).await)
    } else {
        reply(state.car_park_dump().await)
    }
}

async fn car_park_push(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(q): Query<AgentQuery>,
    body: Result<Json<CarParkSnapshot>, JsonRejection>,
) -> Response {
    if let Err(e) = state.authorize_agent(&headers, q.api_key.as_deref()) {
        return reject(e);
    }
    let snapshot = match json_body(body) {
        Ok(v) => v,
        Err(e) => return reject(e),
    };
    reply(state.car_park_push(snapshot).await)
}

async fn client_alive(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(q): Query<AgentQuery>,
) -> Response {
    if let Err(e) = state.authorize_agent(&headers, q.api_key.as_deref()) {
        return reject(e);
    }
    state.client_alive(&q.client_alive()).await;
    reply(Ok(json!({ "received": true })))
}
