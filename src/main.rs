// HTTP transport for the prediction market engine: axum routing, JSON
// (de)serialisation, CORS, and the WebSocket feed. Everything that isn't
// routing/parsing glue lives in the library crate.
use axum::{
    extract::{ConnectInfo, Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use axum::extract::ws::{Message, WebSocket};
use chrono;
use futures_util::{sink::SinkExt, stream::StreamExt};
use hmac::{Hmac, Mac};
use moka::future::Cache;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use sqlx::PgPool;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;

use prediction_market_engine::advisor::Advisor;
use prediction_market_engine::config::Config;
use prediction_market_engine::error::{EngineError, EngineResult};
use prediction_market_engine::pricing::Direction;
use prediction_market_engine::reputation::{self, ReputationCache};
use prediction_market_engine::retry::with_retry;
use prediction_market_engine::sanitize;
use prediction_market_engine::{database, market, oracle, trade, user};

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
struct AppState {
    db: PgPool,
    tx: broadcast::Sender<String>,
    cache: Cache<String, String>,
    reputation_cache: ReputationCache,
    advisor: Advisor,
    oracle_cfg: prediction_market_engine::config::OracleConfig,
    ip_hmac_secret: Option<Vec<u8>>,
}

fn broadcast_event(app_state: &AppState, event_type: &str, data: Value) {
    app_state.cache.invalidate_all();
    let msg = json!({
        "type": event_type,
        "data": data,
        "timestamp": chrono::Utc::now(),
    })
    .to_string();
    let _ = app_state.tx.send(msg);
}

fn hash_ip(secret: &[u8], ip: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts a key of any length");
    mac.update(ip.as_bytes());
    mac.finalize()
        .into_bytes()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter("info,prediction_market_engine=debug")
        .init();

    tracing::info!("starting prediction market engine");

    let config = Config::from_env();
    let pool = database::create_pool(&config.database_url).await?;
    database::migrate(&pool).await?;

    let (tx, _rx) = broadcast::channel::<String>(256);
    let cache = Cache::builder()
        .max_capacity(1000)
        .time_to_live(Duration::from_secs(300))
        .time_to_idle(Duration::from_secs(60))
        .build();

    let app_state = AppState {
        db: pool,
        tx,
        cache,
        reputation_cache: reputation::new_cache(),
        advisor: Advisor::new(&config.advisor),
        oracle_cfg: config.oracle.clone(),
        ip_hmac_secret: config.ip_hmac_secret.as_ref().map(|s| s.as_bytes().to_vec()),
    };

    let app = Router::new()
        .route("/auth/initialize", post(initialize_user))
        .route("/auth/user/{id}", get(get_user))
        .route("/auth/users", get(list_users))
        .route("/markets", get(list_markets))
        .route("/markets/submit", post(submit_market))
        .route("/markets/{id}", get(get_market))
        .route("/markets/{id}", delete(delete_market))
        .route("/markets/{id}/bet", post(place_bet))
        .route("/oracles/report", post(submit_oracle_report))
        .route("/oracles/reports/{market_id}", get(list_oracle_reports))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/ws", get(websocket_handler))
        .layer(CorsLayer::permissive())
        .with_state(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

// ---------------------------------------------------------------------
// /auth
// ---------------------------------------------------------------------

#[derive(Deserialize)]
struct InitializeRequest {
    pseudonym: String,
}

async fn initialize_user(
    State(app_state): State<AppState>,
    Json(body): Json<InitializeRequest>,
) -> Result<Response, EngineError> {
    let pseudonym = sanitize::sanitize_pseudonym(&body.pseudonym)
        .ok_or_else(|| EngineError::InvalidInput("pseudonym must be 3-20 alphanumeric/_/- characters".into()))?;

    let outcome = user::initialize(&app_state.db, &pseudonym).await?;
    let status = if outcome.created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(json!({ "user": outcome.user }))).into_response())
}

async fn get_user(State(app_state): State<AppState>, Path(id): Path<i64>) -> EngineResult<Json<Value>> {
    let detail = user::get_detail(&app_state.db, id).await?;
    Ok(Json(json!({ "user": detail })))
}

async fn list_users(State(app_state): State<AppState>) -> EngineResult<Json<Value>> {
    let users = user::top_users(&app_state.db, 20).await?;
    Ok(Json(json!({ "users": users })))
}

// ---------------------------------------------------------------------
// /markets
// ---------------------------------------------------------------------

#[derive(Deserialize, Default)]
struct ListMarketsQuery {
    status: Option<String>,
    category: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn list_markets(
    State(app_state): State<AppState>,
    Query(q): Query<ListMarketsQuery>,
) -> EngineResult<Json<Value>> {
    let limit = q.limit.unwrap_or(20);
    let offset = q.offset.unwrap_or(0);
    if limit <= 0 || offset < 0 {
        return Err(EngineError::InvalidInput("limit must be positive and offset non-negative".into()));
    }

    let markets = market::list(
        &app_state.db,
        market::ListFilter {
            status: q.status,
            category: q.category,
            limit,
            offset,
        },
    )
    .await?;

    Ok(Json(json!({ "markets": markets })))
}

async fn get_market(State(app_state): State<AppState>, Path(id): Path<i64>) -> EngineResult<Json<Value>> {
    let detail = market::get_detail(&app_state.db, id).await?;
    Ok(Json(json!({ "market": detail })))
}

#[derive(Deserialize)]
struct SubmitMarketRequest {
    user_id: i64,
    text: String,
    category: String,
    stake: rust_decimal::Decimal,
}

async fn submit_market(
    State(app_state): State<AppState>,
    Json(body): Json<SubmitMarketRequest>,
) -> Result<Response, EngineError> {
    let text = sanitize::sanitize_text(&body.text);
    if text.is_empty() {
        return Err(EngineError::InvalidInput("text must not be empty".into()));
    }
    let category = sanitize::sanitize_category(&body.category);

    let outcome = market::submit(&app_state.db, &app_state.advisor, body.user_id, text, category, body.stake).await?;
    let created = outcome.market;
    broadcast_event(&app_state, "market_submitted", json!({ "market_id": created.id }));

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "market": created,
            "ai_analysis": {
                "prediction": created.ai_prediction,
                "confidence": created.ai_confidence,
                "duplicate_of": outcome.duplicate_of,
            }
        })),
    )
        .into_response())
}

#[derive(Deserialize)]
struct BetRequest {
    user_id: i64,
    #[serde(rename = "type")]
    direction: String,
    cc_amount: rust_decimal::Decimal,
}

async fn place_bet(
    State(app_state): State<AppState>,
    Path(market_id): Path<i64>,
    Json(body): Json<BetRequest>,
) -> EngineResult<Json<Value>> {
    let direction = Direction::from_str(&body.direction)?;
    let pool = &app_state.db;
    let user_id = body.user_id;
    let cc = body.cc_amount;

    let outcome = with_retry(|| trade::place_bet(pool, user_id, market_id, direction, cc)).await?;

    broadcast_event(
        &app_state,
        "price_update",
        json!({ "market_id": market_id, "new_price": outcome.new_price }),
    );

    Ok(Json(json!({
        "market": outcome.market,
        "position": outcome.position,
        "shares": outcome.shares,
        "new_price": outcome.new_price,
    })))
}

#[derive(Deserialize)]
struct DeleteMarketRequest {
    user_id: i64,
}

async fn delete_market(
    State(app_state): State<AppState>,
    Path(market_id): Path<i64>,
    Json(body): Json<DeleteMarketRequest>,
) -> EngineResult<Json<Value>> {
    let refunds = market::delete(&app_state.db, market_id, body.user_id).await?;
    broadcast_event(&app_state, "market_deleted", json!({ "market_id": market_id }));
    Ok(Json(json!({ "refunds": refunds })))
}

// ---------------------------------------------------------------------
// /oracles
// ---------------------------------------------------------------------

#[derive(Deserialize)]
struct OracleReportRequest {
    oracle_id: i64,
    market_id: i64,
    verdict: bool,
    #[serde(default = "default_evidence")]
    evidence: Value,
    stake: rust_decimal::Decimal,
}

fn default_evidence() -> Value {
    json!([])
}

async fn submit_oracle_report(
    State(app_state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<OracleReportRequest>,
) -> Result<Response, EngineError> {
    let ip_hash = app_state
        .ip_hmac_secret
        .as_ref()
        .map(|secret| hash_ip(secret, &addr.ip().to_string()));

    let outcome = with_retry(|| {
        oracle::submit_report(
            &app_state.db,
            &app_state.reputation_cache,
            &app_state.oracle_cfg,
            body.oracle_id,
            body.market_id,
            body.verdict,
            body.evidence.clone(),
            body.stake,
            ip_hash.clone(),
        )
    })
    .await?;

    if outcome.consensus_triggered {
        broadcast_event(
            &app_state,
            "market_settled",
            json!({ "market_id": body.market_id }),
        );
    }

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "report": outcome.report,
            "consensus_triggered": outcome.consensus_triggered,
        })),
    )
        .into_response())
}

async fn list_oracle_reports(
    State(app_state): State<AppState>,
    Path(market_id): Path<i64>,
) -> EngineResult<Json<Value>> {
    let reports = oracle::reports_for_market(&app_state.db, market_id).await?;
    Ok(Json(json!({ "reports": reports })))
}

// ---------------------------------------------------------------------
// Ambient: health, stats, websocket feed
// ---------------------------------------------------------------------

async fn health(State(app_state): State<AppState>) -> Json<Value> {
    let database_ok = database::is_healthy(&app_state.db).await;
    Json(json!({ "database": database_ok, "ai": app_state.advisor.is_configured() }))
}

async fn stats(State(app_state): State<AppState>) -> EngineResult<Json<Value>> {
    let stats = database::get_stats(&app_state.db).await?;
    Ok(Json(json!(stats)))
}

async fn websocket_handler(ws: WebSocketUpgrade, State(app_state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| websocket_connection(socket, app_state))
}

async fn websocket_connection(socket: WebSocket, app_state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx = app_state.tx.subscribe();

    let send_task = tokio::spawn(async move {
        while let Ok(msg) = rx.recv().await {
            if sender.send(Message::Text(msg)).await.is_err() {
                break;
            }
        }
    });

    let recv_task = tokio::spawn(async move {
        while let Some(Ok(Message::Text(_))) = receiver.next().await {
            // This feed is broadcast-only; client messages are ignored.
        }
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }
}
