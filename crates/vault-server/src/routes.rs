//! HTTP API.

use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};
use vault_coordination::bridge::{
    build_council_context, BridgeConfig, BridgeState, CouncilOutcome, TriggerSource,
};
use vault_coordination::chatroom::{
    ChatMessage, ConsensusReading, ConsensusSnapshot, HistoryStatus, HistoryView, Phase, Sentiment,
};
use vault_coordination::council::DetailedConsensus;
use vault_coordination::now_ms;
use vault_coordination::trading::{should_execute, PortfolioMetrics, Trade};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use crate::stream::chatroom_stream;

/// Build the API router.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        // Chatroom
        .route("/api/chatroom/stream", get(chatroom_stream))
        .route("/api/chatroom/history", get(chat_history))
        .route("/api/chatroom/consensus-snapshots", get(consensus_snapshots))
        .route("/api/chatroom/summarize", get(summarize_health).post(summarize))
        // Maintenance
        .route(
            "/api/cron/cleanup-rolling-history",
            get(cleanup_status).post(run_cleanup),
        )
        // Council and trading
        .route("/api/council/evaluate", post(evaluate_council))
        .route("/api/bridge/state", get(bridge_state))
        .route("/api/trading/trades", get(list_trades))
        .route("/api/trading/trades/:id/close", post(close_trade))
        .route("/api/trading/execute", post(execute_trade))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

// --- Chatroom history ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    #[serde(default = "default_limit_messages")]
    limit_messages: usize,
    #[serde(default = "default_limit")]
    limit_snapshots: usize,
}

fn default_limit_messages() -> usize {
    50
}

fn default_limit() -> usize {
    10
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    #[serde(flatten)]
    view: HistoryView,
    timestamp: i64,
}

async fn chat_history(
    State(app): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<HistoryResponse>> {
    let now = now_ms();
    let view = app
        .history
        .history_with_snapshots(query.limit_messages, query.limit_snapshots, now)
        .await?;
    Ok(Json(HistoryResponse {
        view,
        timestamp: now,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotQuery {
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    include_status: bool,
}

#[derive(Debug, Serialize)]
pub struct SnapshotsResponse {
    snapshots: Vec<ConsensusSnapshot>,
    total: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<HistoryStatus>,
}

async fn consensus_snapshots(
    State(app): State<AppState>,
    Query(query): Query<SnapshotQuery>,
) -> ApiResult<Json<SnapshotsResponse>> {
    let mut snapshots = app.store.snapshots().await?;
    snapshots.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    let total = snapshots.len();
    snapshots.truncate(query.limit);

    let status = if query.include_status {
        Some(app.history.status(now_ms()).await?)
    } else {
        None
    };
    Ok(Json(SnapshotsResponse {
        snapshots,
        total,
        status,
    }))
}

// --- Missed-conversation summary ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummarizeRequest {
    #[serde(default)]
    messages: Vec<ChatMessage>,
    last_visit_timestamp: Option<i64>,
    current_phase: Option<Phase>,
    current_consensus: Option<ConsensusReading>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SummarizeResponse {
    summary: String,
    message_count: usize,
    generated_at: i64,
}

async fn summarize_health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn summarize(
    State(app): State<AppState>,
    Json(req): Json<SummarizeRequest>,
) -> ApiResult<Json<SummarizeResponse>> {
    if req.messages.is_empty() {
        return Err(ApiError::BadRequest(
            "No messages provided for summarization".to_string(),
        ));
    }
    let last_visit = match req.last_visit_timestamp {
        Some(ts) if ts > 0 => ts,
        _ => return Err(ApiError::BadRequest("Invalid lastVisitTimestamp".to_string())),
    };

    let summary = app
        .engine
        .summarize_missed(&req.messages, last_visit, req.current_phase, req.current_consensus)
        .await?;
    let message_count = req
        .messages
        .iter()
        .filter(|m| m.timestamp > last_visit)
        .count();
    info!(missed = message_count, "missed-conversation summary generated");

    Ok(Json(SummarizeResponse {
        summary,
        message_count,
        generated_at: now_ms(),
    }))
}

// --- Cron ---

/// Bearer check for the cron endpoint; open when no secret is configured.
pub fn authorize_cron(secret: Option<&str>, headers: &HeaderMap) -> ApiResult<()> {
    let Some(secret) = secret else {
        return Ok(());
    };
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::Unauthorized("Missing or invalid authorization header".to_string()))?;
    if token != secret {
        return Err(ApiError::Forbidden("Invalid cron secret".to_string()));
    }
    Ok(())
}

async fn cleanup_status(State(app): State<AppState>) -> ApiResult<Json<Value>> {
    let status = app.history.status(now_ms()).await?;
    Ok(Json(json!({
        "success": true,
        "timestamp": now_ms(),
        "message": format!(
            "Rolling history status: {} messages in window, {} snapshots",
            status.rolling_messages, status.snapshot_count
        ),
        "status": status,
    })))
}

async fn run_cleanup(State(app): State<AppState>, headers: HeaderMap) -> ApiResult<Json<Value>> {
    authorize_cron(app.config.cron_secret.as_deref(), &headers)?;

    let now = now_ms();
    let report = app.history.cleanup(now).await?;
    let status = app.history.status(now).await?;
    let message = if report.removed > 0 {
        format!(
            "Removed {} old messages, {} remain in rolling window",
            report.removed, report.remaining
        )
    } else {
        "No messages to clean up".to_string()
    };
    debug!(removed = report.removed, "cron cleanup executed");

    Ok(Json(json!({
        "success": true,
        "timestamp": now,
        "cleanupResult": report,
        "status": status,
        "message": message,
    })))
}

// --- Council ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChatroomContext {
    direction: Sentiment,
    strength: u8,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateRequest {
    asset: Option<String>,
    chatroom_context: Option<ChatroomContext>,
    triggered_by: Option<TriggerSource>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateMetadata {
    total_time_ms: u64,
    model_count: usize,
    success_count: usize,
    threshold: u8,
    triggered_by: TriggerSource,
    chatroom_context: Option<ChatroomContext>,
    timestamp: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateResponse {
    success: bool,
    consensus: DetailedConsensus,
    alignment_score: u8,
    commentary: String,
    metadata: EvaluateMetadata,
}

async fn evaluate_council(
    State(app): State<AppState>,
    body: Option<Json<EvaluateRequest>>,
) -> ApiResult<Json<EvaluateResponse>> {
    let started = Instant::now();
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let asset = req.asset.unwrap_or_else(|| app.config.bridge.asset.clone());
    let triggered_by = req.triggered_by.unwrap_or(TriggerSource::Manual);

    let context = match req.chatroom_context {
        Some(ctx) if ctx.direction != Sentiment::Neutral => {
            let message_count = app.store.state().await?.map_or(0, |s| s.message_count);
            Some(build_council_context(ctx.direction, ctx.strength, message_count))
        }
        _ => None,
    };

    let detailed = app.council.run(&asset, context.as_deref()).await?;
    let outcome: CouncilOutcome = app
        .bridge
        .record_council_result(detailed, triggered_by, now_ms());

    let metadata = EvaluateMetadata {
        total_time_ms: started.elapsed().as_millis() as u64,
        model_count: outcome.consensus.individual_votes.len(),
        success_count: outcome.consensus.status_counts.success,
        threshold: app.config.bridge.threshold,
        triggered_by,
        chatroom_context: req.chatroom_context,
        timestamp: outcome.timestamp,
    };
    Ok(Json(EvaluateResponse {
        success: true,
        consensus: outcome.consensus,
        alignment_score: outcome.alignment_score,
        commentary: outcome.commentary,
        metadata,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeStateResponse {
    state: BridgeState,
    time_until_next_council_ms: i64,
    config: BridgeConfig,
}

async fn bridge_state(State(app): State<AppState>) -> Json<BridgeStateResponse> {
    Json(BridgeStateResponse {
        state: app.bridge.snapshot(),
        time_until_next_council_ms: app.bridge.time_until_next_allowed(now_ms()),
        config: app.bridge.config().clone(),
    })
}

// --- Paper trading ---

#[derive(Debug, Serialize)]
pub struct TradesResponse {
    trades: Vec<Trade>,
    metrics: PortfolioMetrics,
}

async fn list_trades(State(app): State<AppState>) -> ApiResult<Json<TradesResponse>> {
    let trades = app.trader.trades().await?;
    let metrics = PortfolioMetrics::from_trades(&trades);
    Ok(Json(TradesResponse { trades, metrics }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseRequest {
    exit_price: Option<f64>,
}

async fn close_trade(
    State(app): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<CloseRequest>>,
) -> ApiResult<Json<Value>> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let trade = app.trader.close(&id, req.exit_price, now_ms()).await?;
    Ok(Json(json!({ "success": true, "trade": trade })))
}

#[derive(Debug, Default, Deserialize)]
pub struct ExecuteRequest {
    asset: Option<String>,
}

/// Run the council and open a position if it reached consensus.
async fn execute_trade(
    State(app): State<AppState>,
    body: Option<Json<ExecuteRequest>>,
) -> ApiResult<Json<Value>> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let asset = req.asset.unwrap_or_else(|| app.config.bridge.asset.clone());

    let detailed = app.council.run(&asset, None).await?;
    if !should_execute(&detailed) {
        return Err(ApiError::BadRequest(format!(
            "Consensus threshold not met for trade execution ({})",
            detailed.consensus_status.as_str()
        )));
    }
    let trade = app.trader.execute(&detailed, &asset, now_ms()).await?;
    Ok(Json(json!({
        "success": true,
        "trade": trade,
        "consensusData": detailed,
    })))
}
