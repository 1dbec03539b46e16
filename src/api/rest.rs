// =============================================================================
// REST API Endpoints — signal router and instance management (Axum 0.7)
// =============================================================================
//
// Two webhook modes:
//   - single:    the body carries `instance_id`, routed to that engine only;
//   - broadcast: no `instance_id`, fanned out to every engine matching the
//     optional `strategy_name` and fuzzy-symbol filters.
//
// Dispatch into engines is fire-and-forget: the HTTP response returns while
// the engine may still be executing. Engine errors therefore never surface
// here; only classification errors (bad signature, malformed body, unknown
// instance) map to HTTP statuses.
// =============================================================================

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Json, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

use crate::api::auth::verify_signature;
use crate::app_state::{AppState, RegisteredInstance};
use crate::broker::hyperliquid::HyperliquidBroker;
use crate::broker::ostium::OstiumBroker;
use crate::broker::BrokerClient;
use crate::engine::trading::ConfigUpdate;
use crate::engine::{InstanceConfig, MarginSpec, Signal, TradingEngine};
use crate::types::{symbol_base_matches, Exchange};

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/register_instance", post(register_instance))
        .route("/unregister_instance/:instance_id", post(unregister_instance))
        .route("/instances", get(instances))
        .route("/balance/:instance_id", get(balance))
        .route("/webhook", post(webhook_unified))
        .route("/webhook/:instance_id", post(webhook_single))
        .route("/reset/:instance_id", post(reset_instance))
        .route("/test/:instance_id", post(test_signal))
        .route("/update_config/:instance_id", post(update_config))
        .layer(cors)
        .with_state(state)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "detail": message.into() }))).into_response()
}

fn not_found(instance_id: &str) -> Response {
    error_response(
        StatusCode::NOT_FOUND,
        format!("instance {instance_id} is not registered"),
    )
}

/// Fire-and-forget dispatch into an engine.
fn dispatch(engine: Arc<TradingEngine>, signal: Signal, raw: Option<serde_json::Value>) {
    tokio::spawn(async move {
        engine.execute_signal(signal, raw).await;
    });
}

// =============================================================================
// Service info
// =============================================================================

async fn root(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({
        "service": "Borealis Signal Router (Multi-Instance)",
        "total_instances": state.instance_count(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
    .into_response()
}

async fn health(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({
        "status": "healthy",
        "instances": state.instance_count(),
    }))
    .into_response()
}

// =============================================================================
// Instance registration
// =============================================================================

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    #[serde(default)]
    instance_id: Option<String>,
    #[serde(default)]
    private_key: Option<String>,
    #[serde(default)]
    exchange: Option<String>,
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default)]
    leverage: Option<u32>,
    #[serde(default)]
    margin_amount: Option<serde_json::Value>,
    #[serde(default)]
    stop_loss_ratio: Option<f64>,
    #[serde(default)]
    take_profit_ratio: Option<f64>,
    #[serde(default)]
    forbidden_hours: Option<String>,
    #[serde(default)]
    strategy_name: Option<String>,
}

async fn register_instance(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RegisterRequest>,
) -> Response {
    let Some(instance_id) = request.instance_id.clone().filter(|s| !s.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "instance_id is required");
    };
    let Some(private_key) = request.private_key.clone().filter(|s| !s.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "private_key is required");
    };

    // Existing instance: apply the payload as an in-place config update.
    if let Some(engine) = state.get_engine(&instance_id) {
        warn!(instance_id = %instance_id, "instance already registered, updating config");
        engine.update_config(&register_as_update(&request));
        return Json(json!({
            "status": "updated",
            "instance_id": instance_id,
            "config": engine.config(),
        }))
        .into_response();
    }

    let exchange = Exchange::parse(request.exchange.as_deref().unwrap_or("ostium"));
    let mut cfg = InstanceConfig {
        exchange,
        forbidden_hours: state.defaults.default_forbidden_hours.clone(),
        margin: state.defaults.default_margin,
        ..InstanceConfig::default()
    };
    if let Some(symbol) = &request.symbol {
        cfg.symbol = symbol.clone();
    }
    if let Some(leverage) = request.leverage {
        cfg.leverage = leverage;
    }
    if let Some(sl) = request.stop_loss_ratio {
        cfg.stop_loss_percent = sl;
    }
    if let Some(tp) = request.take_profit_ratio {
        cfg.take_profit_percent = tp;
    }
    if let Some(raw) = &request.margin_amount {
        let as_string = match raw {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        if let Some(spec) = MarginSpec::parse(&as_string) {
            cfg.margin = spec;
        }
    }
    if let Some(raw) = &request.forbidden_hours {
        if let Some(hours) = crate::config::parse_forbidden_hours(raw) {
            cfg.forbidden_hours = hours;
        }
    }
    if let Some(name) = &request.strategy_name {
        cfg.strategy_name = name.clone();
    }

    // The private key only ever lives inside the broker adapter.
    let broker: Arc<dyn BrokerClient> = match exchange {
        Exchange::Ostium => Arc::new(OstiumBroker::new(private_key)),
        Exchange::Hyperliquid => Arc::new(HyperliquidBroker::new(private_key)),
    };

    info!(instance_id = %instance_id, exchange = %exchange, symbol = %cfg.symbol, "registering instance");
    let engine = Arc::new(TradingEngine::new(
        instance_id.clone(),
        cfg,
        broker,
        state.store.clone(),
        state.alerts.clone(),
    ));
    engine.sync_position().await;
    let watchdogs = engine.spawn_watchdogs();

    let config = engine.config();
    state.insert_instance(&instance_id, RegisteredInstance { engine, watchdogs });

    Json(json!({
        "status": "success",
        "instance_id": instance_id,
        "config": config,
    }))
    .into_response()
}

fn register_as_update(request: &RegisterRequest) -> ConfigUpdate {
    ConfigUpdate {
        margin_amount: request.margin_amount.clone(),
        stop_loss_ratio: request.stop_loss_ratio,
        take_profit_ratio: request.take_profit_ratio,
        leverage: request.leverage,
        symbol: request.symbol.clone(),
        forbidden_hours: request.forbidden_hours.clone(),
        strategy_name: request.strategy_name.clone(),
    }
}

async fn unregister_instance(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
) -> Response {
    if !state.remove_instance(&instance_id) {
        return not_found(&instance_id);
    }
    Json(json!({
        "status": "success",
        "message": format!("instance {instance_id} unregistered"),
    }))
    .into_response()
}

async fn instances(State(state): State<Arc<AppState>>) -> Response {
    let summaries = state.instance_summaries();
    Json(json!({
        "status": "success",
        "count": summaries.len(),
        "instances": summaries,
    }))
    .into_response()
}

async fn balance(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
) -> Response {
    let Some(engine) = state.get_engine(&instance_id) else {
        return not_found(&instance_id);
    };
    match engine.broker().get_balance().await {
        Ok(balance) => Json(json!({
            "status": "success",
            "instance_id": instance_id,
            "balance": balance,
            "symbol": engine.config().symbol,
        }))
        .into_response(),
        Err(e) => {
            error!(instance_id = %instance_id, error = %e, "balance query failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

// =============================================================================
// Webhooks
// =============================================================================

fn signature_header(headers: &HeaderMap) -> Option<&str> {
    headers.get("x-signature").and_then(|v| v.to_str().ok())
}

async fn webhook_unified(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !verify_signature(state.webhook_secret.as_deref(), &body, signature_header(&headers)) {
        return error_response(StatusCode::UNAUTHORIZED, "Invalid signature");
    }

    let raw: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, format!("invalid JSON: {e}")),
    };
    let signal: Signal = match serde_json::from_value(raw.clone()) {
        Ok(s) => s,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, format!("invalid signal: {e}")),
    };

    // Single-instance mode.
    if let Some(instance_id) = signal.instance_id.clone().filter(|s| !s.is_empty()) {
        let Some(engine) = state.get_engine(&instance_id) else {
            return not_found(&instance_id);
        };
        info!(instance_id = %instance_id, signal = %signal.signal, "webhook routed to single instance");
        dispatch(engine, signal, Some(raw));
        return Json(json!({
            "status": "success",
            "message": "Signal received",
            "instance_id": instance_id,
            "mode": "single",
        }))
        .into_response();
    }

    // Broadcast mode, filtered by strategy name and base symbol.
    if state.instance_count() == 0 {
        return error_response(StatusCode::NOT_FOUND, "no instances registered");
    }
    let target_strategy = signal.strategy_name.clone().unwrap_or_default();
    let target_symbol = signal.symbol.clone();

    let targets: Vec<(String, Arc<TradingEngine>)> = state
        .engines_snapshot()
        .into_iter()
        .filter(|(_, engine)| {
            let cfg = engine.config();
            if !target_strategy.is_empty() && cfg.strategy_name != target_strategy {
                return false;
            }
            if !target_symbol.is_empty() && !symbol_base_matches(&target_symbol, &cfg.symbol) {
                return false;
            }
            true
        })
        .collect();

    if targets.is_empty() {
        warn!(strategy = %target_strategy, symbol = %target_symbol, "broadcast matched no instances");
        return Json(json!({
            "status": "success",
            "message": format!(
                "No instances found for strategy '{target_strategy}' and symbol '{target_symbol}'"
            ),
            "mode": "broadcast",
            "instances": [],
            "broadcast_count": 0,
        }))
        .into_response();
    }

    let ids: Vec<String> = targets.iter().map(|(id, _)| id.clone()).collect();
    info!(count = targets.len(), instances = ?ids, "broadcasting signal");
    let broadcast_count = targets.len();
    for (_, engine) in targets {
        dispatch(engine, signal.clone(), Some(raw.clone()));
    }

    Json(json!({
        "status": "success",
        "message": format!("Signal broadcasted to {broadcast_count} instances"),
        "mode": "broadcast",
        "strategy_filter": if target_strategy.is_empty() { "all".to_string() } else { target_strategy },
        "instances": ids,
        "broadcast_count": broadcast_count,
    }))
    .into_response()
}

async fn webhook_single(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(engine) = state.get_engine(&instance_id) else {
        return not_found(&instance_id);
    };
    if !verify_signature(state.webhook_secret.as_deref(), &body, signature_header(&headers)) {
        return error_response(StatusCode::UNAUTHORIZED, "Invalid signature");
    }

    let raw: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, format!("invalid JSON: {e}")),
    };
    let signal: Signal = match serde_json::from_value(raw.clone()) {
        Ok(s) => s,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, format!("invalid signal: {e}")),
    };

    info!(instance_id = %instance_id, signal = %signal.signal, "webhook received");
    dispatch(engine, signal, Some(raw));

    Json(json!({
        "status": "success",
        "message": "Signal received",
        "instance_id": instance_id,
    }))
    .into_response()
}

// =============================================================================
// Instance control
// =============================================================================

async fn reset_instance(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(engine) = state.get_engine(&instance_id) else {
        return not_found(&instance_id);
    };
    if !verify_signature(state.webhook_secret.as_deref(), &body, signature_header(&headers)) {
        return error_response(StatusCode::UNAUTHORIZED, "Invalid signature");
    }

    if engine.reset().await {
        state
            .alerts
            .notify(&format!("Instance {instance_id} manually reset, trading resumed."))
            .await;
        Json(json!({
            "status": "success",
            "message": "Service reset successful",
            "instance_id": instance_id,
        }))
        .into_response()
    } else {
        Json(json!({
            "status": "info",
            "message": "Service was not stopped",
            "instance_id": instance_id,
        }))
        .into_response()
    }
}

async fn test_signal(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
    Json(signal): Json<Signal>,
) -> Response {
    let Some(engine) = state.get_engine(&instance_id) else {
        return not_found(&instance_id);
    };
    info!(instance_id = %instance_id, signal = %signal.signal, "test signal accepted");
    dispatch(engine, signal, None);
    Json(json!({
        "status": "test signal accepted",
        "instance_id": instance_id,
    }))
    .into_response()
}

async fn update_config(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(engine) = state.get_engine(&instance_id) else {
        return not_found(&instance_id);
    };
    if !verify_signature(state.webhook_secret.as_deref(), &body, signature_header(&headers)) {
        return error_response(StatusCode::UNAUTHORIZED, "Invalid signature");
    }

    let update: ConfigUpdate = match serde_json::from_slice(&body) {
        Ok(u) => u,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, format!("invalid config: {e}")),
    };

    let changes = engine.update_config(&update);
    if changes.is_empty() {
        return Json(json!({
            "status": "warning",
            "message": "no config fields provided",
            "instance_id": instance_id,
        }))
        .into_response();
    }

    Json(json!({
        "status": "success",
        "message": "config updated",
        "instance_id": instance_id,
        "updated": changes,
        "current_config": engine.config(),
    }))
    .into_response()
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::mock::{MockBroker, RecordingAlerts};
    use crate::store::SignalStore;

    async fn test_state(secret: Option<&str>) -> Arc<AppState> {
        let store = SignalStore::connect("sqlite::memory:").await.unwrap();
        let alerts = Arc::new(RecordingAlerts::new());
        Arc::new(AppState::new(
            store,
            alerts,
            AppConfig {
                bind_addr: "127.0.0.1:0".into(),
                database_url: "sqlite::memory:".into(),
                dingtalk_token: None,
                dingtalk_secret: None,
                webhook_secret: secret.map(str::to_string),
                default_forbidden_hours: Default::default(),
                default_margin: Default::default(),
                minute_alert_symbols: Vec::new(),
            },
        ))
    }

    fn add_engine(
        state: &Arc<AppState>,
        instance_id: &str,
        symbol: &str,
        strategy: &str,
    ) -> Arc<MockBroker> {
        let broker = Arc::new(MockBroker::new(3000.0));
        let cfg = InstanceConfig {
            symbol: symbol.to_string(),
            strategy_name: strategy.to_string(),
            ..InstanceConfig::default()
        };
        let engine = Arc::new(TradingEngine::new(
            instance_id,
            cfg,
            broker.clone(),
            state.store.clone(),
            state.alerts.clone(),
        ));
        state.insert_instance(
            instance_id,
            RegisteredInstance {
                engine,
                watchdogs: Vec::new(),
            },
        );
        broker
    }

    async fn response_json(resp: Response) -> (StatusCode, serde_json::Value) {
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn signal_body(fields: serde_json::Value) -> Bytes {
        Bytes::from(serde_json::to_vec(&fields).unwrap())
    }

    async fn settle() {
        // Let fire-and-forget dispatch tasks run.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn webhook_with_bad_signature_is_rejected() {
        let state = test_state(Some("s3cret")).await;
        let broker = add_engine(&state, "acct1", "ETHUSDT", "S1");

        let mut headers = HeaderMap::new();
        headers.insert("x-signature", "deadbeef".parse().unwrap());
        let body = signal_body(json!({
            "signal": "buy", "symbol": "ETH", "先前仓位": "flat", "先前仓位大小": "0"
        }));

        let resp = webhook_unified(State(state), headers, body).await;
        let (status, _) = response_json(resp).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        settle().await;
        assert!(broker.orders().is_empty());
    }

    #[tokio::test]
    async fn webhook_with_valid_signature_dispatches() {
        let state = test_state(Some("s3cret")).await;
        let broker = add_engine(&state, "acct1", "ETHUSDT", "S1");

        let body = signal_body(json!({
            "signal": "buy", "symbol": "ETH", "instance_id": "acct1",
            "先前仓位": "flat", "先前仓位大小": "0"
        }));
        let sig = crate::api::auth::expected_signature("s3cret", &body);
        let mut headers = HeaderMap::new();
        headers.insert("x-signature", sig.parse().unwrap());

        let resp = webhook_unified(State(state), headers, body).await;
        let (status, json) = response_json(resp).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["mode"], "single");

        settle().await;
        assert_eq!(broker.orders().len(), 1);
    }

    #[tokio::test]
    async fn broadcast_filters_by_strategy_and_symbol() {
        let state = test_state(None).await;
        let broker_a = add_engine(&state, "A", "ETHUSDT", "S1");
        let broker_b = add_engine(&state, "B", "ETHUSDT", "S2");

        let body = signal_body(json!({
            "signal": "buy", "symbol": "ETH", "strategy_name": "S1",
            "先前仓位": "flat", "先前仓位大小": "0"
        }));

        let resp = webhook_unified(State(state), HeaderMap::new(), body).await;
        let (status, json) = response_json(resp).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["mode"], "broadcast");
        assert_eq!(json["broadcast_count"], 1);
        assert_eq!(json["instances"], serde_json::json!(["A"]));

        settle().await;
        assert_eq!(broker_a.orders().len(), 1);
        assert!(broker_b.orders().is_empty());
    }

    #[tokio::test]
    async fn broadcast_symbol_mismatch_matches_nothing() {
        let state = test_state(None).await;
        let broker = add_engine(&state, "A", "ETHUSDT", "S1");

        let body = signal_body(json!({
            "signal": "buy", "symbol": "BTC", "strategy_name": "S1",
            "先前仓位": "flat", "先前仓位大小": "0"
        }));
        let resp = webhook_unified(State(state), HeaderMap::new(), body).await;
        let (status, json) = response_json(resp).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["broadcast_count"], 0);

        settle().await;
        assert!(broker.orders().is_empty());
    }

    #[tokio::test]
    async fn webhook_unknown_instance_is_404() {
        let state = test_state(None).await;
        add_engine(&state, "acct1", "ETHUSDT", "S1");

        let body = signal_body(json!({
            "signal": "buy", "symbol": "ETH", "instance_id": "ghost"
        }));
        let resp = webhook_unified(State(state), HeaderMap::new(), body).await;
        let (status, _) = response_json(resp).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn webhook_malformed_body_is_400() {
        let state = test_state(None).await;
        add_engine(&state, "acct1", "ETHUSDT", "S1");

        let resp = webhook_unified(
            State(state),
            HeaderMap::new(),
            Bytes::from_static(b"not json"),
        )
        .await;
        let (status, _) = response_json(resp).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn webhook_single_path_routes() {
        let state = test_state(None).await;
        let broker = add_engine(&state, "acct1", "ETHUSDT", "S1");

        let body = signal_body(json!({
            "signal": "buy", "symbol": "ETH", "先前仓位": "flat", "先前仓位大小": "0"
        }));
        let resp = webhook_single(
            State(state),
            Path("acct1".to_string()),
            HeaderMap::new(),
            body,
        )
        .await;
        let (status, json) = response_json(resp).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["instance_id"], "acct1");

        settle().await;
        assert_eq!(broker.orders().len(), 1);
    }

    #[tokio::test]
    async fn register_requires_credentials() {
        let state = test_state(None).await;
        let resp = register_instance(
            State(state.clone()),
            Json(serde_json::from_value(json!({"instance_id": "x"})).unwrap()),
        )
        .await;
        let (status, _) = response_json(resp).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let resp = register_instance(
            State(state),
            Json(serde_json::from_value(json!({"private_key": "pk"})).unwrap()),
        )
        .await;
        let (status, _) = response_json(resp).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn reregister_updates_in_place() {
        let state = test_state(None).await;
        add_engine(&state, "acct1", "ETHUSDT", "S1");

        let request: RegisterRequest = serde_json::from_value(json!({
            "instance_id": "acct1",
            "private_key": "pk",
            "leverage": 25,
            "margin_amount": "2-4",
        }))
        .unwrap();
        let resp = register_instance(State(state.clone()), Json(request)).await;
        let (status, json) = response_json(resp).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "updated");
        assert_eq!(json["config"]["leverage"], 25);
        assert_eq!(json["config"]["margin_amount"], "2-4");
        assert_eq!(state.instance_count(), 1);
    }

    #[tokio::test]
    async fn unregister_and_listing() {
        let state = test_state(None).await;
        add_engine(&state, "acct1", "ETHUSDT", "S1");

        let resp = instances(State(state.clone())).await;
        let (_, json) = response_json(resp).await;
        assert_eq!(json["count"], 1);
        assert_eq!(json["instances"][0]["instance_id"], "acct1");
        assert_eq!(json["instances"][0]["strategy"], "S1");

        let resp =
            unregister_instance(State(state.clone()), Path("acct1".to_string())).await;
        let (status, _) = response_json(resp).await;
        assert_eq!(status, StatusCode::OK);

        let resp = unregister_instance(State(state), Path("acct1".to_string())).await;
        let (status, _) = response_json(resp).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn balance_returns_broker_balance() {
        let state = test_state(None).await;
        add_engine(&state, "acct1", "ETHUSDT", "S1");

        let resp = balance(State(state), Path("acct1".to_string())).await;
        let (status, json) = response_json(resp).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["balance"], 1000.0);
        assert_eq!(json["symbol"], "ETHUSDT");
    }

    #[tokio::test]
    async fn update_config_applies_and_echoes() {
        let state = test_state(None).await;
        add_engine(&state, "acct1", "ETHUSDT", "S1");

        let body = signal_body(json!({"leverage": 30, "stop_loss_ratio": 0.02}));
        let resp = update_config(
            State(state.clone()),
            Path("acct1".to_string()),
            HeaderMap::new(),
            body,
        )
        .await;
        let (status, json) = response_json(resp).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["current_config"]["leverage"], 30);

        // Empty update is a warning, not an error.
        let resp = update_config(
            State(state),
            Path("acct1".to_string()),
            HeaderMap::new(),
            signal_body(json!({})),
        )
        .await;
        let (status, json) = response_json(resp).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "warning");
    }

    #[tokio::test]
    async fn reset_reports_halt_state() {
        let state = test_state(None).await;
        add_engine(&state, "acct1", "ETHUSDT", "S1");

        let resp = reset_instance(
            State(state),
            Path("acct1".to_string()),
            HeaderMap::new(),
            Bytes::new(),
        )
        .await;
        let (status, json) = response_json(resp).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "info"); // engine was not halted
    }

    #[tokio::test]
    async fn test_endpoint_dispatches() {
        let state = test_state(None).await;
        let broker = add_engine(&state, "acct1", "ETHUSDT", "S1");

        let signal: Signal = serde_json::from_value(json!({
            "signal": "buy", "symbol": "ETH", "先前仓位": "flat", "先前仓位大小": "0"
        }))
        .unwrap();
        let resp = test_signal(State(state), Path("acct1".to_string()), Json(signal)).await;
        let (status, _) = response_json(resp).await;
        assert_eq!(status, StatusCode::OK);

        settle().await;
        assert_eq!(broker.orders().len(), 1);
    }
}
