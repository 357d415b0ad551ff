//! HTTP surface: the batch trigger, the bank webhook, a connection status
//! feed for the link-management UI and the portfolio history reads.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use folio_core::{BankHealth, BrokerageHealth};
use folio_storage::FinanceStore;
use folio_sync::{
    holdings_history, mark_item_pending, portfolio_history, BatchOrchestrator, HoldingFilter, SyncConfig, SyncError,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "folio-web";

pub const CRON_SECRET_HEADER: &str = "x-cron-secret";
pub const SYNC_UPDATES_AVAILABLE: &str = "SYNC_UPDATES_AVAILABLE";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn FinanceStore>,
    pub orchestrator: Arc<BatchOrchestrator>,
    pub cron_secret: Option<String>,
}

impl AppState {
    pub fn new(store: Arc<dyn FinanceStore>, orchestrator: Arc<BatchOrchestrator>, cron_secret: Option<String>) -> Self {
        Self {
            store,
            orchestrator,
            cron_secret,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct CronQuery {
    pub secret: Option<String>,
}

/// The fields of a bank webhook this service acts on.
#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub webhook_code: String,
    #[serde(default)]
    pub item_id: Option<String>,
}

impl WebhookPayload {
    /// Decodes a JSON object body. Arrays would otherwise decode positionally.
    pub fn from_slice(body: &[u8]) -> serde_json::Result<Self> {
        let object: serde_json::Map<String, Value> = serde_json::from_slice(body)?;
        serde_json::from_value(Value::Object(object))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioQuery {
    pub account_id: Option<String>,
    pub symbol: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HoldingPointView {
    pub date: chrono::NaiveDate,
    pub account_id: String,
    pub symbol: String,
    pub quantity: f64,
    pub value_cents: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemStatusView {
    pub item_id: String,
    pub institution_name: Option<String>,
    pub status: BankHealth,
    pub pending: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatusView {
    pub connection_id: String,
    pub brokerage: String,
    pub status: BrokerageHealth,
    pub last_checked: Option<DateTime<Utc>>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/cron/daily-sync", get(daily_sync_handler).post(daily_sync_handler))
        .route("/api/webhooks/plaid", post(plaid_webhook_handler))
        .route("/api/connections", get(connections_handler))
        .route("/api/portfolio/snapshots", get(portfolio_snapshots_handler))
        .route("/api/portfolio/holdings/history", get(holdings_history_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: &SyncConfig, state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, "web server listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

/// Constant-time secret comparison. An unset secret rejects everything.
fn secret_matches(expected: Option<&str>, provided: Option<&str>) -> bool {
    match (expected, provided) {
        (Some(expected), Some(provided)) => provided.as_bytes().ct_eq(expected.as_bytes()).into(),
        _ => false,
    }
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn daily_sync_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<CronQuery>,
) -> Response {
    let provided = headers
        .get(CRON_SECRET_HEADER)
        .and_then(|value| value.to_str().ok())
        .or(query.secret.as_deref());
    if !secret_matches(state.cron_secret.as_deref(), provided) {
        warn!("batch trigger rejected: bad or missing secret");
        return json_error(StatusCode::UNAUTHORIZED, "unauthorized");
    }

    match state.orchestrator.run(Utc::now()).await {
        Ok(summary) => Json(summary).into_response(),
        Err(err @ SyncError::BatchAlreadyRunning(_)) => json_error(StatusCode::CONFLICT, err.to_string()),
        Err(err) => {
            error!(error = %err, "batch failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

async fn plaid_webhook_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let payload = match WebhookPayload::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => return json_error(StatusCode::BAD_REQUEST, format!("invalid webhook payload: {err}")),
    };

    if payload.webhook_code != SYNC_UPDATES_AVAILABLE {
        info!(webhook_code = %payload.webhook_code, "webhook acknowledged without action");
        return Json(json!({ "status": "ignored" })).into_response();
    }

    let Some(item_id) = payload.item_id.as_deref().filter(|id| !id.trim().is_empty()) else {
        return json_error(StatusCode::BAD_REQUEST, "missing item_id");
    };

    match mark_item_pending(state.store.as_ref(), item_id).await {
        Ok(true) => Json(json!({ "status": "pending" })).into_response(),
        Ok(false) => Json(json!({ "status": "unknown_item" })).into_response(),
        Err(err) => {
            error!(item_id, error = %err, "failed to flag item pending");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

async fn portfolio_snapshots_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PortfolioQuery>,
) -> Response {
    let account_id = non_empty(query.account_id);
    match portfolio_history(state.store.as_ref(), Utc::now().date_naive(), account_id.as_deref()).await {
        Ok(history) => Json(history).into_response(),
        Err(err) => json_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn holdings_history_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PortfolioQuery>,
) -> Response {
    let filter = HoldingFilter {
        account_id: non_empty(query.account_id),
        symbol: non_empty(query.symbol),
    };
    match holdings_history(state.store.as_ref(), Utc::now().date_naive(), &filter).await {
        Ok(holdings) => {
            let daily = holdings
                .into_iter()
                .map(|holding| HoldingPointView {
                    date: holding.date,
                    account_id: holding.account_id,
                    symbol: holding.symbol,
                    quantity: holding.quantity,
                    value_cents: holding.value_cents,
                })
                .collect::<Vec<_>>();
            Json(json!({ "daily": daily })).into_response()
        }
        Err(err) => json_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn connections_handler(State(state): State<Arc<AppState>>) -> Response {
    let items = match state.store.list_items().await {
        Ok(items) => items,
        Err(err) => return json_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    };
    let connections = match state.store.list_brokerage_connections().await {
        Ok(connections) => connections,
        Err(err) => return json_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    };

    let items = items
        .into_iter()
        .map(|item| ItemStatusView {
            item_id: item.item_id,
            institution_name: item.institution_name,
            status: item.status,
            pending: item.pending,
            last_synced_at: item.last_synced_at,
        })
        .collect::<Vec<_>>();
    let connections = connections
        .into_iter()
        .map(|connection| ConnectionStatusView {
            connection_id: connection.connection_id,
            brokerage: connection.brokerage,
            status: connection.status,
            last_checked: connection.last_checked,
        })
        .collect::<Vec<_>>();
    Json(json!({ "items": items, "brokerageConnections": connections })).into_response()
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use folio_core::{DailyHolding, Item, MonthlySnapshot};
    use folio_providers::{BankProvider, BrokerageProvider, ScriptedBankProvider};
    use folio_storage::MemoryStore;
    use folio_sync::lock::{BATCH_LOCK, STALE_LOCK_AFTER};
    use folio_sync::{Providers, RetentionPolicy};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;

    fn state_with(store: Arc<MemoryStore>, bank: Option<Arc<ScriptedBankProvider>>) -> AppState {
        let providers = Providers {
            bank: bank.map(|bank| bank as Arc<dyn BankProvider>),
            brokerage: None::<Arc<dyn BrokerageProvider>>,
        };
        let orchestrator = BatchOrchestrator::new(store.clone(), providers, RetentionPolicy::default());
        AppState::new(store, Arc::new(orchestrator), Some("s3cret".to_string()))
    }

    async fn body_json(resp: Response) -> Value {
        let bytes = resp.into_body().collect().await.expect("body").to_bytes();
        serde_json::from_slice(&bytes).expect("json body")
    }

    fn webhook(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/webhooks/plaid")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    #[test]
    fn secret_comparison_requires_configured_secret() {
        assert!(secret_matches(Some("abc"), Some("abc")));
        assert!(!secret_matches(Some("abc"), Some("abd")));
        assert!(!secret_matches(Some("abc"), Some("abcd")));
        assert!(!secret_matches(Some("abc"), None));
        assert!(!secret_matches(None, Some("abc")));
    }

    #[tokio::test]
    async fn health_smoke() {
        let app = app(state_with(Arc::new(MemoryStore::new()), None));
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.expect("body").to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn trigger_rejects_bad_secret() {
        let app = app(state_with(Arc::new(MemoryStore::new()), None));
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/cron/daily-sync")
                    .header(CRON_SECRET_HEADER, "wrong")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn trigger_runs_batch_with_header_or_query_secret() {
        let store = Arc::new(MemoryStore::new());
        let mut item = Item::new("item-1", "access-1", Utc::now());
        item.pending = true;
        store.upsert_item(&item).await.expect("seed");
        let app = app(state_with(store.clone(), Some(Arc::new(ScriptedBankProvider::new()))));

        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/cron/daily-sync")
                    .header(CRON_SECRET_HEADER, "s3cret")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let summary = body_json(resp).await;
        assert_eq!(summary["itemsSynced"], 1);
        assert_eq!(summary["dailySnapshotWritten"], false);
        assert_eq!(summary["monthlySnapshotsWritten"], 0);

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/cron/daily-sync?secret=s3cret")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn trigger_reports_conflict_and_store_failures() {
        let store = Arc::new(MemoryStore::new());
        let held = store
            .try_lock_run(BATCH_LOCK, Utc::now(), STALE_LOCK_AFTER)
            .await
            .expect("hold")
            .expect("lease");
        let app = app(state_with(store.clone(), None));
        let request = || {
            Request::builder()
                .method("POST")
                .uri("/api/cron/daily-sync")
                .header(CRON_SECRET_HEADER, "s3cret")
                .body(Body::empty())
                .expect("request")
        };

        let resp = app.clone().oneshot(request()).await.expect("response");
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        store.unlock_run(BATCH_LOCK, held).await.expect("unlock");
        store.set_fail_writes(true);
        let resp = app.oneshot(request()).await.expect("response");
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body_json(resp).await["error"].as_str().expect("error text").contains("write rejected"));
    }

    #[tokio::test]
    async fn webhook_status_codes() {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_item(&Item::new("item-1", "access-1", Utc::now()))
            .await
            .expect("seed");
        let app = app(state_with(store.clone(), None));

        for body in [
            "{not json",
            "[]",
            "42",
            r#""x""#,
            "null",
            r#"{"webhook_code":7}"#,
            r#"{"webhook_code":"SYNC_UPDATES_AVAILABLE","item_id":["item-1"]}"#,
        ] {
            let malformed = app.clone().oneshot(webhook(body)).await.expect("response");
            assert_eq!(malformed.status(), StatusCode::BAD_REQUEST, "{body}");
        }
        assert!(!store.get_item("item-1").await.expect("get").expect("item").pending);

        let ignored = app
            .clone()
            .oneshot(webhook(r#"{"webhook_type":"ITEM","webhook_code":"WEBHOOK_UPDATE_ACKNOWLEDGED","item_id":"item-1"}"#))
            .await
            .expect("response");
        assert_eq!(ignored.status(), StatusCode::OK);
        assert!(!store.get_item("item-1").await.expect("get").expect("item").pending);

        let missing = app
            .clone()
            .oneshot(webhook(r#"{"webhook_code":"SYNC_UPDATES_AVAILABLE"}"#))
            .await
            .expect("response");
        assert_eq!(missing.status(), StatusCode::BAD_REQUEST);

        let flagged = app
            .clone()
            .oneshot(webhook(r#"{"webhook_code":"SYNC_UPDATES_AVAILABLE","item_id":"item-1"}"#))
            .await
            .expect("response");
        assert_eq!(flagged.status(), StatusCode::OK);
        assert!(store.get_item("item-1").await.expect("get").expect("item").pending);

        let unknown = app
            .clone()
            .oneshot(webhook(r#"{"webhook_code":"SYNC_UPDATES_AVAILABLE","item_id":"item-9"}"#))
            .await
            .expect("response");
        assert_eq!(unknown.status(), StatusCode::OK);
        assert_eq!(body_json(unknown).await["status"], "unknown_item");

        store.set_fail_writes(true);
        let failed = app
            .oneshot(webhook(r#"{"webhook_code":"SYNC_UPDATES_AVAILABLE","item_id":"item-1"}"#))
            .await
            .expect("response");
        assert_eq!(failed.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn portfolio_snapshots_sum_accounts_unless_filtered() {
        let store = Arc::new(MemoryStore::new());
        let this_month = folio_core::calendar::month_start(Utc::now().date_naive());
        store
            .upsert_monthly_snapshots(&[
                MonthlySnapshot {
                    month: this_month,
                    account_id: "acc-a".to_string(),
                    portfolio_value_cents: 4_000,
                },
                MonthlySnapshot {
                    month: this_month,
                    account_id: "acc-b".to_string(),
                    portfolio_value_cents: 1_000,
                },
            ])
            .await
            .expect("seed");
        let app = app(state_with(store, None));

        let resp = app
            .clone()
            .oneshot(Request::builder().uri("/api/portfolio/snapshots").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["monthly"].as_array().expect("monthly").len(), 1);
        assert_eq!(body["monthly"][0]["portfolioValueCents"], 5_000);

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/portfolio/snapshots?accountId=acc-b")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        let body = body_json(resp).await;
        assert_eq!(body["monthly"][0]["portfolioValueCents"], 1_000);
    }

    #[tokio::test]
    async fn holdings_history_filters_by_symbol() {
        let store = Arc::new(MemoryStore::new());
        let today = Utc::now().date_naive();
        let holding = |account_id: &str, symbol: &str, value_cents: i64| DailyHolding {
            date: today,
            account_id: account_id.to_string(),
            symbol: symbol.to_string(),
            quantity: 2.0,
            value_cents,
        };
        store
            .upsert_daily_holdings(&[holding("acc-a", "VTI", 900), holding("acc-b", "AAPL", 400)])
            .await
            .expect("seed");
        let app = app(state_with(store, None));

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/portfolio/holdings/history?symbol=AAPL")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        let daily = body["daily"].as_array().expect("daily");
        assert_eq!(daily.len(), 1);
        assert_eq!(daily[0]["accountId"], "acc-b");
        assert_eq!(daily[0]["valueCents"], 400);
    }

    #[tokio::test]
    async fn connections_feed_lists_health() {
        let store = Arc::new(MemoryStore::new());
        let mut item = Item::new("item-1", "access-1", Utc::now());
        item.status = BankHealth::LoginRequired;
        store.upsert_item(&item).await.expect("seed");
        let app = app(state_with(store, None));

        let resp = app
            .oneshot(Request::builder().uri("/api/connections").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["items"][0]["itemId"], "item-1");
        assert_eq!(body["items"][0]["status"], serde_json::to_value(BankHealth::LoginRequired).expect("json"));
    }
}
