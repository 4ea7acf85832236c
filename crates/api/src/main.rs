use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fundwatch_core::domain::{validate_fund_code, Fund};
use fundwatch_core::estimate::round2;
use fundwatch_core::ingest::holdings::HoldingsResolver;
use fundwatch_core::ingest::quotes::QuoteClient;
use fundwatch_core::scheduler::{CycleOutcome, RefreshScheduler, SkipReason};
use fundwatch_core::storage;
use fundwatch_core::time::cn_market;
use fundwatch_core::track::{self, RefreshOutcome};

const DEFAULT_DATABASE_URL: &str = "sqlite://fundwatch.db";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = fundwatch_core::config::Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();

    let db_url = settings
        .database_url
        .clone()
        .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());
    let pool = storage::connect(&db_url).await?;
    storage::migrate(&pool).await?;

    let quotes = QuoteClient::from_settings(&settings)?;
    let resolver = Arc::new(HoldingsResolver::from_settings(&settings)?);

    let scheduler = RefreshScheduler::new(pool.clone(), quotes).await?;
    let scheduler_task = scheduler.start();

    let state = AppState {
        pool,
        resolver,
        scheduler: scheduler.clone(),
    };

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/funds", get(list_funds).post(add_fund))
        .route("/funds/:fund_id", delete(delete_fund))
        .route("/funds/:fund_id/refresh", post(refresh_fund_holdings))
        .route("/funds/:fund_id/history", get(get_fund_history))
        .route("/funds/:fund_id/holdings", get(get_fund_holdings))
        .route("/refresh", post(trigger_refresh))
        .route("/config/interval", get(get_interval).put(set_interval))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3000);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));

    tracing::info!(%addr, "api listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.stop();
    let _ = scheduler_task.await;

    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Clone)]
struct AppState {
    pool: SqlitePool,
    resolver: Arc<HoldingsResolver>,
    scheduler: RefreshScheduler,
}

#[derive(Debug, Serialize)]
struct FundView {
    id: i64,
    code: String,
    name: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    estimated_change: Option<f64>,
    last_update: Option<DateTime<Utc>>,
}

async fn list_funds(State(state): State<AppState>) -> Result<Json<Vec<FundView>>, StatusCode> {
    let funds = storage::funds::list_funds(&state.pool)
        .await
        .map_err(internal_error)?;

    let mut out = Vec::with_capacity(funds.len());
    for fund in funds {
        let latest = storage::snapshots::latest_fund_snapshot(&state.pool, fund.id)
            .await
            .map_err(internal_error)?;
        out.push(FundView {
            id: fund.id,
            code: fund.code,
            name: fund.name,
            created_at: fund.created_at,
            updated_at: fund.updated_at,
            estimated_change: latest.as_ref().map(|s| s.estimated_change),
            last_update: latest.map(|s| s.captured_at),
        });
    }
    Ok(Json(out))
}

#[derive(Debug, Deserialize)]
struct AddFundRequest {
    code: String,
}

async fn add_fund(
    State(state): State<AppState>,
    Json(req): Json<AddFundRequest>,
) -> Result<(StatusCode, Json<Fund>), StatusCode> {
    let code = validate_fund_code(&req.code).map_err(|_| StatusCode::BAD_REQUEST)?;

    let existing = storage::funds::get_fund_by_code(&state.pool, code)
        .await
        .map_err(internal_error)?;
    if existing.is_some() {
        return Err(StatusCode::CONFLICT);
    }

    let fund = track::add_fund(&state.pool, &state.resolver, code)
        .await
        .map_err(internal_error)?
        .ok_or(StatusCode::NOT_FOUND)?;

    Ok((StatusCode::CREATED, Json(fund)))
}

async fn delete_fund(
    State(state): State<AppState>,
    Path(fund_id): Path<i64>,
) -> Result<StatusCode, StatusCode> {
    let deleted = storage::funds::delete_fund(&state.pool, fund_id)
        .await
        .map_err(internal_error)?;
    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

#[derive(Debug, Serialize)]
struct RefreshHoldingsResponse {
    status: &'static str,
    holdings: usize,
}

async fn refresh_fund_holdings(
    State(state): State<AppState>,
    Path(fund_id): Path<i64>,
) -> Result<Json<RefreshHoldingsResponse>, StatusCode> {
    let fund = storage::funds::get_fund(&state.pool, fund_id)
        .await
        .map_err(internal_error)?
        .ok_or(StatusCode::NOT_FOUND)?;

    let outcome = track::refresh_holdings(&state.pool, &state.resolver, &fund)
        .await
        .map_err(internal_error)?;

    let response = match outcome {
        RefreshOutcome::Replaced { holdings } => RefreshHoldingsResponse {
            status: "replaced",
            holdings,
        },
        RefreshOutcome::NameOnly => RefreshHoldingsResponse {
            status: "name_only",
            holdings: 0,
        },
        RefreshOutcome::NoData => RefreshHoldingsResponse {
            status: "no_data",
            holdings: 0,
        },
    };
    Ok(Json(response))
}

#[derive(Debug, Serialize)]
struct HistoryPoint {
    timestamp: DateTime<Utc>,
    estimated_change: f64,
}

#[derive(Debug, Serialize)]
struct HistoryResponse {
    fund_code: String,
    fund_name: String,
    points: Vec<HistoryPoint>,
}

async fn get_fund_history(
    State(state): State<AppState>,
    Path(fund_id): Path<i64>,
) -> Result<Json<HistoryResponse>, StatusCode> {
    let fund = storage::funds::get_fund(&state.pool, fund_id)
        .await
        .map_err(internal_error)?
        .ok_or(StatusCode::NOT_FOUND)?;

    let since = cn_market::start_of_local_day(Utc::now());
    let snapshots = storage::snapshots::fund_history_since(&state.pool, fund_id, since)
        .await
        .map_err(internal_error)?;

    Ok(Json(HistoryResponse {
        fund_code: fund.code,
        fund_name: fund.name,
        points: snapshots
            .into_iter()
            .map(|s| HistoryPoint {
                timestamp: s.captured_at,
                estimated_change: s.estimated_change,
            })
            .collect(),
    }))
}

#[derive(Debug, Serialize)]
struct HoldingView {
    code: String,
    name: String,
    /// Percentage of the portfolio, for display. The engine stores
    /// fractions; the conversion happens only here.
    ratio: f64,
}

async fn get_fund_holdings(
    State(state): State<AppState>,
    Path(fund_id): Path<i64>,
) -> Result<Json<Vec<HoldingView>>, StatusCode> {
    storage::funds::get_fund(&state.pool, fund_id)
        .await
        .map_err(internal_error)?
        .ok_or(StatusCode::NOT_FOUND)?;

    let holdings = storage::funds::fund_holdings(&state.pool, fund_id)
        .await
        .map_err(internal_error)?;

    let mut views: Vec<HoldingView> = holdings
        .into_iter()
        .map(|h| HoldingView {
            code: h.security_code,
            name: h.security_name,
            ratio: round2(h.weight * 100.0),
        })
        .collect();
    views.sort_by(|a, b| b.ratio.partial_cmp(&a.ratio).unwrap_or(std::cmp::Ordering::Equal));

    Ok(Json(views))
}

#[derive(Debug, Serialize)]
struct TriggerResponse {
    outcome: &'static str,
    funds_updated: usize,
    quotes_fetched: usize,
}

async fn trigger_refresh(
    State(state): State<AppState>,
) -> Result<Json<TriggerResponse>, StatusCode> {
    let outcome = state.scheduler.trigger_now().await.map_err(internal_error)?;

    let response = match outcome {
        CycleOutcome::Updated {
            funds_updated,
            quotes_fetched,
        } => TriggerResponse {
            outcome: "updated",
            funds_updated,
            quotes_fetched,
        },
        CycleOutcome::Skipped(reason) => TriggerResponse {
            outcome: skip_reason_label(reason),
            funds_updated: 0,
            quotes_fetched: 0,
        },
        CycleOutcome::Busy => TriggerResponse {
            outcome: "busy",
            funds_updated: 0,
            quotes_fetched: 0,
        },
    };
    Ok(Json(response))
}

fn skip_reason_label(reason: SkipReason) -> &'static str {
    match reason {
        SkipReason::OutsideSession => "outside_session",
        SkipReason::NothingTracked => "nothing_tracked",
        SkipReason::AllFundsCurrent => "all_funds_current",
        SkipReason::NoQuotes => "no_quotes",
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct IntervalConfig {
    interval_secs: u64,
}

async fn get_interval(State(state): State<AppState>) -> Json<IntervalConfig> {
    Json(IntervalConfig {
        interval_secs: state.scheduler.interval_secs(),
    })
}

async fn set_interval(
    State(state): State<AppState>,
    Json(req): Json<IntervalConfig>,
) -> Result<Json<IntervalConfig>, StatusCode> {
    let applied = state
        .scheduler
        .set_interval_secs(req.interval_secs)
        .await
        .map_err(internal_error)?;
    Ok(Json(IntervalConfig {
        interval_secs: applied,
    }))
}

fn internal_error(err: anyhow::Error) -> StatusCode {
    sentry_anyhow::capture_anyhow(&err);
    tracing::error!(error = %err, "request failed");
    StatusCode::INTERNAL_SERVER_ERROR
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn init_sentry(settings: &fundwatch_core::config::Settings) -> Option<sentry::ClientInitGuard> {
    let dsn = settings.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}
