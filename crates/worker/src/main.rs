use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fundwatch_core::estimate::estimate_change;
use fundwatch_core::ingest::holdings::HoldingsResolver;
use fundwatch_core::ingest::quotes::QuoteClient;
use fundwatch_core::scheduler::RefreshScheduler;
use fundwatch_core::storage;
use fundwatch_core::track;

const DEFAULT_DATABASE_URL: &str = "sqlite://fundwatch.db";

#[derive(Debug, Parser)]
#[command(name = "fundwatch_worker")]
struct Args {
    /// Register a fund by its 6-digit code.
    #[arg(long)]
    add_fund: Option<String>,

    /// Run one refresh cycle immediately, bypassing the trading-hours gate.
    #[arg(long)]
    once: bool,

    /// Do everything except writing to the database.
    #[arg(long)]
    dry_run: bool,
}

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

    let args = Args::parse();
    anyhow::ensure!(
        args.add_fund.is_some() || args.once,
        "nothing to do: pass --add-fund CODE and/or --once"
    );

    let needs_db = args.once || (args.add_fund.is_some() && !args.dry_run);
    let pool = if needs_db {
        let db_url = settings
            .database_url
            .clone()
            .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());
        let pool = storage::connect(&db_url).await?;
        storage::migrate(&pool).await?;
        Some(pool)
    } else {
        None
    };

    if let Some(code) = args.add_fund.as_deref() {
        let resolver = HoldingsResolver::from_settings(&settings)?;

        if args.dry_run {
            match resolver.resolve(code).await {
                Some(result) => {
                    tracing::info!(
                        fund_code = %result.code,
                        fund_name = %result.name,
                        holdings = result.holdings.len(),
                        dry_run = true,
                        "resolved fund"
                    );
                    for entry in &result.holdings {
                        tracing::info!(
                            security = %entry.code,
                            name = %entry.name,
                            weight = entry.weight,
                            "holding"
                        );
                    }
                }
                None => tracing::warn!(fund_code = %code, "no upstream source knows this fund"),
            }
        } else {
            let pool = pool.as_ref().context("pool required for --add-fund")?;
            match track::add_fund(pool, &resolver, code).await {
                Ok(Some(fund)) => {
                    tracing::info!(fund_code = %fund.code, fund_name = %fund.name, "fund registered");
                }
                Ok(None) => {
                    tracing::warn!(fund_code = %code, "no upstream source knows this fund");
                }
                Err(err) => {
                    sentry_anyhow::capture_anyhow(&err);
                    return Err(err);
                }
            }
        }
    }

    if args.once {
        let pool = pool.context("pool required for --once")?;
        let quotes = QuoteClient::from_settings(&settings)?;

        if args.dry_run {
            run_dry_cycle(&pool, &quotes).await?;
        } else {
            let scheduler = RefreshScheduler::new(pool, quotes).await?;
            match scheduler.trigger_now().await {
                Ok(outcome) => tracing::info!(?outcome, "manual cycle finished"),
                Err(err) => {
                    sentry_anyhow::capture_anyhow(&err);
                    return Err(err);
                }
            }
        }
    }

    Ok(())
}

/// Fetches quotes and logs per-fund estimates without writing snapshots.
async fn run_dry_cycle(pool: &sqlx::SqlitePool, quotes: &QuoteClient) -> anyhow::Result<()> {
    let funds = storage::funds::list_funds(pool).await?;
    if funds.is_empty() {
        tracing::info!("no tracked funds");
        return Ok(());
    }

    let mut all_symbols = Vec::new();
    let mut allocations = Vec::with_capacity(funds.len());
    for fund in &funds {
        let rows = storage::funds::fund_holdings_with_securities(pool, fund.id).await?;
        let allocation: Vec<(String, f64)> = rows
            .into_iter()
            .map(|(security, weight)| (security.code, weight))
            .collect();
        all_symbols.extend(allocation.iter().map(|(code, _)| code.clone()));
        allocations.push((fund, allocation));
    }

    let quote_map = quotes.batch(&all_symbols).await;
    tracing::info!(
        symbols = all_symbols.len(),
        resolved = quote_map.len(),
        dry_run = true,
        "quotes fetched"
    );

    for (fund, allocation) in &allocations {
        let estimated = estimate_change(allocation, &quote_map);
        tracing::info!(
            fund_code = %fund.code,
            fund_name = %fund.name,
            estimated_change = estimated,
            dry_run = true,
            "fund estimate"
        );
    }

    Ok(())
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
