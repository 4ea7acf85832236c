use crate::domain::SecuritySnapshot;
use crate::estimate::estimate_change;
use crate::ingest::quotes::QuoteClient;
use crate::storage::{funds, runtime_config, snapshots};
use crate::time::cn_market;
use anyhow::Context;
use chrono::Utc;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

pub const MIN_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_INTERVAL_SECS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Outside both trading sessions and not in the post-close window.
    OutsideSession,
    /// No tracked funds, or none of them has holdings yet.
    NothingTracked,
    /// Post-close mode and every fund already has today's close snapshot.
    AllFundsCurrent,
    /// The quote provider returned no usable data for any symbol.
    NoQuotes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Updated {
        funds_updated: usize,
        quotes_fetched: usize,
    },
    Skipped(SkipReason),
    /// Another cycle was mid-flight; this fire was coalesced.
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleMode {
    /// Timer-driven: consult the trading clock before doing anything.
    Gated,
    /// Manual trigger: run one full cycle regardless of the clock.
    Forced,
}

/// Periodic driver of the estimation pipeline. One background timer task
/// runs gated cycles; manual triggers run forced cycles through the same
/// single-flight guard, so at most one cycle is ever in flight.
#[derive(Clone)]
pub struct RefreshScheduler {
    inner: Arc<Inner>,
}

struct Inner {
    pool: SqlitePool,
    quotes: QuoteClient,
    cycle_guard: Mutex<()>,
    interval_tx: watch::Sender<u64>,
    shutdown_tx: watch::Sender<bool>,
}

impl RefreshScheduler {
    /// Restores the persisted interval so a restart resumes the same
    /// cadence.
    pub async fn new(pool: SqlitePool, quotes: QuoteClient) -> anyhow::Result<Self> {
        let interval_secs =
            runtime_config::load_interval_secs(&pool, MIN_INTERVAL_SECS, DEFAULT_INTERVAL_SECS)
                .await?;

        let (interval_tx, _) = watch::channel(interval_secs);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(Inner {
                pool,
                quotes,
                cycle_guard: Mutex::new(()),
                interval_tx,
                shutdown_tx,
            }),
        })
    }

    pub fn interval_secs(&self) -> u64 {
        *self.inner.interval_tx.borrow()
    }

    /// Adjusts the timer cadence, clamped to the 30-second floor. Takes
    /// effect on the next reschedule and is persisted across restarts.
    pub async fn set_interval_secs(&self, secs: u64) -> anyhow::Result<u64> {
        let clamped = secs.max(MIN_INTERVAL_SECS);
        if clamped != secs {
            tracing::warn!(
                requested = secs,
                clamped,
                "refresh interval below floor; clamping"
            );
        }
        runtime_config::store_interval_secs(&self.inner.pool, clamped).await?;
        self.inner.interval_tx.send_replace(clamped);
        Ok(clamped)
    }

    /// Spawns the background timer loop. The loop never exits on cycle
    /// failure; only `stop` (or dropping the runtime) ends it.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut interval_rx = scheduler.inner.interval_tx.subscribe();
            let mut shutdown_rx = scheduler.inner.shutdown_tx.subscribe();

            tracing::info!(
                interval_secs = *interval_rx.borrow(),
                "refresh scheduler started"
            );

            loop {
                let secs = *interval_rx.borrow();
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                        match scheduler.run_once(CycleMode::Gated).await {
                            Ok(outcome) => {
                                tracing::info!(?outcome, "scheduled cycle finished");
                            }
                            Err(err) => {
                                tracing::error!(error = %err, "scheduled cycle failed; will retry on next fire");
                            }
                        }
                    }
                    changed = interval_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        tracing::info!(
                            interval_secs = *interval_rx.borrow(),
                            "refresh interval rescheduled"
                        );
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            tracing::info!("refresh scheduler stopped");
        })
    }

    pub fn stop(&self) {
        self.inner.shutdown_tx.send_replace(true);
    }

    /// Runs one cycle immediately, bypassing the trading-hours gate. Returns
    /// `Busy` without queueing when a cycle is already in flight.
    pub async fn trigger_now(&self) -> anyhow::Result<CycleOutcome> {
        self.run_once(CycleMode::Forced).await
    }

    async fn run_once(&self, mode: CycleMode) -> anyhow::Result<CycleOutcome> {
        let Ok(_guard) = self.inner.cycle_guard.try_lock() else {
            tracing::info!(?mode, "cycle already in flight; coalescing");
            return Ok(CycleOutcome::Busy);
        };

        let cycle_id = Uuid::new_v4();
        let started_at = Utc::now();

        let result = self.run_cycle(mode, cycle_id).await;
        if let Err(err) = &result {
            // The transaction already rolled back; leave a failure audit row
            // so the gap in the series is explainable.
            if let Err(audit_err) = snapshots::record_cycle_failure(
                &self.inner.pool,
                cycle_id,
                started_at,
                &format!("{err:#}"),
            )
            .await
            {
                tracing::warn!(%cycle_id, error = %audit_err, "failed to record cycle failure");
            }
        }
        result
    }

    async fn run_cycle(&self, mode: CycleMode, cycle_id: Uuid) -> anyhow::Result<CycleOutcome> {
        let pool = &self.inner.pool;
        let now = Utc::now();

        let target_funds = match mode {
            CycleMode::Forced => funds::list_funds(pool).await?,
            CycleMode::Gated => {
                if cn_market::is_trading_now(now) {
                    funds::list_funds(pool).await?
                } else if cn_market::is_after_close(now) {
                    let latest = snapshots::latest_snapshot_times(pool).await?;
                    let due = cn_market::funds_needing_close_snapshot(now, &latest);
                    if due.is_empty() {
                        return Ok(CycleOutcome::Skipped(SkipReason::AllFundsCurrent));
                    }
                    tracing::info!(
                        %cycle_id,
                        due = due.len(),
                        "post-close mode: completing end-of-day snapshots"
                    );
                    let all = funds::list_funds(pool).await?;
                    all.into_iter().filter(|f| due.contains(&f.id)).collect()
                } else {
                    return Ok(CycleOutcome::Skipped(SkipReason::OutsideSession));
                }
            }
        };

        if target_funds.is_empty() {
            return Ok(CycleOutcome::Skipped(SkipReason::NothingTracked));
        }

        // Union of all target funds' holdings, plus per-fund allocations.
        let mut all_symbols: Vec<String> = Vec::new();
        let mut security_ids: HashMap<String, i64> = HashMap::new();
        let mut fund_allocations: HashMap<i64, Vec<(String, f64)>> = HashMap::new();

        for fund in &target_funds {
            let rows = funds::fund_holdings_with_securities(pool, fund.id).await?;
            let mut allocation = Vec::with_capacity(rows.len());
            for (security, weight) in rows {
                all_symbols.push(security.code.clone());
                security_ids.insert(security.code.clone(), security.id);
                allocation.push((security.code, weight));
            }
            fund_allocations.insert(fund.id, allocation);
        }

        if all_symbols.is_empty() {
            return Ok(CycleOutcome::Skipped(SkipReason::NothingTracked));
        }

        let quotes = self.inner.quotes.batch(&all_symbols).await;
        if quotes.is_empty() {
            tracing::warn!(%cycle_id, symbols = all_symbols.len(), "no quotes resolved; skipping cycle");
            return Ok(CycleOutcome::Skipped(SkipReason::NoQuotes));
        }

        // All snapshots of a cycle commit or roll back as one unit.
        let captured_at = Utc::now();
        let mut tx = pool.begin().await.context("begin cycle transaction failed")?;

        let mut funds_updated = 0usize;
        for fund in &target_funds {
            let allocation = fund_allocations.get(&fund.id).map(Vec::as_slice).unwrap_or(&[]);
            if allocation.is_empty() {
                continue;
            }
            let estimated = estimate_change(allocation, &quotes);
            snapshots::insert_fund_snapshot(&mut tx, fund.id, estimated, captured_at).await?;
            funds_updated += 1;

            tracing::info!(
                %cycle_id,
                fund_code = %fund.code,
                estimated_change = estimated,
                "fund estimate"
            );
        }

        for (code, quote) in &quotes {
            if let Some(security_id) = security_ids.get(code) {
                let snapshot = SecuritySnapshot {
                    security_id: *security_id,
                    price: quote.price,
                    prev_close: quote.prev_close,
                    change_percent: quote.change_percent,
                    captured_at,
                };
                snapshots::insert_security_snapshot(&mut tx, &snapshot).await?;
            }
        }

        snapshots::record_cycle_success(&mut tx, cycle_id, now, funds_updated, quotes.len())
            .await?;
        tx.commit().await.context("commit cycle transaction failed")?;

        Ok(CycleOutcome::Updated {
            funds_updated,
            quotes_fetched: quotes.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::storage::test_pool;

    fn test_settings() -> Settings {
        Settings {
            database_url: None,
            quote_base_url: "http://127.0.0.1:9".to_string(),
            holdings_base_url: "http://127.0.0.1:9".to_string(),
            fund_search_base_url: "http://127.0.0.1:9".to_string(),
            sentry_dsn: None,
        }
    }

    async fn test_scheduler() -> RefreshScheduler {
        let pool = test_pool().await;
        let quotes = QuoteClient::from_settings(&test_settings()).unwrap();
        RefreshScheduler::new(pool, quotes).await.unwrap()
    }

    #[tokio::test]
    async fn forced_cycle_with_nothing_tracked_skips() {
        let scheduler = test_scheduler().await;
        let outcome = scheduler.trigger_now().await.unwrap();
        assert_eq!(outcome, CycleOutcome::Skipped(SkipReason::NothingTracked));
    }

    #[tokio::test]
    async fn fund_without_holdings_skips_before_fetching() {
        let scheduler = test_scheduler().await;
        crate::storage::funds::insert_fund(&scheduler.inner.pool, "161725", "a")
            .await
            .unwrap();
        // No holdings yet, so the cycle ends before any quote request.
        let outcome = scheduler.trigger_now().await.unwrap();
        assert_eq!(outcome, CycleOutcome::Skipped(SkipReason::NothingTracked));
    }

    #[tokio::test]
    async fn concurrent_trigger_is_coalesced() {
        let scheduler = test_scheduler().await;
        let _guard = scheduler.inner.cycle_guard.lock().await;
        let outcome = scheduler.trigger_now().await.unwrap();
        assert_eq!(outcome, CycleOutcome::Busy);
    }

    #[tokio::test]
    async fn interval_is_clamped_and_persisted() {
        let scheduler = test_scheduler().await;
        assert_eq!(scheduler.interval_secs(), DEFAULT_INTERVAL_SECS);

        assert_eq!(scheduler.set_interval_secs(10).await.unwrap(), 30);
        assert_eq!(scheduler.interval_secs(), 30);

        assert_eq!(scheduler.set_interval_secs(90).await.unwrap(), 90);
        let stored =
            runtime_config::load_interval_secs(&scheduler.inner.pool, MIN_INTERVAL_SECS, 0)
                .await
                .unwrap();
        assert_eq!(stored, 90);
    }
}
