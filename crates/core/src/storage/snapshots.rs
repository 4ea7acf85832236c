use crate::domain::{FundSnapshot, SecuritySnapshot};
use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::{Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

pub async fn insert_fund_snapshot(
    tx: &mut Transaction<'_, Sqlite>,
    fund_id: i64,
    estimated_change: f64,
    captured_at: DateTime<Utc>,
) -> anyhow::Result<()> {
    sqlx::query(
        "INSERT INTO fund_snapshots (fund_id, estimated_change, captured_at) VALUES (?, ?, ?)",
    )
    .bind(fund_id)
    .bind(estimated_change)
    .bind(captured_at)
    .execute(&mut **tx)
    .await
    .context("insert fund_snapshots failed")?;
    Ok(())
}

pub async fn insert_security_snapshot(
    tx: &mut Transaction<'_, Sqlite>,
    snapshot: &SecuritySnapshot,
) -> anyhow::Result<()> {
    sqlx::query(
        "INSERT INTO security_snapshots (security_id, price, prev_close, change_percent, captured_at) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(snapshot.security_id)
    .bind(snapshot.price)
    .bind(snapshot.prev_close)
    .bind(snapshot.change_percent)
    .bind(snapshot.captured_at)
    .execute(&mut **tx)
    .await
    .context("insert security_snapshots failed")?;
    Ok(())
}

/// Audit row for a completed cycle, written inside the cycle's transaction
/// so it commits or rolls back with the snapshots.
pub async fn record_cycle_success(
    tx: &mut Transaction<'_, Sqlite>,
    cycle_id: Uuid,
    started_at: DateTime<Utc>,
    funds_updated: usize,
    quotes_fetched: usize,
) -> anyhow::Result<()> {
    sqlx::query(
        "INSERT INTO refresh_cycles (id, started_at, status, funds_updated, quotes_fetched) \
         VALUES (?, ?, 'success', ?, ?)",
    )
    .bind(cycle_id.to_string())
    .bind(started_at)
    .bind(funds_updated as i64)
    .bind(quotes_fetched as i64)
    .execute(&mut **tx)
    .await
    .context("insert refresh_cycles failed")?;
    Ok(())
}

/// Best-effort failure audit row, written outside any transaction after a
/// cycle rolled back.
pub async fn record_cycle_failure(
    pool: &SqlitePool,
    cycle_id: Uuid,
    started_at: DateTime<Utc>,
    error: &str,
) -> anyhow::Result<()> {
    sqlx::query(
        "INSERT INTO refresh_cycles (id, started_at, status, error) \
         VALUES (?, ?, 'error', ?)",
    )
    .bind(cycle_id.to_string())
    .bind(started_at)
    .bind(error)
    .execute(pool)
    .await
    .context("insert error refresh_cycles failed")?;
    Ok(())
}

pub async fn latest_fund_snapshot(
    pool: &SqlitePool,
    fund_id: i64,
) -> anyhow::Result<Option<FundSnapshot>> {
    sqlx::query_as::<_, FundSnapshot>(
        "SELECT fund_id, estimated_change, captured_at FROM fund_snapshots \
         WHERE fund_id = ? \
         ORDER BY captured_at DESC, id DESC \
         LIMIT 1",
    )
    .bind(fund_id)
    .fetch_optional(pool)
    .await
    .context("select latest fund snapshot failed")
}

/// Snapshot series for one fund since `since`, oldest first.
pub async fn fund_history_since(
    pool: &SqlitePool,
    fund_id: i64,
    since: DateTime<Utc>,
) -> anyhow::Result<Vec<FundSnapshot>> {
    sqlx::query_as::<_, FundSnapshot>(
        "SELECT fund_id, estimated_change, captured_at FROM fund_snapshots \
         WHERE fund_id = ? AND captured_at >= ? \
         ORDER BY captured_at ASC, id ASC",
    )
    .bind(fund_id)
    .bind(since)
    .fetch_all(pool)
    .await
    .context("select fund history failed")
}

/// Every tracked fund with the time of its most recent snapshot, `None` for
/// funds that have never been snapshotted. Feeds the post-close dedup check.
pub async fn latest_snapshot_times(
    pool: &SqlitePool,
) -> anyhow::Result<Vec<(i64, Option<DateTime<Utc>>)>> {
    sqlx::query_as::<_, (i64, Option<DateTime<Utc>>)>(
        "SELECT f.id, MAX(s.captured_at) \
         FROM funds f LEFT JOIN fund_snapshots s ON s.fund_id = f.id \
         GROUP BY f.id \
         ORDER BY f.id ASC",
    )
    .fetch_all(pool)
    .await
    .context("select latest snapshot times failed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::types::HoldingEntry;
    use crate::storage::funds::{fund_holdings_with_securities, insert_fund, replace_holdings};
    use crate::storage::test_pool;
    use chrono::Duration;

    #[tokio::test]
    async fn append_and_read_back_history() {
        let pool = test_pool().await;
        let fund = insert_fund(&pool, "161725", "a").await.unwrap();

        let t0 = Utc::now();
        let mut tx = pool.begin().await.unwrap();
        insert_fund_snapshot(&mut tx, fund.id, 1.23, t0).await.unwrap();
        insert_fund_snapshot(&mut tx, fund.id, -0.5, t0 + Duration::minutes(5))
            .await
            .unwrap();
        record_cycle_success(&mut tx, Uuid::new_v4(), t0, 1, 2).await.unwrap();
        tx.commit().await.unwrap();

        let latest = latest_fund_snapshot(&pool, fund.id).await.unwrap().unwrap();
        assert_eq!(latest.estimated_change, -0.5);

        let history = fund_history_since(&pool, fund.id, t0).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].estimated_change, 1.23);
    }

    #[tokio::test]
    async fn security_snapshots_reference_upserted_securities() {
        let pool = test_pool().await;
        let fund = insert_fund(&pool, "161725", "a").await.unwrap();
        let entries = vec![HoldingEntry {
            code: "600519".to_string(),
            name: "贵州茅台".to_string(),
            weight: 0.1,
        }];
        replace_holdings(&pool, fund.id, &entries).await.unwrap();

        let (security, _) = fund_holdings_with_securities(&pool, fund.id)
            .await
            .unwrap()
            .remove(0);

        let mut tx = pool.begin().await.unwrap();
        insert_security_snapshot(
            &mut tx,
            &SecuritySnapshot {
                security_id: security.id,
                price: 1707.0,
                prev_close: 1690.0,
                change_percent: 1.01,
                captured_at: Utc::now(),
            },
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM security_snapshots WHERE security_id = ?",
        )
        .bind(security.id)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn rollback_discards_the_whole_cycle() {
        let pool = test_pool().await;
        let fund = insert_fund(&pool, "161725", "a").await.unwrap();

        {
            let mut tx = pool.begin().await.unwrap();
            insert_fund_snapshot(&mut tx, fund.id, 9.99, Utc::now()).await.unwrap();
            // Dropped without commit.
        }

        assert!(latest_fund_snapshot(&pool, fund.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn latest_times_cover_unsnapshotted_funds() {
        let pool = test_pool().await;
        let a = insert_fund(&pool, "161725", "a").await.unwrap();
        let b = insert_fund(&pool, "110011", "b").await.unwrap();

        let t = Utc::now();
        let mut tx = pool.begin().await.unwrap();
        insert_fund_snapshot(&mut tx, a.id, 0.1, t).await.unwrap();
        tx.commit().await.unwrap();

        let times = latest_snapshot_times(&pool).await.unwrap();
        assert_eq!(times.len(), 2);
        let by_id: std::collections::HashMap<_, _> = times.into_iter().collect();
        assert!(by_id[&a.id].is_some());
        assert!(by_id[&b.id].is_none());
    }
}
