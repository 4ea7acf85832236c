use crate::domain::{Fund, Holding, Security};
use crate::ingest::types::HoldingEntry;
use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

pub async fn insert_fund(pool: &SqlitePool, code: &str, name: &str) -> anyhow::Result<Fund> {
    let now: DateTime<Utc> = Utc::now();
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO funds (code, name, created_at, updated_at) \
         VALUES (?, ?, ?, ?) \
         RETURNING id",
    )
    .bind(code)
    .bind(name)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await
    .context("insert funds failed")?;

    Ok(Fund {
        id,
        code: code.to_string(),
        name: name.to_string(),
        created_at: now,
        updated_at: now,
    })
}

pub async fn get_fund(pool: &SqlitePool, fund_id: i64) -> anyhow::Result<Option<Fund>> {
    sqlx::query_as::<_, Fund>(
        "SELECT id, code, name, created_at, updated_at FROM funds WHERE id = ?",
    )
    .bind(fund_id)
    .fetch_optional(pool)
    .await
    .context("select fund failed")
}

pub async fn get_fund_by_code(pool: &SqlitePool, code: &str) -> anyhow::Result<Option<Fund>> {
    sqlx::query_as::<_, Fund>(
        "SELECT id, code, name, created_at, updated_at FROM funds WHERE code = ?",
    )
    .bind(code)
    .fetch_optional(pool)
    .await
    .context("select fund by code failed")
}

pub async fn list_funds(pool: &SqlitePool) -> anyhow::Result<Vec<Fund>> {
    sqlx::query_as::<_, Fund>(
        "SELECT id, code, name, created_at, updated_at FROM funds \
         ORDER BY created_at DESC, id DESC",
    )
    .fetch_all(pool)
    .await
    .context("list funds failed")
}

pub async fn delete_fund(pool: &SqlitePool, fund_id: i64) -> anyhow::Result<bool> {
    let res = sqlx::query("DELETE FROM funds WHERE id = ?")
        .bind(fund_id)
        .execute(pool)
        .await
        .context("delete fund failed")?;
    Ok(res.rows_affected() > 0)
}

pub async fn update_fund_name(pool: &SqlitePool, fund_id: i64, name: &str) -> anyhow::Result<()> {
    sqlx::query("UPDATE funds SET name = ?, updated_at = ? WHERE id = ?")
        .bind(name)
        .bind(Utc::now())
        .bind(fund_id)
        .execute(pool)
        .await
        .context("update fund name failed")?;
    Ok(())
}

/// Replaces a fund's entire holdings set in one transaction: securities are
/// upserted, the previous rows deleted, the new rows inserted in upstream
/// order. A refresh that reports M holdings leaves exactly M rows, never a
/// partial merge.
pub async fn replace_holdings(
    pool: &SqlitePool,
    fund_id: i64,
    entries: &[HoldingEntry],
) -> anyhow::Result<()> {
    let now: DateTime<Utc> = Utc::now();
    let mut tx = pool.begin().await.context("begin transaction failed")?;

    sqlx::query("DELETE FROM holdings WHERE fund_id = ?")
        .bind(fund_id)
        .execute(&mut *tx)
        .await
        .context("delete prior holdings failed")?;

    for (position, entry) in entries.iter().enumerate() {
        let security_id: i64 = sqlx::query_scalar(
            "INSERT INTO securities (code, name, created_at) VALUES (?, ?, ?) \
             ON CONFLICT (code) DO UPDATE SET name = excluded.name \
             RETURNING id",
        )
        .bind(&entry.code)
        .bind(&entry.name)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .context("upsert security failed")?;

        sqlx::query(
            "INSERT INTO holdings (fund_id, security_id, position, weight, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(fund_id)
        .bind(security_id)
        .bind(position as i64)
        .bind(entry.weight)
        .bind(now)
        .execute(&mut *tx)
        .await
        .context("insert holding failed")?;
    }

    sqlx::query("UPDATE funds SET updated_at = ? WHERE id = ?")
        .bind(now)
        .bind(fund_id)
        .execute(&mut *tx)
        .await
        .context("touch fund failed")?;

    tx.commit().await.context("commit transaction failed")?;
    Ok(())
}

/// A fund's holdings in upstream-reported order. Weight-descending sorting
/// is a presentation concern, not done here.
pub async fn fund_holdings(pool: &SqlitePool, fund_id: i64) -> anyhow::Result<Vec<Holding>> {
    let rows = sqlx::query_as::<_, (String, String, f64)>(
        "SELECT s.code, s.name, h.weight \
         FROM holdings h JOIN securities s ON s.id = h.security_id \
         WHERE h.fund_id = ? \
         ORDER BY h.position ASC",
    )
    .bind(fund_id)
    .fetch_all(pool)
    .await
    .context("select holdings failed")?;

    Ok(rows
        .into_iter()
        .map(|(security_code, security_name, weight)| Holding {
            security_code,
            security_name,
            weight,
        })
        .collect())
}

/// Holdings rows joined with their securities, for snapshot writes.
pub async fn fund_holdings_with_securities(
    pool: &SqlitePool,
    fund_id: i64,
) -> anyhow::Result<Vec<(Security, f64)>> {
    let rows = sqlx::query_as::<_, (i64, String, String, f64)>(
        "SELECT s.id, s.code, s.name, h.weight \
         FROM holdings h JOIN securities s ON s.id = h.security_id \
         WHERE h.fund_id = ? \
         ORDER BY h.position ASC",
    )
    .bind(fund_id)
    .fetch_all(pool)
    .await
    .context("select holdings with securities failed")?;

    Ok(rows
        .into_iter()
        .map(|(id, code, name, weight)| (Security { id, code, name }, weight))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_pool;

    fn entry(code: &str, weight: f64) -> HoldingEntry {
        HoldingEntry {
            code: code.to_string(),
            name: format!("security {code}"),
            weight,
        }
    }

    #[tokio::test]
    async fn replace_leaves_exactly_the_new_set() {
        let pool = test_pool().await;
        let fund = insert_fund(&pool, "161725", "基金161725").await.unwrap();

        let first = vec![entry("600519", 0.1), entry("000858", 0.08), entry("000568", 0.07)];
        replace_holdings(&pool, fund.id, &first).await.unwrap();
        assert_eq!(fund_holdings(&pool, fund.id).await.unwrap().len(), 3);

        let second = vec![entry("600519", 0.12), entry("002304", 0.05)];
        replace_holdings(&pool, fund.id, &second).await.unwrap();

        let holdings = fund_holdings(&pool, fund.id).await.unwrap();
        // Exactly M rows after an N-then-M refresh, in upstream order.
        assert_eq!(holdings.len(), 2);
        assert_eq!(holdings[0].security_code, "600519");
        assert_eq!(holdings[0].weight, 0.12);
        assert_eq!(holdings[1].security_code, "002304");
    }

    #[tokio::test]
    async fn securities_are_shared_across_funds() {
        let pool = test_pool().await;
        let a = insert_fund(&pool, "161725", "a").await.unwrap();
        let b = insert_fund(&pool, "110011", "b").await.unwrap();

        replace_holdings(&pool, a.id, &[entry("600519", 0.1)]).await.unwrap();
        replace_holdings(&pool, b.id, &[entry("600519", 0.2)]).await.unwrap();

        let rows_a = fund_holdings_with_securities(&pool, a.id).await.unwrap();
        let rows_b = fund_holdings_with_securities(&pool, b.id).await.unwrap();
        assert_eq!(rows_a[0].0.id, rows_b[0].0.id);
        assert_eq!(rows_a[0].0.code, "600519");
    }

    #[tokio::test]
    async fn duplicate_fund_code_is_rejected() {
        let pool = test_pool().await;
        insert_fund(&pool, "161725", "a").await.unwrap();
        assert!(insert_fund(&pool, "161725", "b").await.is_err());
    }

    #[tokio::test]
    async fn delete_cascades_holdings() {
        let pool = test_pool().await;
        let fund = insert_fund(&pool, "161725", "a").await.unwrap();
        replace_holdings(&pool, fund.id, &[entry("600519", 0.1)]).await.unwrap();

        assert!(delete_fund(&pool, fund.id).await.unwrap());
        assert!(get_fund(&pool, fund.id).await.unwrap().is_none());

        let orphans: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM holdings")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(orphans, 0);
    }
}
