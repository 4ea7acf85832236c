use anyhow::Context;
use chrono::Utc;
use sqlx::SqlitePool;

pub const INTERVAL_KEY: &str = "refresh_interval_secs";

pub async fn get(pool: &SqlitePool, key: &str) -> anyhow::Result<Option<String>> {
    sqlx::query_scalar::<_, String>("SELECT value FROM runtime_config WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await
        .context("select runtime_config failed")
}

pub async fn set(pool: &SqlitePool, key: &str, value: &str) -> anyhow::Result<()> {
    sqlx::query(
        "INSERT INTO runtime_config (key, value, updated_at) VALUES (?, ?, ?) \
         ON CONFLICT (key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
    )
    .bind(key)
    .bind(value)
    .bind(Utc::now())
    .execute(pool)
    .await
    .context("upsert runtime_config failed")?;
    Ok(())
}

/// The persisted scheduler interval, clamped to the floor, or `default` when
/// unset or unparsable.
pub async fn load_interval_secs(
    pool: &SqlitePool,
    floor: u64,
    default: u64,
) -> anyhow::Result<u64> {
    let stored = get(pool, INTERVAL_KEY).await?;
    Ok(stored
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(default)
        .max(floor))
}

pub async fn store_interval_secs(pool: &SqlitePool, secs: u64) -> anyhow::Result<()> {
    set(pool, INTERVAL_KEY, &secs.to_string()).await
}
