//! Fund registration and holdings refresh: the persistence boundary of the
//! holdings resolver.

use crate::domain::{is_placeholder_name, validate_fund_code, Fund};
use crate::ingest::holdings::HoldingsResolver;
use crate::storage::funds;
use sqlx::SqlitePool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The resolver yielded holdings; the fund's set was replaced.
    Replaced { holdings: usize },
    /// Only a display name came back; existing holdings were left untouched.
    NameOnly,
    /// Every source came up empty.
    NoData,
}

/// Registers a fund by code: resolves its holdings and name, then persists
/// both. Returns `Ok(None)` when no upstream source knows the code.
pub async fn add_fund(
    pool: &SqlitePool,
    resolver: &HoldingsResolver,
    code: &str,
) -> anyhow::Result<Option<Fund>> {
    let code = validate_fund_code(code)?;

    let Some(result) = resolver.resolve(code).await else {
        return Ok(None);
    };

    let fund = funds::insert_fund(pool, code, &result.name).await?;
    funds::replace_holdings(pool, fund.id, &result.holdings).await?;

    tracing::info!(
        fund_code = %code,
        fund_name = %result.name,
        holdings = result.holdings.len(),
        "fund registered"
    );
    Ok(Some(fund))
}

/// Re-resolves a tracked fund's holdings. A result that carries holdings is
/// authoritative and replaces the stored set; a name-only result never
/// overwrites previously known holdings.
pub async fn refresh_holdings(
    pool: &SqlitePool,
    resolver: &HoldingsResolver,
    fund: &Fund,
) -> anyhow::Result<RefreshOutcome> {
    let Some(result) = resolver.resolve(&fund.code).await else {
        return Ok(RefreshOutcome::NoData);
    };

    if !is_placeholder_name(&result.name, &fund.code) && result.name != fund.name {
        funds::update_fund_name(pool, fund.id, &result.name).await?;
    }

    if result.holdings.is_empty() {
        return Ok(RefreshOutcome::NameOnly);
    }

    funds::replace_holdings(pool, fund.id, &result.holdings).await?;
    Ok(RefreshOutcome::Replaced {
        holdings: result.holdings.len(),
    })
}
