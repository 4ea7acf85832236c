use anyhow::ensure;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A tracked mutual fund. Its live valuation is estimated from the weighted
/// change of its top holdings, never observed directly.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Fund {
    pub id: i64,
    pub code: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Security {
    pub id: i64,
    pub code: String,
    pub name: String,
}

/// One weighted allocation of a fund into a security. `weight` is the
/// allocation fraction in [0, 1]; presentation-layer percentages are the
/// caller's concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Holding {
    pub security_code: String,
    pub security_name: String,
    pub weight: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FundSnapshot {
    pub fund_id: i64,
    pub estimated_change: f64,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SecuritySnapshot {
    pub security_id: i64,
    pub price: f64,
    pub prev_close: f64,
    pub change_percent: f64,
    pub captured_at: DateTime<Utc>,
}

/// Fund codes are fixed-length numeric strings. Rejecting malformed codes
/// here keeps every downstream component free of input validation.
pub fn validate_fund_code(code: &str) -> anyhow::Result<&str> {
    let code = code.trim();
    ensure!(
        code.len() == 6 && code.bytes().all(|b| b.is_ascii_digit()),
        "fund code must be a 6-digit numeric string (got {code:?})"
    );
    Ok(code)
}

/// Display name used until the real fund name has been resolved upstream.
pub fn placeholder_name(code: &str) -> String {
    format!("基金{code}")
}

pub fn is_placeholder_name(name: &str, code: &str) -> bool {
    let name = name.trim();
    name.is_empty() || name == placeholder_name(code)
}
