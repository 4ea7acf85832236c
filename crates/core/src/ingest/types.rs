use serde::{Deserialize, Serialize};

/// One row of a fund's reported top-holdings table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HoldingEntry {
    pub code: String,
    pub name: String,
    /// Allocation fraction in [0, 1].
    pub weight: f64,
}

/// Result of a holdings-source attempt: a best-effort display name and the
/// holdings rows in upstream-reported order (possibly empty for name-only
/// sources).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HoldingsResult {
    pub code: String,
    pub name: String,
    pub holdings: Vec<HoldingEntry>,
}

/// A point-in-time price observation for one security.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub name: String,
    pub price: f64,
    pub prev_close: f64,
    pub change_percent: f64,
}
