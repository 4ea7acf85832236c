use crate::ingest::types::Quote;
use std::collections::HashMap;

/// Ratio-weighted estimate of a fund's live change, in percent.
///
/// `holdings` is the fund's (symbol, weight) allocation with weights as
/// fractions in [0, 1]. Holdings whose symbol has no quote contribute zero.
/// The result is a partial weighted sum over the covered holdings and is
/// deliberately not renormalized by the covered-weight fraction; missing
/// quotes understate the estimate.
pub fn estimate_change(holdings: &[(String, f64)], quotes: &HashMap<String, Quote>) -> f64 {
    let mut total = 0.0;
    for (symbol, weight) in holdings {
        match quotes.get(symbol) {
            Some(quote) => total += quote.change_percent * weight,
            None => {
                tracing::debug!(
                    security = %symbol,
                    weight,
                    "no quote for holding; contributes zero to estimate"
                );
            }
        }
    }
    round2(total)
}

pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn holding(code: &str, weight: f64) -> (String, f64) {
        (code.to_string(), weight)
    }

    fn quote(change_percent: f64) -> Quote {
        Quote {
            name: "q".to_string(),
            price: 0.0,
            prev_close: 0.0,
            change_percent,
        }
    }

    #[test]
    fn weights_each_covered_holding() {
        let holdings = vec![holding("A", 0.5), holding("B", 0.25)];
        let quotes = HashMap::from([
            ("A".to_string(), quote(2.0)),
            ("B".to_string(), quote(-4.0)),
        ]);
        assert_eq!(estimate_change(&holdings, &quotes), 0.0);
    }

    #[test]
    fn missing_quote_contributes_zero_without_renormalizing() {
        let holdings = vec![holding("A", 0.5), holding("B", 0.5)];
        let quotes = HashMap::from([("A".to_string(), quote(2.0))]);
        // 0.5 * 2.0 + 0.5 * 0, not renormalized to 2.0.
        assert_eq!(estimate_change(&holdings, &quotes), 1.0);
    }

    #[test]
    fn linear_in_each_weight() {
        let quotes = HashMap::from([("A".to_string(), quote(3.0))]);
        let base = estimate_change(&[holding("A", 0.2)], &quotes);
        let doubled = estimate_change(&[holding("A", 0.4)], &quotes);
        // Doubling the weight doubles the contribution.
        assert_eq!(doubled, 2.0 * base);
    }

    #[test]
    fn rounds_to_two_decimals() {
        let holdings = vec![holding("A", 0.333)];
        let quotes = HashMap::from([("A".to_string(), quote(1.0))]);
        assert_eq!(estimate_change(&holdings, &quotes), 0.33);
    }

    #[test]
    fn empty_holdings_estimate_is_zero() {
        assert_eq!(estimate_change(&[], &HashMap::new()), 0.0);
    }
}
