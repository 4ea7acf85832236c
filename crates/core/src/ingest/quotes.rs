use crate::config::Settings;
use crate::estimate::round2;
use crate::ingest::types::Quote;
use anyhow::{Context, Result};
use encoding_rs::GBK;
use reqwest::header::{HeaderMap, HeaderValue};
use std::collections::HashMap;
use std::time::Duration;

const CHUNK_SIZE: usize = 50;
const DEFAULT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_CHUNK_DELAY_MS: u64 = 100;

/// Batched live-quote fetcher. Chunking bounds single-request size; requests
/// within a batch are sequential with a short courtesy delay between chunks.
#[derive(Debug, Clone)]
pub struct QuoteClient {
    http: reqwest::Client,
    base_url: String,
    chunk_delay: Duration,
}

impl QuoteClient {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let timeout_secs = std::env::var("QUOTE_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        let chunk_delay_ms = std::env::var("QUOTE_CHUNK_DELAY_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(DEFAULT_CHUNK_DELAY_MS)
            .max(DEFAULT_CHUNK_DELAY_MS);

        let mut headers = HeaderMap::new();
        headers.insert(
            "Referer",
            HeaderValue::from_static("http://finance.sina.com.cn"),
        );

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .default_headers(headers)
            .no_proxy()
            .build()
            .context("failed to build quote http client")?;

        Ok(Self {
            http,
            base_url: settings.quote_base_url.clone(),
            chunk_delay: Duration::from_millis(chunk_delay_ms),
        })
    }

    /// Fetches quotes for a set of raw security symbols. Symbols that cannot
    /// be resolved (unknown, suspended with no data, provider failure for
    /// their chunk) are omitted; a chunk-level failure never fails the batch.
    pub async fn batch(&self, symbols: &[String]) -> HashMap<String, Quote> {
        let mut unique: Vec<&str> = symbols.iter().map(String::as_str).collect();
        unique.sort_unstable();
        unique.dedup();

        let mut out = HashMap::new();
        for (idx, chunk) in unique.chunks(CHUNK_SIZE).enumerate() {
            if idx != 0 {
                tokio::time::sleep(self.chunk_delay).await;
            }
            match self.fetch_chunk(chunk).await {
                Ok(quotes) => out.extend(quotes),
                Err(err) => {
                    tracing::warn!(
                        chunk_idx = idx,
                        chunk_len = chunk.len(),
                        error = %err,
                        "quote chunk fetch failed; skipping chunk"
                    );
                }
            }
        }

        tracing::debug!(
            requested = unique.len(),
            resolved = out.len(),
            "quote batch complete"
        );
        out
    }

    async fn fetch_chunk(&self, symbols: &[&str]) -> Result<HashMap<String, Quote>> {
        let qualified: Vec<String> = symbols.iter().map(|s| qualify(s)).collect();
        let url = format!(
            "{}/list={}",
            self.base_url.trim_end_matches('/'),
            qualified.join(",")
        );

        let res = self
            .http
            .get(&url)
            .send()
            .await
            .context("quote request failed")?;

        let status = res.status();
        let bytes = res.bytes().await.context("failed to read quote response")?;
        if !status.is_success() {
            anyhow::bail!("quote provider HTTP {status}");
        }

        // The provider serves GBK regardless of request headers.
        let (text, _, _) = GBK.decode(&bytes);
        Ok(parse_quote_body(&text))
    }
}

/// Exchange prefix is a pure function of the symbol's first character:
/// 6xxxxx trades in Shanghai, 8xxxxx/4xxxxx in Beijing, the rest in Shenzhen.
pub fn exchange_prefix(symbol: &str) -> &'static str {
    match symbol.as_bytes().first() {
        Some(b'6') => "sh",
        Some(b'8') | Some(b'4') => "bj",
        _ => "sz",
    }
}

fn qualify(symbol: &str) -> String {
    format!("{}{}", exchange_prefix(symbol), symbol)
}

fn unqualify(qualified: &str) -> &str {
    qualified
        .strip_prefix("sh")
        .or_else(|| qualified.strip_prefix("sz"))
        .or_else(|| qualified.strip_prefix("bj"))
        .unwrap_or(qualified)
}

/// Parses the provider's line-oriented body. Each line is
/// `var hq_str_<qualified>="name,open,prev_close,price,...";` and lines with
/// an empty payload or fewer than 4 fields carry no usable data.
fn parse_quote_body(text: &str) -> HashMap<String, Quote> {
    let mut out = HashMap::new();
    for line in text.lines() {
        let Some((var_name, rest)) = line.split_once("=\"") else {
            continue;
        };
        let Some(qualified) = var_name.trim().rsplit("hq_str_").next() else {
            continue;
        };
        let payload = rest.trim().trim_end_matches(';').trim_end_matches('"');
        if payload.is_empty() {
            continue;
        }

        let fields: Vec<&str> = payload.split(',').collect();
        if fields.len() < 4 {
            continue;
        }

        let Some(prev_close) = parse_num(fields[2]) else {
            continue;
        };
        let Some(mut price) = parse_num(fields[3]) else {
            continue;
        };

        // A zero price with a positive previous close means "no trade yet";
        // treat the security as unchanged rather than dividing into an
        // artifact.
        if price == 0.0 && prev_close > 0.0 {
            price = prev_close;
        }
        if prev_close <= 0.0 {
            continue;
        }

        let change_percent = round2((price - prev_close) / prev_close * 100.0);
        out.insert(
            unqualify(qualified).to_string(),
            Quote {
                name: fields[0].to_string(),
                price,
                prev_close,
                change_percent,
            },
        );
    }
    out
}

fn parse_num(s: &str) -> Option<f64> {
    let t = s.trim();
    if t.is_empty() {
        return None;
    }
    t.parse::<f64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_follows_leading_digit() {
        assert_eq!(exchange_prefix("600519"), "sh");
        assert_eq!(exchange_prefix("000001"), "sz");
        assert_eq!(exchange_prefix("430047"), "bj");
        assert_eq!(exchange_prefix("830799"), "bj");
        assert_eq!(exchange_prefix("300750"), "sz");
    }

    #[test]
    fn qualify_is_invertible() {
        for code in ["600519", "000001", "430047"] {
            assert_eq!(unqualify(&qualify(code)), code);
        }
    }

    #[test]
    fn parses_quote_lines() {
        let body = "var hq_str_sh600519=\"贵州茅台,1700.00,1690.00,1707.00,1710.00,1688.00\";\n\
                    var hq_str_sz000001=\"平安银行,10.00,10.00,9.50,0,0\";\n";
        let map = parse_quote_body(body);
        assert_eq!(map.len(), 2);

        let q = &map["600519"];
        assert_eq!(q.name, "贵州茅台");
        assert_eq!(q.prev_close, 1690.00);
        assert_eq!(q.price, 1707.00);
        assert_eq!(q.change_percent, 1.01);

        assert_eq!(map["000001"].change_percent, -5.0);
    }

    #[test]
    fn zero_price_is_treated_as_unchanged() {
        let body = "var hq_str_sz000002=\"Foo,10.00,9.80,0.00,0,0\";";
        let map = parse_quote_body(body);
        let q = &map["000002"];
        assert_eq!(q.price, 9.80);
        assert_eq!(q.change_percent, 0.00);
    }

    #[test]
    fn price_equal_to_prev_close_is_flat() {
        let body = "var hq_str_sz000006=\"Foo,10.00,9.80,9.80,0,0\";";
        let map = parse_quote_body(body);
        assert_eq!(map["000006"].change_percent, 0.00);
    }

    #[test]
    fn skips_unusable_lines() {
        let body = "var hq_str_sz000003=\"\";\n\
                    var hq_str_sz000004=\"Foo,1.0\";\n\
                    var hq_str_sz000005=\"Bar,0,0,1.0\";\n\
                    not a quote line\n";
        let map = parse_quote_body(body);
        // Empty payload, too few fields, and non-positive prev_close are all
        // omitted rather than erroring.
        assert!(map.is_empty());
    }
}
