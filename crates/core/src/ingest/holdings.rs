use crate::config::Settings;
use crate::domain::{is_placeholder_name, placeholder_name};
use crate::ingest::types::{HoldingEntry, HoldingsResult};
use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue};
use scraper::{Html, Selector};
use serde::Deserialize;
use std::time::Duration;

const DEFAULT_TIMEOUT_SECS: u64 = 8;
const MAX_HOLDINGS: usize = 10;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

/// One way of obtaining a fund's holdings (or at least its display name).
/// Sources are tried in order; returning `Ok(None)` means "nothing found
/// here", and errors are treated the same way by the resolver.
#[async_trait::async_trait]
pub trait HoldingsSource: Send + Sync {
    fn source_name(&self) -> &'static str;

    async fn try_fetch(&self, fund_code: &str) -> Result<Option<HoldingsResult>>;
}

/// Ordered strategy chain over upstream holdings sources, with a final
/// name-resolution pass through the fund search endpoint.
pub struct HoldingsResolver {
    sources: Vec<Box<dyn HoldingsSource>>,
    search: FundSearchClient,
}

impl HoldingsResolver {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let http = build_http_client()?;
        let sources: Vec<Box<dyn HoldingsSource>> = vec![
            Box::new(ArchiveApiSource {
                http: http.clone(),
                base_url: settings.holdings_base_url.clone(),
            }),
            Box::new(DetailPageSource {
                http: http.clone(),
                base_url: settings.holdings_base_url.clone(),
            }),
        ];

        Ok(Self {
            sources,
            search: FundSearchClient {
                http,
                base_url: settings.fund_search_base_url.clone(),
            },
        })
    }

    /// Tries each source in order; the first result that actually carries
    /// holdings wins. A name-only result is kept as a fallback so the caller
    /// still learns the fund's display name when no source has holdings.
    /// Returns `None` only when every source came up empty.
    pub async fn resolve(&self, fund_code: &str) -> Option<HoldingsResult> {
        let mut name_only: Option<HoldingsResult> = None;

        for source in &self.sources {
            match source.try_fetch(fund_code).await {
                Ok(Some(result)) if !result.holdings.is_empty() => {
                    tracing::info!(
                        %fund_code,
                        source = source.source_name(),
                        holdings = result.holdings.len(),
                        "holdings resolved"
                    );
                    return Some(self.with_resolved_name(result).await);
                }
                Ok(Some(result)) => {
                    if name_only.is_none() {
                        name_only = Some(result);
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(
                        %fund_code,
                        source = source.source_name(),
                        error = %err,
                        "holdings source failed; trying next"
                    );
                }
            }
        }

        match name_only {
            Some(result) => Some(self.with_resolved_name(result).await),
            None => None,
        }
    }

    async fn with_resolved_name(&self, mut result: HoldingsResult) -> HoldingsResult {
        if !is_placeholder_name(&result.name, &result.code) {
            return result;
        }
        match self.search.lookup_name(&result.code).await {
            Ok(Some(name)) => {
                tracing::info!(fund_code = %result.code, %name, "fund name resolved via search");
                result.name = name;
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(fund_code = %result.code, error = %err, "fund name lookup failed");
            }
        }
        result
    }
}

fn build_http_client() -> Result<reqwest::Client> {
    let timeout_secs = std::env::var("HOLDINGS_TIMEOUT_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(DEFAULT_TIMEOUT_SECS);

    let mut headers = HeaderMap::new();
    headers.insert(
        "Referer",
        HeaderValue::from_static("http://fundf10.eastmoney.com/"),
    );

    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(Duration::from_secs(timeout_secs))
        .default_headers(headers)
        .no_proxy()
        .build()
        .context("failed to build holdings http client")
}

/// Primary source: the archives endpoint returns a JavaScript-like payload
/// with the holdings table embedded as escaped HTML in a `content:"…"`
/// field.
struct ArchiveApiSource {
    http: reqwest::Client,
    base_url: String,
}

#[async_trait::async_trait]
impl HoldingsSource for ArchiveApiSource {
    fn source_name(&self) -> &'static str {
        "archive_api"
    }

    async fn try_fetch(&self, fund_code: &str) -> Result<Option<HoldingsResult>> {
        let url = format!(
            "{}/FundArchivesDatas.aspx",
            self.base_url.trim_end_matches('/')
        );

        let res = self
            .http
            .get(&url)
            .query(&[
                ("type", "jjcc"),
                ("code", fund_code),
                ("topline", "10"),
                ("year", ""),
                ("month", ""),
            ])
            .send()
            .await
            .context("archive request failed")?;

        let status = res.status();
        if !status.is_success() {
            anyhow::bail!("archive endpoint HTTP {status}");
        }
        let text = res
            .text()
            .await
            .context("failed to read archive response")?;

        let Some(fragment) = extract_embedded_fragment(&text) else {
            return Ok(None);
        };

        let holdings = parse_holdings_fragment(&unescape_fragment(&fragment));
        if holdings.is_empty() {
            return Ok(None);
        }

        Ok(Some(HoldingsResult {
            code: fund_code.to_string(),
            name: placeholder_name(fund_code),
            holdings,
        }))
    }
}

/// Fallback source: the static fund detail page. Holdings there are rendered
/// client-side, so only a best-effort display name can be extracted.
struct DetailPageSource {
    http: reqwest::Client,
    base_url: String,
}

#[async_trait::async_trait]
impl HoldingsSource for DetailPageSource {
    fn source_name(&self) -> &'static str {
        "detail_page"
    }

    async fn try_fetch(&self, fund_code: &str) -> Result<Option<HoldingsResult>> {
        let url = format!(
            "{}/ccmx_{}.html",
            self.base_url.trim_end_matches('/'),
            fund_code
        );

        let res = self
            .http
            .get(&url)
            .send()
            .await
            .context("detail page request failed")?;

        let status = res.status();
        if !status.is_success() {
            anyhow::bail!("detail page HTTP {status}");
        }
        let text = res
            .text()
            .await
            .context("failed to read detail page")?;

        let name =
            extract_detail_page_name(&text).unwrap_or_else(|| placeholder_name(fund_code));

        Ok(Some(HoldingsResult {
            code: fund_code.to_string(),
            name,
            holdings: Vec::new(),
        }))
    }
}

/// Extracts the escaped-HTML fragment bounded by `content:"` and either the
/// `",aryLastDate` sentinel or, failing that, the last closing quote. The
/// trailing marker varies between payload revisions, hence the two variants.
fn extract_embedded_fragment(text: &str) -> Option<String> {
    let start = text.find("content:\"")? + "content:\"".len();
    let rest = &text[start..];

    if let Some(end) = rest.find("\",aryLastDate") {
        return Some(rest[..end].to_string());
    }
    let end = rest.rfind('"')?;
    if end == 0 {
        return None;
    }
    Some(rest[..end].to_string())
}

fn unescape_fragment(fragment: &str) -> String {
    fragment.replace("\\\"", "\"").replace("\\/", "/")
}

/// Column indices resolved from a holdings table's header row. The upstream
/// layout is not fixed, so each required column is located by header text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ColumnIndices {
    code: usize,
    name: usize,
    ratio: usize,
}

/// Matches the three required columns against header cell text. Returns
/// `None` when any required column is missing rather than guessing an index.
fn match_columns(headers: &[String]) -> Option<ColumnIndices> {
    let mut code = None;
    let mut name = None;
    let mut ratio = None;

    for (i, h) in headers.iter().enumerate() {
        if h.contains("代码") {
            code.get_or_insert(i);
        } else if h.contains("名称") {
            name.get_or_insert(i);
        } else if h.contains("占比") || h.contains("比例") {
            ratio.get_or_insert(i);
        }
    }

    Some(ColumnIndices {
        code: code?,
        name: name?,
        ratio: ratio?,
    })
}

/// Parses the unescaped holdings HTML. Scans every table, locates the first
/// one whose header row carries all three required columns, then reads data
/// rows in upstream order up to the top-10 cap. Rows whose ratio cell fails
/// numeric parsing are skipped.
fn parse_holdings_fragment(html: &str) -> Vec<HoldingEntry> {
    let sel_table = match Selector::parse("table") {
        Ok(s) => s,
        Err(_) => return Vec::new(),
    };
    let sel_row = match Selector::parse("tr") {
        Ok(s) => s,
        Err(_) => return Vec::new(),
    };
    let sel_cell = match Selector::parse("td, th") {
        Ok(s) => s,
        Err(_) => return Vec::new(),
    };
    let sel_data_cell = match Selector::parse("td") {
        Ok(s) => s,
        Err(_) => return Vec::new(),
    };

    let doc = Html::parse_fragment(html);

    for table in doc.select(&sel_table) {
        let mut rows = table.select(&sel_row);
        let Some(header_row) = rows.next() else {
            continue;
        };

        let headers: Vec<String> = header_row
            .select(&sel_cell)
            .map(|c| c.text().collect::<String>().trim().to_string())
            .collect();

        let Some(cols) = match_columns(&headers) else {
            continue;
        };

        let mut holdings = Vec::new();
        for row in rows {
            if holdings.len() >= MAX_HOLDINGS {
                break;
            }

            let cells: Vec<String> = row
                .select(&sel_data_cell)
                .map(|c| c.text().collect::<String>().trim().to_string())
                .collect();
            if cells.len() <= cols.code.max(cols.name).max(cols.ratio) {
                continue;
            }

            let code = cells[cols.code].clone();
            let ratio_str = cells[cols.ratio].trim_end_matches('%');
            if code.is_empty() || ratio_str.is_empty() {
                continue;
            }
            let Ok(ratio) = ratio_str.parse::<f64>() else {
                continue;
            };

            holdings.push(HoldingEntry {
                code,
                name: cells[cols.name].clone(),
                weight: ratio / 100.0,
            });
        }

        if !holdings.is_empty() {
            return holdings;
        }
    }

    Vec::new()
}

fn extract_detail_page_name(html: &str) -> Option<String> {
    let sel = Selector::parse("div.fundDetailTit h1").ok()?;
    let doc = Html::parse_document(html);
    let heading = doc.select(&sel).next()?;
    let text = heading.text().collect::<String>();
    let name = text.split('(').next()?.trim().to_string();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

/// Fund search endpoint client, used only to turn a placeholder display name
/// into the real one.
struct FundSearchClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(rename = "Datas", default)]
    datas: Vec<SearchEntry>,
}

#[derive(Debug, Deserialize)]
struct SearchEntry {
    #[serde(rename = "NAME", default)]
    name: String,
}

impl FundSearchClient {
    async fn lookup_name(&self, fund_code: &str) -> Result<Option<String>> {
        let url = format!(
            "{}/FundSearch/api/FundSearchAPI.ashx",
            self.base_url.trim_end_matches('/')
        );

        let res = self
            .http
            .get(&url)
            .query(&[("m", "1"), ("key", fund_code)])
            .send()
            .await
            .context("fund search request failed")?;

        let status = res.status();
        if !status.is_success() {
            anyhow::bail!("fund search HTTP {status}");
        }

        let body: SearchResponse = res
            .json()
            .await
            .context("failed to parse fund search response")?;

        Ok(body
            .datas
            .into_iter()
            .map(|e| e.name.trim().to_string())
            .find(|n| !n.is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_fragment_with_sentinel() {
        let payload = r#"var apidata={ content:"<table>rows<\/table>",aryLastDate:["2026-06-30"]};"#;
        let frag = extract_embedded_fragment(payload).unwrap();
        assert_eq!(frag, r"<table>rows<\/table>");
        assert_eq!(unescape_fragment(&frag), "<table>rows</table>");
    }

    #[test]
    fn extracts_fragment_without_sentinel() {
        let payload = r#"var apidata={ content:"<table>rows</table>"};"#;
        let frag = extract_embedded_fragment(payload).unwrap();
        assert_eq!(frag, "<table>rows</table>");
    }

    #[test]
    fn missing_content_yields_none() {
        assert!(extract_embedded_fragment("var apidata={};").is_none());
    }

    #[test]
    fn matches_columns_in_any_order() {
        let headers = vec![
            "序号".to_string(),
            "股票名称".to_string(),
            "股票代码".to_string(),
            "占净值比例".to_string(),
        ];
        let cols = match_columns(&headers).unwrap();
        assert_eq!(
            cols,
            ColumnIndices {
                code: 2,
                name: 1,
                ratio: 3
            }
        );
    }

    #[test]
    fn missing_required_column_is_absent_not_guessed() {
        let headers = vec!["序号".to_string(), "股票名称".to_string()];
        assert!(match_columns(&headers).is_none());
    }

    fn table_html(rows: &str) -> String {
        format!(
            "<table><tr><th>序号</th><th>股票代码</th><th>股票名称</th>\
             <th>占净值比例</th></tr>{rows}</table>"
        )
    }

    #[test]
    fn parses_rows_and_skips_bad_ratios() {
        let html = table_html(
            "<tr><td>1</td><td>600519</td><td>贵州茅台</td><td>9.85%</td></tr>\
             <tr><td>2</td><td>000858</td><td>五粮液</td><td>--</td></tr>\
             <tr><td>3</td><td>000568</td><td>泸州老窖</td><td>7.20%</td></tr>",
        );
        let holdings = parse_holdings_fragment(&html);
        assert_eq!(holdings.len(), 2);
        assert_eq!(holdings[0].code, "600519");
        assert!((holdings[0].weight - 0.0985).abs() < 1e-12);
        // Upstream order is preserved; the unparsable row is skipped, not
        // substituted.
        assert_eq!(holdings[1].code, "000568");
    }

    #[test]
    fn truncates_to_top_ten() {
        let mut rows = String::new();
        for i in 0..15 {
            rows.push_str(&format!(
                "<tr><td>{i}</td><td>60{i:04}</td><td>股票{i}</td><td>1.00%</td></tr>"
            ));
        }
        let holdings = parse_holdings_fragment(&table_html(&rows));
        assert_eq!(holdings.len(), 10);
        assert_eq!(holdings[9].code, "600009");
    }

    #[test]
    fn ignores_tables_without_required_columns() {
        let html = "<table><tr><th>日期</th><th>净值</th></tr>\
                    <tr><td>2026-06-30</td><td>1.234</td></tr></table>";
        assert!(parse_holdings_fragment(html).is_empty());
    }

    #[test]
    fn parses_search_response_shape() {
        let v = serde_json::json!({
            "Datas": [{"CODE": "161725", "NAME": "招商中证白酒指数"}],
            "ErrCode": 0
        });
        let parsed: SearchResponse = serde_json::from_value(v).unwrap();
        assert_eq!(parsed.datas.len(), 1);
        assert_eq!(parsed.datas[0].name, "招商中证白酒指数");
    }

    #[test]
    fn extracts_name_from_detail_heading() {
        let html = r#"<html><body><div class="fundDetailTit"><div>
            <h1>招商中证白酒指数(161725)</h1></div></div></body></html>"#;
        assert_eq!(
            extract_detail_page_name(html).as_deref(),
            Some("招商中证白酒指数")
        );
    }
}
