pub mod domain;
pub mod estimate;
pub mod ingest;
pub mod scheduler;
pub mod storage;
pub mod time;
pub mod track;

pub mod config {
    use anyhow::Context;

    pub const DEFAULT_QUOTE_BASE_URL: &str = "http://hq.sinajs.cn";
    pub const DEFAULT_HOLDINGS_BASE_URL: &str = "http://fundf10.eastmoney.com";
    pub const DEFAULT_FUND_SEARCH_BASE_URL: &str = "http://fundsuggest.eastmoney.com";

    #[derive(Debug, Clone)]
    pub struct Settings {
        pub database_url: Option<String>,
        pub quote_base_url: String,
        pub holdings_base_url: String,
        pub fund_search_base_url: String,
        pub sentry_dsn: Option<String>,
    }

    impl Settings {
        pub fn from_env() -> anyhow::Result<Self> {
            Ok(Self {
                database_url: std::env::var("DATABASE_URL").ok(),
                quote_base_url: std::env::var("QUOTE_BASE_URL")
                    .unwrap_or_else(|_| DEFAULT_QUOTE_BASE_URL.to_string()),
                holdings_base_url: std::env::var("HOLDINGS_BASE_URL")
                    .unwrap_or_else(|_| DEFAULT_HOLDINGS_BASE_URL.to_string()),
                fund_search_base_url: std::env::var("FUND_SEARCH_BASE_URL")
                    .unwrap_or_else(|_| DEFAULT_FUND_SEARCH_BASE_URL.to_string()),
                sentry_dsn: std::env::var("SENTRY_DSN").ok(),
            })
        }

        pub fn require_database_url(&self) -> anyhow::Result<&str> {
            self.database_url
                .as_deref()
                .context("DATABASE_URL is required")
        }
    }
}
