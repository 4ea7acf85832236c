pub mod holdings;
pub mod quotes;
pub mod types;
