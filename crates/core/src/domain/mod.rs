pub mod fund;

pub use fund::{
    is_placeholder_name, placeholder_name, validate_fund_code, Fund, FundSnapshot, Holding,
    Security, SecuritySnapshot,
};
