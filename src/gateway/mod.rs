//! Usage: Remote-facing side of the vault (Kiro HTTP clients, login flow, quota cache and monitor).

pub mod account_switch;
pub mod http_errors;
pub mod oauth;
pub mod quota_cache;
pub mod quota_monitor;
pub mod retry;
pub mod token_client;
pub mod usage;
