//! Usage: Infrastructure adapters (filesystem layout, crypto, encrypted store, config).

pub mod api_config;
pub mod app_paths;
pub mod crypto;
pub mod master_key;
pub mod settings;
pub mod store;
